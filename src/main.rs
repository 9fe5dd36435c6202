use clap::Parser;
use pg_outbox::{handler_fn, CancellationToken, Config, Event, OutboxMonitor, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Relays outbox rows from a PostgreSQL replication slot, printing each
/// committed transaction as one JSON array per line on stdout.
#[derive(Parser, Debug)]
#[command(name = "pg-outbox", version)]
struct Args {
    /// TOML configuration file; PG_OUTBOX_<SECTION>__<KEY> variables override it
    #[arg(short, long, value_name = "FILE", default_value = "pg-outbox.toml")]
    config: PathBuf,

    /// Emit logs as JSON on stderr
    #[arg(short, long)]
    json_logs: bool,

    /// Debug logging for pg-outbox
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs, args.verbose);

    let config = Config::from_file(&args.config).inspect_err(|e| {
        error!(path = ?args.config, "Failed to load configuration: {}", e);
    })?;

    info!(
        host = %config.postgres.host,
        port = config.postgres.port,
        database = %config.postgres.database,
        publication = %config.postgres.publication,
        slot = %config.postgres.slot_name,
        max_attempts = config.outbox.max_attempts(),
        "Starting pg-outbox"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let monitor = OutboxMonitor::new(config, handler_fn(print_events));
    let stats = monitor.run_with_config(&cancel).await.inspect_err(|e| {
        error!("pg-outbox stopped with a fatal error: {}", e);
    })?;

    info!(
        transactions = stats.transactions,
        delivered = stats.delivered,
        last_acknowledged = ?stats.last_acknowledged.map(|lsn| lsn.to_string()),
        "pg-outbox stopped"
    );
    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Received Ctrl+C, finishing the current transaction");
    cancel.cancel();
}

async fn print_events(events: Vec<Event>, _cancel: CancellationToken) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(&events)?);
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_outbox=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_outbox=info,warn"))
    };

    // stdout carries the events, so logs go to stderr
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
