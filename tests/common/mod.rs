#![allow(dead_code)]

use pg_outbox::config::{Config, OutboxConfig, PostgresConfig, SslMode};
use pg_outbox::postgres::{Lsn, Row, RowColumn, StreamClient, StreamMessage};
use pg_outbox::{Error, Result};
use std::collections::VecDeque;
use std::env;

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        publication: format!("test_outbox_pub_{}", std::process::id()),
        slot_name: format!("test_outbox_slot_{}", std::process::id()),
        connect_timeout_secs: 30,
        ssl_mode: SslMode::Disable,
    };

    let outbox = OutboxConfig {
        backoff_step_ms: 10, // Fast retries for tests
        status_interval_secs: 1,
        ..OutboxConfig::default()
    };

    Config { postgres, outbox }
}

/// What the mock does once its scripted messages run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenDrained {
    /// Report end of stream.
    End,
    /// Block until the caller gives up, like an idle replication connection.
    Pending,
}

/// In-memory stream client replaying scripted messages and recording flushes.
pub struct MockStreamClient {
    messages: VecDeque<Result<StreamMessage>>,
    when_drained: WhenDrained,
    position: Option<Lsn>,
    pub flushed: Vec<Lsn>,
}

impl MockStreamClient {
    pub fn new(messages: Vec<StreamMessage>) -> Self {
        Self {
            messages: messages.into_iter().map(Ok).collect(),
            when_drained: WhenDrained::End,
            position: None,
            flushed: Vec::new(),
        }
    }

    pub fn pending_when_drained(mut self) -> Self {
        self.when_drained = WhenDrained::Pending;
        self
    }

    pub fn then_fail(mut self, error: Error) -> Self {
        self.messages.push_back(Err(error));
        self
    }
}

impl StreamClient for MockStreamClient {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        match self.messages.pop_front() {
            Some(message) => message.map(Some),
            None => match self.when_drained {
                WhenDrained::End => Ok(None),
                WhenDrained::Pending => std::future::pending().await,
            },
        }
    }

    fn set_position(&mut self, lsn: Lsn) {
        self.position = Some(lsn);
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(lsn) = self.position {
            self.flushed.push(lsn);
        }
        Ok(())
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

pub fn begin(xid: u32) -> StreamMessage {
    StreamMessage::Begin {
        xid,
        final_lsn: Lsn(u64::from(xid) * 0x100),
    }
}

pub fn commit(lsn: u64) -> StreamMessage {
    StreamMessage::Commit(Lsn(lsn))
}

/// An `outbox.events` insert with an integer id and a JSON payload.
pub fn outbox_insert(id: i64, payload: &str) -> StreamMessage {
    let id = id.to_string();
    StreamMessage::Insert(Row {
        schema: "outbox".to_string(),
        table: "events".to_string(),
        columns: vec![
            RowColumn::new("id", "int8", Some(&id)),
            RowColumn::new("event_type", "text", Some("order_created")),
            RowColumn::new("payload", "jsonb", Some(payload)),
        ],
    })
}
