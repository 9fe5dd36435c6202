use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{self, ChannelBinding, ScramSha256};
use postgres_protocol::message::backend::{ErrorFields, Message};
use postgres_protocol::message::frontend;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::config::{Host, SslMode};
use tokio_postgres::Config;
use tracing::{debug, info, trace, warn};

use super::types::Lsn;
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// A connection in `replication=database` mode speaking the streaming
/// replication sub-protocol directly over the socket.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    slot_name: String,
    publication_name: String,
    streaming: bool,
}

impl ReplicationConnection {
    pub async fn connect(
        config: &Config,
        slot_name: String,
        publication_name: String,
    ) -> Result<Self> {
        info!("Creating replication connection to PostgreSQL");

        if matches!(config.get_ssl_mode(), SslMode::Require) {
            return Err(Error::Config(
                "sslmode=require is not supported by the replication client".to_string(),
            ));
        }

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            Some(_) => {
                return Err(Error::Config(
                    "only TCP hosts are supported for replication".to_string(),
                ))
            }
            None => "localhost".to_string(),
        };
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .ok_or_else(|| Error::Config("no user configured for replication".to_string()))?
            .to_string();
        let database = config.get_dbname().unwrap_or(&user).to_string();
        let application_name = config.get_application_name().unwrap_or("pg-outbox").to_string();
        let password = config.get_password().map(<[u8]>::to_vec);
        let connect_timeout = config
            .get_connect_timeout()
            .copied()
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| Error::Connection(format!("timed out connecting to {}:{}", host, port)))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(1024),
            slot_name,
            publication_name,
            streaming: false,
        };

        frontend::startup_message(
            [
                ("user", user.as_str()),
                ("database", database.as_str()),
                ("replication", "database"),
                ("application_name", application_name.as_str()),
            ],
            &mut conn.write_buf,
        )?;
        conn.flush_writes().await?;

        conn.authenticate(&user, password.as_deref()).await?;
        conn.wait_for_ready().await?;

        info!(%host, port, %database, "Successfully connected to PostgreSQL in replication mode");
        Ok(conn)
    }

    async fn authenticate(&mut self, user: &str, password: Option<&[u8]>) -> Result<()> {
        let require_password = || {
            password.ok_or_else(|| {
                Error::Authentication(
                    "server requested a password but none was configured".to_string(),
                )
            })
        };

        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => {
                    debug!("Authentication succeeded");
                    return Ok(());
                }
                Message::AuthenticationCleartextPassword => {
                    frontend::password_message(require_password()?, &mut self.write_buf)?;
                    self.flush_writes().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hash =
                        authentication::md5_hash(user.as_bytes(), require_password()?, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush_writes().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut scram_offered = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            scram_offered = true;
                        }
                    }
                    if !scram_offered {
                        return Err(Error::Authentication(
                            "server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    self.authenticate_scram(require_password()?).await?;
                }
                Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(error_message(body.fields())?));
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message during authentication".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &[u8]) -> Result<()> {
        let mut scram = ScramSha256::new(password, ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush_writes().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslContinue(body) => scram.update(body.data())?,
            Message::ErrorResponse(body) => {
                return Err(Error::Authentication(error_message(body.fields())?))
            }
            _ => return Err(Error::Protocol("expected SASL continue message".to_string())),
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush_writes().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
            Message::ErrorResponse(body) => {
                return Err(Error::Authentication(error_message(body.fields())?))
            }
            _ => return Err(Error::Protocol("expected SASL final message".to_string())),
        }

        Ok(())
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ErrorResponse(body) => {
                    return Err(Error::Protocol(error_message(body.fields())?))
                }
                Message::NoticeResponse(body) => {
                    warn!("PostgreSQL notice: {}", error_message(body.fields())?)
                }
                _ => {}
            }
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        frontend::query("IDENTIFY_SYSTEM", &mut self.write_buf)?;
        self.flush_writes().await?;

        let mut names: Vec<String> = Vec::new();
        let mut values: Option<Vec<Option<String>>> = None;

        loop {
            match self.read_message().await? {
                Message::RowDescription(body) => {
                    names = body.fields().map(|f| Ok(f.name().to_string())).collect()?;
                }
                Message::DataRow(body) => {
                    let buffer = body.buffer();
                    values = Some(
                        body.ranges()
                            .map(|range| {
                                Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).to_string()))
                            })
                            .collect()?,
                    );
                }
                Message::ReadyForQuery(_) => break,
                Message::ErrorResponse(body) => {
                    return Err(Error::Protocol(error_message(body.fields())?))
                }
                _ => {}
            }
        }

        let values = values.ok_or_else(|| Error::Replication {
                message: "Failed to get system info".to_string(),
            })?;
        let get = |column: &str| {
            names
                .iter()
                .position(|name| name == column)
                .and_then(|i| values.get(i).cloned().flatten())
        };

        let info = SystemInfo {
            system_id: get("systemid").unwrap_or_else(|| "unknown".to_string()),
            timeline: get("timeline").and_then(|t| t.parse().ok()).unwrap_or(1),
            xlogpos: get("xlogpos")
                .and_then(|p| p.parse().ok())
                .unwrap_or(Lsn::ZERO),
            dbname: get("dbname"),
        };

        debug!("System info: {:?}", info);
        Ok(info)
    }

    pub async fn start_replication(&mut self, start_lsn: Lsn) -> Result<()> {
        info!("Starting replication from LSN: {}", start_lsn);

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            self.slot_name,
            start_lsn,
            self.publication_name.replace('\'', "''")
        );

        frontend::query(&query, &mut self.write_buf)?;
        self.flush_writes().await?;

        loop {
            match self.read_backend().await? {
                Backend::CopyBothResponse => {
                    self.streaming = true;
                    info!(
                        slot = %self.slot_name,
                        publication = %self.publication_name,
                        "Replication stream started"
                    );
                    return Ok(());
                }
                Backend::Message(Message::ErrorResponse(body)) => {
                    return Err(Error::Protocol(error_message(body.fields())?))
                }
                Backend::Message(Message::NoticeResponse(body)) => {
                    warn!("PostgreSQL notice: {}", error_message(body.fields())?)
                }
                Backend::Message(_) => {}
            }
        }
    }

    /// Receives the next CopyData frame, or `None` once the server ends the stream.
    ///
    /// Cancel safe: a partially received frame stays buffered.
    pub async fn recv_frame(&mut self) -> Result<Option<ReplicationFrame>> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "Replication not started".to_string(),
            });
        }

        loop {
            match self.read_message().await? {
                Message::CopyData(body) => {
                    return ReplicationFrame::parse(body.into_bytes()).map(Some)
                }
                Message::CopyDone => {
                    info!("Server ended the replication stream");
                    self.streaming = false;
                    return Ok(None);
                }
                Message::ErrorResponse(body) => {
                    return Err(Error::Protocol(error_message(body.fields())?))
                }
                Message::NoticeResponse(body) => {
                    warn!("PostgreSQL notice: {}", error_message(body.fields())?)
                }
                _ => trace!("Ignoring backend message during replication"),
            }
        }
    }

    /// Reports `lsn` as written, flushed and applied.
    pub async fn send_standby_status_update(
        &mut self,
        lsn: Lsn,
        reply_requested: bool,
    ) -> Result<()> {
        if !self.streaming {
            return Err(Error::Replication {
                message: "No active replication stream".to_string(),
            });
        }

        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn.0); // written
        payload.put_u64(lsn.0); // flushed
        payload.put_u64(lsn.0); // applied
        payload.put_i64(pg_timestamp_now());
        payload.put_u8(reply_requested as u8);

        frontend::CopyData::new(payload.freeze())?.write(&mut self.write_buf);
        self.flush_writes().await?;

        debug!("Standby status update sent for LSN {}", lsn);
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        info!("Closing replication connection");

        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
        }
        frontend::terminate(&mut self.write_buf);
        self.flush_writes().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Message> {
        match self.read_backend().await? {
            Backend::Message(message) => Ok(message),
            Backend::CopyBothResponse => Err(Error::Protocol(
                "unexpected CopyBothResponse outside of START_REPLICATION".to_string(),
            )),
        }
    }

    async fn read_backend(&mut self) -> Result<Backend> {
        loop {
            if let Some(backend) = parse_backend(&mut self.read_buf)? {
                return Ok(backend);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::Connection("server closed the connection".to_string()));
            }
        }
    }

    async fn flush_writes(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Payload of one CopyData frame on a replication connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        reply: bool,
    },
}

impl ReplicationFrame {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty message".to_string(),
            });
        }

        let tag = data.get_u8();

        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid XLogData header size".to_string(),
                    });
                }
                let wal_start = Lsn(data.get_u64());
                let wal_end = Lsn(data.get_u64());
                let _timestamp = data.get_i64();
                Ok(ReplicationFrame::XLogData {
                    wal_start,
                    wal_end,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "Invalid keepalive message size".to_string(),
                    });
                }
                let wal_end = Lsn(data.get_u64());
                let _timestamp = data.get_i64();
                let reply = data.get_u8() != 0;
                Ok(ReplicationFrame::Keepalive { wal_end, reply })
            }
            _ => Err(Error::InvalidMessage {
                message: format!("Unknown message tag: {}", tag),
            }),
        }
    }
}

fn pg_timestamp_now() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// A backend message, or the CopyBothResponse that `Message::parse` does
/// not know about.
enum Backend {
    CopyBothResponse,
    Message(Message),
}

/// Splits one complete backend message off `buf`, leaving partial input buffered.
fn parse_backend(buf: &mut BytesMut) -> Result<Option<Backend>> {
    if buf.first() != Some(&COPY_BOTH_RESPONSE_TAG) {
        return Ok(Message::parse(buf)?.map(Backend::Message));
    }
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!(
            "invalid CopyBothResponse length {}",
            len
        )));
    }
    let frame_len = 1 + len as usize;
    if buf.len() < frame_len {
        return Ok(None);
    }

    buf.advance(frame_len);
    Ok(Some(Backend::CopyBothResponse))
}

fn error_message(mut fields: ErrorFields<'_>) -> Result<String> {
    let mut severity = None;
    let mut message = None;
    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
    }
    Ok(format!(
        "{}: {}",
        severity.unwrap_or_else(|| "ERROR".to_string()),
        message.unwrap_or_else(|| "unknown server error".to_string())
    ))
}
