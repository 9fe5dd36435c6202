//! pgoutput message bodies and replication frames for tests.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::types::{ColumnInfo, Lsn, RelationInfo};

/// Commit timestamp used by every generated message (2023-10-07, PostgreSQL epoch).
const COMMIT_TIME: i64 = 750_000_000_000_000;

pub fn begin(xid: u32, final_lsn: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(21);
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(COMMIT_TIME);
    buf.put_u32(xid);
    buf.freeze()
}

pub fn commit(commit_lsn: u64, end_lsn: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(26);
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(commit_lsn);
    buf.put_u64(end_lsn);
    buf.put_i64(COMMIT_TIME);
    buf.freeze()
}

pub fn relation(info: &RelationInfo) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(info.id);
    put_cstr(&mut buf, &info.schema);
    put_cstr(&mut buf, &info.table);
    buf.put_u8(b'd');
    buf.put_i16(info.columns.len() as i16);
    for column in &info.columns {
        buf.put_u8(u8::from(column.is_key));
        put_cstr(&mut buf, &column.name);
        buf.put_u32(column.type_id);
        buf.put_i32(-1);
    }
    buf.freeze()
}

/// Insert with text-format values; `None` is SQL NULL.
pub fn insert(rel_id: u32, values: &[Option<&str>]) -> Bytes {
    tuple_message(b'I', rel_id, b'N', values)
}

pub fn update(rel_id: u32, values: &[Option<&str>]) -> Bytes {
    tuple_message(b'U', rel_id, b'N', values)
}

pub fn delete(rel_id: u32, key: &str) -> Bytes {
    tuple_message(b'D', rel_id, b'K', &[Some(key)])
}

pub fn truncate(rel_ids: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'T');
    buf.put_u32(rel_ids.len() as u32);
    buf.put_u8(0);
    for id in rel_ids {
        buf.put_u32(*id);
    }
    buf.freeze()
}

/// Wraps a pgoutput body in an XLogData ('w') frame.
pub fn xlogdata_frame(wal_start: u64, wal_end: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(25 + body.len());
    buf.put_u8(b'w');
    buf.put_u64(wal_start);
    buf.put_u64(wal_end);
    buf.put_i64(COMMIT_TIME);
    buf.put(body);
    buf.freeze()
}

/// Builds a primary keepalive ('k') frame.
pub fn keepalive_frame(wal_end: u64, reply: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u8(b'k');
    buf.put_u64(wal_end);
    buf.put_i64(COMMIT_TIME);
    buf.put_u8(u8::from(reply));
    buf.freeze()
}

/// `outbox.events (id uuid, aggregate text, payload jsonb, created_at timestamptz)`
/// as relation 1.
pub fn outbox_relation() -> RelationInfo {
    relation_info(
        1,
        "outbox",
        "events",
        &[
            ("id", type_oids::UUID, true),
            ("aggregate", type_oids::TEXT, false),
            ("payload", type_oids::JSONB, false),
            ("created_at", type_oids::TIMESTAMPTZ, false),
        ],
    )
}

pub fn relation_info(
    id: u32,
    schema: &str,
    table: &str,
    columns: &[(&str, u32, bool)],
) -> RelationInfo {
    RelationInfo {
        id,
        schema: schema.to_string(),
        table: table.to_string(),
        columns: columns
            .iter()
            .map(|&(name, type_id, is_key)| ColumnInfo {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect(),
    }
}

fn tuple_message(tag: u8, rel_id: u32, tuple_kind: u8, values: &[Option<&str>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_u32(rel_id);
    buf.put_u8(tuple_kind);
    buf.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(text) => {
                buf.put_u8(b't');
                buf.put_i32(text.len() as i32);
                buf.put(text.as_bytes());
            }
            None => buf.put_u8(b'n'),
        }
    }
    buf.freeze()
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put(value.as_bytes());
    buf.put_u8(0);
}

pub mod type_oids {
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// Messages a server sends on a replication connection.
pub mod backend {
    use bytes::{BufMut, Bytes, BytesMut};

    pub fn authentication_ok() -> Bytes {
        message(b'R', &0i32.to_be_bytes())
    }

    pub fn ready_for_query() -> Bytes {
        message(b'Z', b"I")
    }

    /// Text-typed result columns.
    pub fn row_description(names: &[&str]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i16(names.len() as i16);
        for name in names {
            body.put(name.as_bytes());
            body.put_u8(0);
            body.put_u32(0); // table oid
            body.put_i16(0); // column number
            body.put_u32(25); // text
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(0); // text format
        }
        message(b'T', &body)
    }

    pub fn data_row(values: &[Option<&str>]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(text) => {
                    body.put_i32(text.len() as i32);
                    body.put(text.as_bytes());
                }
                None => body.put_i32(-1),
            }
        }
        message(b'D', &body)
    }

    pub fn command_complete(tag: &str) -> Bytes {
        let mut body = BytesMut::from(tag.as_bytes());
        body.put_u8(0);
        message(b'C', &body)
    }

    /// Text format, no columns.
    pub fn copy_both_response() -> Bytes {
        message(b'W', &[0, 0, 0])
    }

    pub fn error_response(text: &str) -> Bytes {
        let mut body = BytesMut::new();
        for (field, value) in [(b'S', "ERROR"), (b'C', "42704"), (b'M', text)] {
            body.put_u8(field);
            body.put(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        message(b'E', &body)
    }

    pub fn copy_data(payload: &[u8]) -> Bytes {
        message(b'd', payload)
    }

    pub fn copy_done() -> Bytes {
        message(b'c', &[])
    }

    fn message(tag: u8, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + body.len());
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.put(body);
        buf.freeze()
    }
}

/// One accepted client connection driven step by step by a test.
pub struct ScriptedServer {
    socket: TcpStream,
}

impl ScriptedServer {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.unwrap();
        Self { socket }
    }

    pub async fn send(&mut self, message: Bytes) {
        self.socket.write_all(&message).await.unwrap();
    }

    pub async fn read_startup(&mut self) -> Bytes {
        let len = self.socket.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.socket.read_exact(&mut body).await.unwrap();
        Bytes::from(body)
    }

    pub async fn read_message(&mut self) -> (u8, Bytes) {
        let tag = self.socket.read_u8().await.unwrap();
        let len = self.socket.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.socket.read_exact(&mut body).await.unwrap();
        (tag, Bytes::from(body))
    }

    pub async fn read_query(&mut self) -> String {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag, b'Q', "expected a simple query");
        String::from_utf8(body[..body.len() - 1].to_vec()).unwrap()
    }

    /// Reads a standby status update, returning the flushed position and
    /// the reply flag.
    pub async fn read_standby_status(&mut self) -> (Lsn, bool) {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag, b'd', "expected CopyData");
        assert_eq!(body.len(), 34);
        assert_eq!(body[0], b'r');
        let written = u64::from_be_bytes(body[1..9].try_into().unwrap());
        let flushed = u64::from_be_bytes(body[9..17].try_into().unwrap());
        assert_eq!(written, flushed);
        (Lsn(flushed), body[33] != 0)
    }

    /// Accepts START_REPLICATION after [`ScriptedServer::identify`].
    /// Returns the START_REPLICATION query.
    pub async fn accept_replication(&mut self) -> String {
        self.identify().await;
        let query = self.read_query().await;
        self.send(backend::copy_both_response()).await;
        query
    }

    /// Answers startup with trust authentication, then IDENTIFY_SYSTEM.
    pub async fn identify(&mut self) {
        let startup = self.read_startup().await;
        assert!(startup.windows(11).any(|w| w == b"replication"));
        self.send(backend::authentication_ok()).await;
        self.send(backend::ready_for_query()).await;

        assert_eq!(self.read_query().await, "IDENTIFY_SYSTEM");
        self.send(backend::row_description(&["systemid", "timeline", "xlogpos", "dbname"]))
            .await;
        self.send(backend::data_row(&[
            Some("7301250458423423"),
            Some("1"),
            Some("0/16B3748"),
            Some("app"),
        ]))
        .await;
        self.send(backend::command_complete("IDENTIFY_SYSTEM")).await;
        self.send(backend::ready_for_query()).await;
    }
}
