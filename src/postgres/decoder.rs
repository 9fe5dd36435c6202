use bytes::Buf;
use std::collections::HashMap;
use tracing::{debug, trace};

use super::types::{
    type_name_for_oid, ColumnInfo, Lsn, RelationInfo, Row, RowColumn, StreamMessage,
    UnsupportedKind,
};
use crate::{Error, Result};

/// Decodes pgoutput (protocol version 1) message bodies into [`StreamMessage`]s.
///
/// Keeps the relation cache needed to name the columns of later inserts.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the payload of one XLogData frame (without the 'w' header).
    pub fn decode(&mut self, data: &[u8]) -> Result<StreamMessage> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Err(Error::InvalidMessage {
                message: "Empty pgoutput message".to_string(),
            });
        }

        let msg_type = cursor.get_u8();

        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(cursor),
            b'I' => self.decode_insert(cursor),
            b'U' => Ok(StreamMessage::Unsupported(UnsupportedKind::Update)),
            b'D' => Ok(StreamMessage::Unsupported(UnsupportedKind::Delete)),
            b'T' => Ok(StreamMessage::Unsupported(UnsupportedKind::Truncate)),
            b'Y' => Ok(StreamMessage::Unsupported(UnsupportedKind::Type)),
            b'O' => Ok(StreamMessage::Unsupported(UnsupportedKind::Origin)),
            b'M' => Ok(StreamMessage::Unsupported(UnsupportedKind::Message)),
            other => {
                debug!("Unknown pgoutput message type: {}", other as char);
                Ok(StreamMessage::Unsupported(UnsupportedKind::Other(other)))
            }
        }
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    fn decode_begin(&mut self, mut cursor: &[u8]) -> Result<StreamMessage> {
        ensure_remaining(cursor, 20, "BEGIN")?;

        let final_lsn = Lsn(cursor.get_u64());
        let _timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        trace!("BEGIN: lsn={}, xid={}", final_lsn, xid);
        Ok(StreamMessage::Begin { xid, final_lsn })
    }

    fn decode_commit(&mut self, mut cursor: &[u8]) -> Result<StreamMessage> {
        ensure_remaining(cursor, 25, "COMMIT")?;

        let _flags = cursor.get_u8();
        let _commit_lsn = cursor.get_u64();
        let end_lsn = Lsn(cursor.get_u64());
        let _timestamp = cursor.get_i64();

        trace!("COMMIT: lsn={}", end_lsn);
        Ok(StreamMessage::Commit(end_lsn))
    }

    fn decode_relation(&mut self, mut cursor: &[u8]) -> Result<StreamMessage> {
        ensure_remaining(cursor, 4, "RELATION")?;

        let rel_id = cursor.get_u32();
        let schema = read_cstr(&mut cursor, "namespace")?;
        let table = read_cstr(&mut cursor, "relation name")?;

        ensure_remaining(cursor, 3, "RELATION")?;
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_i16().max(0) as usize;

        let mut columns = Vec::with_capacity(num_columns);

        for _ in 0..num_columns {
            ensure_remaining(cursor, 1, "RELATION column")?;
            let flags = cursor.get_u8();
            let name = read_cstr(&mut cursor, "column name")?;
            ensure_remaining(cursor, 8, "RELATION column")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();

            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: (flags & 1) != 0,
            });
        }

        let relation = RelationInfo {
            id: rel_id,
            schema,
            table,
            columns,
        };

        debug!("RELATION: {}={}.{}", rel_id, relation.schema, relation.table);
        self.relations.insert(rel_id, relation.clone());

        Ok(StreamMessage::Relation(relation))
    }

    fn decode_insert(&mut self, mut cursor: &[u8]) -> Result<StreamMessage> {
        ensure_remaining(cursor, 5, "INSERT")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();

        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in INSERT: {}", tuple_type as char),
            });
        }

        let relation = self.relations.get(&rel_id).ok_or_else(|| Error::InvalidMessage {
            message: format!("Unknown relation ID: {}", rel_id),
        })?;

        let columns = decode_tuple_data(cursor, &relation.columns)?;

        Ok(StreamMessage::Insert(Row {
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            columns,
        }))
    }
}

fn decode_tuple_data(mut cursor: &[u8], columns: &[ColumnInfo]) -> Result<Vec<RowColumn>> {
    ensure_remaining(cursor, 2, "tuple data")?;
    let num_columns = cursor.get_i16();

    if num_columns < 0 || num_columns as usize != columns.len() {
        return Err(Error::InvalidMessage {
            message: format!("Column count mismatch: {} vs {}", num_columns, columns.len()),
        });
    }

    let mut row = Vec::with_capacity(columns.len());

    for column in columns {
        ensure_remaining(cursor, 1, "tuple column")?;
        let col_type = cursor.get_u8();
        let type_name = column_type_name(column.type_id);

        let value = match col_type {
            b'n' => None,
            b't' => {
                ensure_remaining(cursor, 4, "tuple column")?;
                let len = cursor.get_i32();
                if len < 0 || cursor.remaining() < len as usize {
                    return Err(Error::InvalidMessage {
                        message: "Invalid text value length".to_string(),
                    });
                }
                let len = len as usize;
                let text = std::str::from_utf8(&cursor[..len]).map_err(|e| Error::InvalidMessage {
                    message: format!("Column '{}' is not valid UTF-8: {}", column.name, e),
                })?;
                let text = text.to_string();
                cursor.advance(len);
                Some(text)
            }
            b'u' => {
                return Err(Error::InvalidMessage {
                    message: format!(
                        "Unchanged TOAST value for column '{}' in INSERT",
                        column.name
                    ),
                });
            }
            b'b' => {
                return Err(Error::InvalidMessage {
                    message: "Binary tuple values are not requested by this client".to_string(),
                });
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown column type: {}", other as char),
                });
            }
        };

        row.push(RowColumn {
            name: column.name.clone(),
            type_name,
            value,
        });
    }

    Ok(row)
}

fn column_type_name(type_id: u32) -> String {
    type_name_for_oid(type_id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("oid:{}", type_id))
}

fn ensure_remaining(cursor: &[u8], needed: usize, what: &str) -> Result<()> {
    if cursor.remaining() < needed {
        return Err(Error::InvalidMessage {
            message: format!("Invalid {} message size", what),
        });
    }
    Ok(())
}

fn read_cstr(cursor: &mut &[u8], what: &str) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: format!("Unterminated {}", what),
        })?;
    let value = String::from_utf8_lossy(&cursor[..end]).to_string();
    cursor.advance(end + 1);
    Ok(value)
}
