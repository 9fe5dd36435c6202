use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidMessage {
            message: format!("Invalid LSN: {}", s),
        };
        let (high, low) = s.split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// One column of an inserted row, still in PostgreSQL text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowColumn {
    pub name: String,
    pub type_name: String,
    /// `None` for SQL NULL.
    pub value: Option<String>,
}

impl RowColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value: value.map(str::to_string),
        }
    }
}

/// An inserted row with its columns in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub schema: String,
    pub table: String,
    pub columns: Vec<RowColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// Logical replication message kinds the relay cannot act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedKind {
    Update,
    Delete,
    Truncate,
    Type,
    Origin,
    Message,
    Other(u8),
}

impl fmt::Display for UnsupportedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedKind::Update => f.write_str("UPDATE"),
            UnsupportedKind::Delete => f.write_str("DELETE"),
            UnsupportedKind::Truncate => f.write_str("TRUNCATE"),
            UnsupportedKind::Type => f.write_str("TYPE"),
            UnsupportedKind::Origin => f.write_str("ORIGIN"),
            UnsupportedKind::Message => f.write_str("MESSAGE"),
            UnsupportedKind::Other(tag) => write!(f, "'{}'", *tag as char),
        }
    }
}

/// A decoded logical replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Begin { xid: u32, final_lsn: Lsn },
    Insert(Row),
    /// Carries the end position of the committed transaction.
    Commit(Lsn),
    Relation(RelationInfo),
    Unsupported(UnsupportedKind),
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Begin { .. } => "BEGIN",
            StreamMessage::Insert(_) => "INSERT",
            StreamMessage::Commit(_) => "COMMIT",
            StreamMessage::Relation(_) => "RELATION",
            StreamMessage::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

/// Names of the built-in types pgoutput reports by OID.
///
/// User-defined types (enums, domains, composites) resolve to `None`.
pub fn type_name_for_oid(oid: u32) -> Option<&'static str> {
    let name = match oid {
        16 => "bool",
        17 => "bytea",
        18 => "char",
        19 => "name",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        25 => "text",
        26 => "oid",
        114 => "json",
        142 => "xml",
        650 => "cidr",
        700 => "float4",
        701 => "float8",
        790 => "money",
        829 => "macaddr",
        869 => "inet",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1083 => "time",
        1114 => "timestamp",
        1184 => "timestamptz",
        1186 => "interval",
        1266 => "timetz",
        1560 => "bit",
        1562 => "varbit",
        1700 => "numeric",
        2950 => "uuid",
        3802 => "jsonb",
        _ => return None,
    };
    Some(name)
}
