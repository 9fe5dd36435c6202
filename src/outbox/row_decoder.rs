//! Conversion of outbox rows into JSON events.
//!
//! Every PostgreSQL type the relay understands belongs to one [`TypeClass`],
//! which fixes how its text representation becomes a JSON value. Decoding
//! depends only on the column's type name and raw text, so redelivered rows
//! always produce identical events.

use serde_json::{Number, Value};
use tracing::{trace, warn};

use super::Event;
use crate::config::UnknownTypePolicy;
use crate::postgres::{Row, RowColumn};
use crate::{Error, Result};

/// How a PostgreSQL type is represented in an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    /// Booleans and numbers, embedded as JSON literals.
    Literal,
    /// `json` and `jsonb`, embedded as nested documents.
    Document,
    /// Everything kept verbatim as a JSON string.
    Text,
}

impl TypeClass {
    pub fn of(type_name: &str) -> Option<Self> {
        match type_name {
            "bool" | "bit" | "varbit" | "float4" | "float8" | "int2" | "int4" | "int8"
            | "money" | "numeric" => Some(TypeClass::Literal),
            "json" | "jsonb" => Some(TypeClass::Document),
            "char" | "bpchar" | "name" | "date" | "text" | "time" | "timestamp"
            | "timestamptz" | "timetz" | "interval" | "uuid" | "varchar" => Some(TypeClass::Text),
            _ => None,
        }
    }
}

/// Decodes a single column.
///
/// Returns `Ok(None)` when the type has no mapping and `policy` allows the
/// field to be dropped.
pub fn decode_field(column: &RowColumn, policy: UnknownTypePolicy) -> Result<Option<Value>> {
    trace!(
        "Reading column '{}' of type '{}'",
        column.name,
        column.type_name
    );

    let Some(class) = TypeClass::of(&column.type_name) else {
        return match policy {
            UnknownTypePolicy::Omit => {
                warn!(
                    column = %column.name,
                    type_name = %column.type_name,
                    "The PostgreSQL type is not supported, column omitted from event"
                );
                Ok(None)
            }
            UnknownTypePolicy::Reject => Err(Error::UnsupportedType {
                column: column.name.clone(),
                type_name: column.type_name.clone(),
            }),
        };
    };

    let Some(raw) = column.value.as_deref() else {
        return Ok(Some(Value::Null));
    };
    trace!("Value: {}", raw);

    let value = match class {
        TypeClass::Literal => parse_literal(&column.type_name, raw),
        TypeClass::Document => serde_json::from_str::<Value>(raw).map_err(|e| e.to_string()),
        TypeClass::Text => Ok(Value::String(raw.to_string())),
    };

    value.map(Some).map_err(|message| Error::TypeDecode {
        column: column.name.clone(),
        type_name: column.type_name.clone(),
        message,
    })
}

/// Decodes every column of `row` in column order.
///
/// Returns the event and the number of columns omitted.
pub fn decode_row(row: &Row, policy: UnknownTypePolicy) -> Result<(Event, usize)> {
    let mut event = Event::new();
    let mut omitted = 0;

    for column in &row.columns {
        match decode_field(column, policy)? {
            Some(value) => {
                event.insert(column.name.clone(), value);
            }
            None => omitted += 1,
        }
    }

    Ok((event, omitted))
}

fn parse_literal(type_name: &str, raw: &str) -> std::result::Result<Value, String> {
    match type_name {
        "bool" => match raw {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{}' is not a boolean", raw)),
        },
        "bit" | "varbit" => parse_bits(raw),
        "int2" | "int4" | "int8" => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("'{}' is not an integer: {}", raw, e)),
        "money" => {
            // Negative amounts print as "-$5.00" or, in some locales, "($5.00)"
            let negative = raw.starts_with('-') || (raw.starts_with('(') && raw.ends_with(')'));
            let digits: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if negative {
                parse_number(&format!("-{}", digits))
            } else {
                parse_number(&digits)
            }
        }
        _ => parse_number(raw),
    }
}

/// Bit strings up to 64 bits become integers, longer or empty ones stay text.
fn parse_bits(raw: &str) -> std::result::Result<Value, String> {
    if !raw.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(format!("'{}' is not a bit string", raw));
    }
    if raw.is_empty() || raw.len() > 64 {
        return Ok(Value::String(raw.to_string()));
    }
    u64::from_str_radix(raw, 2)
        .map(Value::from)
        .map_err(|e| format!("'{}' is not a bit string: {}", raw, e))
}

/// Keeps every digit; `Number` holds the original text.
fn parse_number(raw: &str) -> std::result::Result<Value, String> {
    serde_json::from_str::<Number>(raw)
        .map(Value::Number)
        .map_err(|_| format!("'{}' is not a JSON number", raw))
}
