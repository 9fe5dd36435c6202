//! Error types and result handling for pg-outbox.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Every variant is fatal for a running monitor: the relay stops and is
//! expected to be restarted, resuming from the position last confirmed to
//! the replication slot. Handler failures that are still within the retry
//! budget never surface as an [`Error`].
//!
//! # Example
//!
//! ```rust
//! use pg_outbox::Error;
//!
//! fn exit_code(error: &Error) -> i32 {
//!     match error {
//!         // Nothing was acknowledged, a restart redelivers the transaction
//!         Error::HandlerExhausted { .. } => 75,
//!         Error::Config(_) => 78,
//!         _ => 1,
//!     }
//! }
//!
//! let error = Error::Config("publication name must not be empty".to_string());
//! assert_eq!(exit_code(&error), 78);
//! ```

use thiserror::Error;

/// The main error type for pg-outbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from an invalid file, environment variable or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error, typically from connection string parsing.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error on the replication socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Error reported by the server, or a message arriving out of order
    /// in the replication stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A literal or document column whose text could not be parsed.
    #[error("Failed to decode column '{column}' of type '{type_name}': {message}")]
    TypeDecode {
        /// Column name
        column: String,
        /// PostgreSQL type name
        type_name: String,
        /// Parser diagnostic
        message: String,
    },

    /// A column of a type with no mapping, raised only in strict mode.
    #[error("Unsupported PostgreSQL type '{type_name}' for column '{column}'")]
    UnsupportedType {
        /// Column name
        column: String,
        /// PostgreSQL type name
        type_name: String,
    },

    /// The handler failed on every attempt for one transaction.
    #[error("Handler failed {attempts} time(s) for transaction at {lsn}: {last_error}")]
    HandlerExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Commit position of the undelivered transaction
        lsn: String,
        /// Last handler error
        last_error: anyhow::Error,
    },
}

/// A convenient Result type alias for pg-outbox operations.
///
/// This is equivalent to `std::result::Result<T, pg_outbox::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
