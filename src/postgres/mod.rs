pub mod client;
pub mod connection;
pub mod decoder;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::{PgOutputClient, StreamClient};
pub use connection::{ReplicationConnection, ReplicationFrame, SystemInfo};
pub use decoder::PgOutputDecoder;
pub use types::*;
