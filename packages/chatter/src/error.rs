//! Error types surfaced through the public API.

use thiserror::Error;


/// Ways chatter operations can fail.
///
/// Failures inside a connection's background tasks are not raised directly;
/// they close the connection, and callers observe [`Error::ConnectionClosed`]
/// from the next `send` or a pending `receive`. The originating reason is
/// logged when the connection enters shutdown.
#[derive(Debug, Error)]
pub enum Error {
    /// The address string is not a valid chatter address.
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    /// Underlying socket or TLS failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer did not answer a ping within the configured interval.
    #[error("ping timeout")]
    PingTimeout,

    /// The connection is closed or began closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// A payload could not be encoded or decoded against the schema
    /// repository.
    #[error("schema error: {0}")]
    Schema(#[from] sbs::error::Error),
}

pub type Result<I> = std::result::Result<I, Error>;
