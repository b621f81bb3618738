use std::io;

use thiserror::Error;

/// Application-level close code sent when the peer's handshake tag is missing
/// or malformed.
pub const ERROR_BAD_INIT: u64 = 0x547_1908;
/// Application-level close code for a failure to establish the initial
/// connection.
pub const ERROR_CONNECT: u64 = 0x547_1907;
/// Application-level close code for I/O failures on an adapted (tunneled)
/// socket. Reserved for overlays built on top of this library.
pub const ERROR_TUNNEL_IO: u64 = 0x547_1909;

/// Code delivered to a stream close callback when a user callback panicked.
pub const STREAM_ERROR_EXCEPTION: u64 = (1u64 << 62) - 2;
/// Code delivered to a stream close callback when the owning connection
/// expired. Exceeds the varint range on purpose: it is delivered locally and
/// never encoded on the wire.
pub const STREAM_ERROR_CONNECTION_EXPIRED: u64 = (1u64 << 62) + 1;

/// Errors surfaced synchronously by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// The endpoint already has an inbound TLS context installed.
    #[error("endpoint is already listening")]
    AlreadyListening,
    /// The supplied credentials do not match the requested role, e.g. client
    /// credentials passed to `listen`.
    #[error("TLS credentials have the wrong role for this operation")]
    CredentialRole,
    /// TLS configuration could not be constructed.
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
    /// The engine rejected the connection attempt.
    #[error("connect failed: {0}")]
    Connect(#[from] quinn_proto::ConnectError),
    /// The target connection has been closed or fully drained.
    #[error("connection is closed")]
    ConnectionClosed,
    /// The target stream no longer exists.
    #[error("stream is closed")]
    StreamClosed,
    /// The event loop has shut down; no further work can be submitted.
    #[error("network event loop has shut down")]
    Shutdown,
    /// An unreliable datagram exceeded the connection's current limit.
    #[error("datagram too large")]
    DatagramTooLarge,
    /// The peer does not support (or has disabled) unreliable datagrams.
    #[error("datagrams unsupported by peer")]
    DatagramUnsupported,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}
