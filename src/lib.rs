//! Callback-driven QUIC transport.
//!
//! This crate wraps the [`quinn-proto`] protocol engine in a small,
//! callback-driven runtime: a [`Network`] owns a single event-loop thread on
//! which every [`Endpoint`], [`Connection`] and [`Stream`] lives. Handles are
//! cheap to clone and may be used from any thread; each operation is a job
//! submitted to the loop (run inline when already on it, so callbacks can
//! re-enter the API freely).
//!
//! An endpoint owns one UDP socket and demultiplexes received datagrams to
//! its connections by connection ID. Connections carry ordered byte streams
//! with flow-control-aware buffering, FIN/close semantics and a
//! producer-driven chunked send mode that keeps a bounded number of chunks in
//! flight, plus unreliable datagrams. The first application data exchanged on
//! every connection is an 8-byte version tag ([`HANDSHAKE_MAGIC`]) carried on
//! an internal control stream and verified by both sides.
//!
//! [`quinn-proto`]: https://docs.rs/quinn-proto
//!
//! ```no_run
//! use std::sync::Arc;
//! use loquic::{ConnectionHooks, Network, StreamDataCb, TlsCreds};
//!
//! # fn load_creds() -> loquic::Result<(TlsCreds, TlsCreds)> { unimplemented!() }
//! fn main() -> loquic::Result<()> {
//!     let (server_creds, client_creds) = load_creds()?;
//!     let net = Network::new()?;
//!
//!     let server = net.endpoint("127.0.0.1:5500".parse().unwrap())?;
//!     let mut hooks = ConnectionHooks::default();
//!     let on_data: StreamDataCb = Arc::new(|_stream, data| {
//!         println!("received {} bytes", data.len());
//!     });
//!     hooks.on_stream_data = Some(on_data);
//!     server.listen(&server_creds, hooks)?;
//!
//!     let client = net.endpoint("127.0.0.1:0".parse().unwrap())?;
//!     let conn = client.connect(
//!         "127.0.0.1:5500".parse().unwrap(),
//!         &client_creds,
//!         ConnectionHooks::default(),
//!     )?;
//!     let stream = conn.open_stream(None, None)?;
//!     stream.send(&b"hello"[..])?;
//!     stream.close(0)?;
//!
//!     net.close(true)
//! }
//! ```
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod connection;
mod endpoint;
mod error;
mod event_loop;
mod network;
mod stream;
mod tls;
mod udp;

pub use bytes::Bytes;

pub use crate::connection::{
    ConnCloseCb, ConnOpenCb, Connection, ConnectionHooks, DatagramCb, Direction,
};
pub use crate::endpoint::Endpoint;
pub use crate::error::{
    Error, Result, ERROR_BAD_INIT, ERROR_CONNECT, ERROR_TUNNEL_IO,
    STREAM_ERROR_CONNECTION_EXPIRED, STREAM_ERROR_EXCEPTION,
};
pub use crate::network::Network;
pub use crate::stream::{
    ChunkDone, ChunkProducer, Stream, StreamCloseCb, StreamDataCb, StreamOpenCb,
    STREAM_BUFFER_SIZE,
};
pub use crate::tls::{TlsCreds, DEFAULT_ALPN};

/// Eight-byte tag exchanged as the first application bytes on every
/// connection's control stream and verified by both sides, reserved for
/// future versioning.
pub const HANDSHAKE_MAGIC: [u8; 8] = *b"lokinet\x01";
