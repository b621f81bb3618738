//! Non-blocking UDP socket with ECN and segmented (GSO/GRO) batched I/O.
//!
//! Thin wrapper over `quinn-udp`, whose transmit shape matches the engine's
//! output: one contiguous buffer carrying up to `max_gso_segments` datagrams
//! of `segment_size` bytes each.

use std::io::{self, IoSliceMut};
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::os::fd::AsRawFd;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use quinn_udp::{RecvMeta, Transmit, UdpSocketState};
use tracing::warn;

/// Outcome of a non-blocking send attempt.
///
/// `Blocked` leaves the caller's state untouched so the identical transmit
/// can be retried once the socket reports writable. `Failed` drops the batch;
/// the engine's loss detection recovers whatever mattered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendResult {
    Ok,
    Blocked,
    Failed,
}

pub(crate) struct UdpSocket {
    io: StdUdpSocket,
    state: UdpSocketState,
    token: Token,
    want_write: bool,
}

impl UdpSocket {
    pub(crate) fn bind(addr: SocketAddr, registry: &Registry, token: Token) -> io::Result<Self> {
        let io = StdUdpSocket::bind(addr)?;
        let state = UdpSocketState::new((&io).into())?;
        registry.register(&mut SourceFd(&io.as_raw_fd()), token, Interest::READABLE)?;
        Ok(Self {
            io,
            state,
            token,
            want_write: false,
        })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    pub(crate) fn max_gso_segments(&self) -> usize {
        self.state.max_gso_segments()
    }

    pub(crate) fn gro_segments(&self) -> usize {
        self.state.gro_segments()
    }

    pub(crate) fn send(&self, transmit: &Transmit<'_>) -> SendResult {
        match self.state.send((&self.io).into(), transmit) {
            Ok(()) => SendResult::Ok,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SendResult::Blocked,
            Err(e) => {
                warn!(dest = %transmit.destination, "dropping outgoing packet: {e}");
                SendResult::Failed
            }
        }
    }

    pub(crate) fn recv(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> io::Result<usize> {
        self.state.recv((&self.io).into(), bufs, meta)
    }

    /// Toggle writable-readiness interest, used while transmits are parked on
    /// a full socket buffer.
    pub(crate) fn set_want_write(&mut self, registry: &Registry, want: bool) -> io::Result<()> {
        if self.want_write == want {
            return Ok(());
        }
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut SourceFd(&self.io.as_raw_fd()), self.token, interest)?;
        self.want_write = want;
        Ok(())
    }
}

/// Bridge an engine transmit (metadata plus a borrowed payload) into the
/// socket layer's transmit type.
pub(crate) fn udp_transmit<'a>(
    transmit: &quinn_proto::Transmit,
    buffer: &'a [u8],
) -> Transmit<'a> {
    Transmit {
        destination: transmit.destination,
        ecn: transmit
            .ecn
            .and_then(|ecn| quinn_udp::EcnCodepoint::from_bits(ecn as u8)),
        contents: buffer,
        segment_size: transmit.segment_size,
        src_ip: transmit.src_ip,
    }
}

pub(crate) fn proto_ecn(ecn: Option<quinn_udp::EcnCodepoint>) -> Option<quinn_proto::EcnCodepoint> {
    ecn.and_then(|ecn| quinn_proto::EcnCodepoint::from_bits(ecn as u8))
}
