//! Endpoints: one local address, one UDP socket, many connections.
//!
//! Received datagrams are demultiplexed by the engine on the destination
//! connection ID: packets for live connections become connection events,
//! Initial packets become new inbound connections when the endpoint is
//! listening, version-negotiation and stateless-reset responses come back as
//! one-shot transmits, and packets for draining or unknown connection IDs are
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::IoSliceMut;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use mio::Token;
use quinn_proto::{
    ClientConfig, ConnectionHandle, DatagramEvent, EndpointConfig, ServerConfig, TransportConfig,
    VarInt,
};
use quinn_udp::{RecvMeta, Transmit as UdpTransmit, BATCH_SIZE};
use tracing::{debug, trace, warn};

use crate::connection::{
    drive_conn, on_conn_timeout, ConnShared, Connection, ConnectionHooks, ConnectionState,
    Direction,
};
use crate::error::{Error, Result};
use crate::event_loop::{LoopHandle, LoopRc, LoopState};
use crate::tls::TlsCreds;
use crate::udp::{proto_ecn, udp_transmit, SendResult, UdpSocket};

/// Receive buffer slice per batched recvmmsg slot; large enough for a full
/// GRO bundle.
const RECV_SLICE_LEN: usize = 64 * 1024;

/// Handle to an endpoint. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) shared: Arc<EndpointShared>,
}

pub(crate) struct EndpointShared {
    pub(crate) event_loop: Arc<LoopHandle>,
    pub(crate) index: usize,
    pub(crate) local_addr: SocketAddr,
}

/// A one-shot packet (version negotiation, stateless reset, connection
/// refusal) that could not be sent immediately; drained on socket-writable.
struct OneShot {
    destination: SocketAddr,
    ecn: Option<quinn_proto::EcnCodepoint>,
    contents: Vec<u8>,
    segment_size: Option<usize>,
    src_ip: Option<IpAddr>,
}

pub(crate) struct EndpointState {
    pub(crate) local_addr: SocketAddr,
    pub(crate) socket: UdpSocket,
    pub(crate) proto: quinn_proto::Endpoint,
    pub(crate) accepting: bool,
    pub(crate) conns: HashMap<ConnectionHandle, ConnectionState>,
    pub(crate) event_loop: Arc<LoopHandle>,
    server_hooks: ConnectionHooks,
    backlog: VecDeque<OneShot>,
    recv_buf: Box<[u8]>,
}

impl Endpoint {
    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Start accepting inbound connections.
    ///
    /// Installs the server TLS context and the callback set inherited by
    /// every accepted connection. Fails if the endpoint is already listening
    /// or if `creds` are not server credentials.
    pub fn listen(&self, creds: &TlsCreds, hooks: ConnectionHooks) -> Result<()> {
        let crypto = creds.server()?;
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let mut guard = rc.borrow_mut();
            let state = &mut *guard;
            let ep = state
                .endpoints
                .get_mut(shared.index)
                .ok_or(Error::Shutdown)?;
            if ep.accepting {
                return Err(Error::AlreadyListening);
            }
            let mut config = ServerConfig::with_crypto(crypto);
            config.transport_config(Arc::new(transport_config()));
            ep.proto.set_server_config(Some(Arc::new(config)));
            ep.accepting = true;
            ep.server_hooks = hooks;
            debug!(local = %ep.local_addr, "endpoint listening");
            Ok(())
        })?
    }

    /// Open an outbound connection to `remote`.
    ///
    /// The returned handle is live immediately; streams opened (and bytes
    /// sent) before the handshake completes are buffered and flushed once it
    /// does. Connection failure is delivered through the close callback.
    pub fn connect(
        &self,
        remote: SocketAddr,
        creds: &TlsCreds,
        hooks: ConnectionHooks,
    ) -> Result<Connection> {
        let (crypto, server_name) = creds.client()?;
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let conn = {
                let mut guard = rc.borrow_mut();
                let state = &mut *guard;
                let ep = state
                    .endpoints
                    .get_mut(shared.index)
                    .ok_or(Error::Shutdown)?;
                let mut config = ClientConfig::new(crypto);
                config.transport_config(Arc::new(transport_config()));
                let (ch, proto_conn) =
                    ep.proto
                        .connect(Instant::now(), config, remote, &server_name)?;
                let conn_shared = Arc::new(ConnShared {
                    event_loop: shared.event_loop.clone(),
                    endpoint: shared.index,
                    handle: ch,
                    remote,
                    local: ep.local_addr,
                    direction: Direction::Outbound,
                    gone: AtomicBool::new(false),
                });
                let index = shared.index;
                let timer = state
                    .timers
                    .add(Box::new(move |rc| on_conn_timeout(rc, index, ch)));
                ep.conns.insert(
                    ch,
                    ConnectionState::new(conn_shared.clone(), proto_conn, hooks, timer),
                );
                debug!(%remote, "connecting");
                Connection {
                    shared: conn_shared,
                }
            };
            drive_conn(rc, shared.index, conn.shared.handle);
            Ok(conn)
        })?
    }

    /// All current connections, optionally filtered by direction.
    pub fn get_all_conns(&self, dir: Option<Direction>) -> Result<Vec<Connection>> {
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let state = rc.borrow();
            let Some(ep) = state.endpoints.get(shared.index) else {
                return Vec::new();
            };
            ep.conns
                .values()
                .filter(|conn| dir.map_or(true, |d| conn.direction() == d))
                .map(|conn| conn.public())
                .collect()
        })
    }

    /// Look up a connection by its stable id.
    pub fn get_conn(&self, id: u64) -> Result<Option<Connection>> {
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let state = rc.borrow();
            state
                .endpoints
                .get(shared.index)
                .and_then(|ep| ep.conns.get(&ConnectionHandle(id as usize)))
                .map(|conn| conn.public())
        })
    }

    /// Close every connection, optionally only those in one direction.
    pub fn close_conns(&self, dir: Option<Direction>) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .event_loop
            .call_get(move |rc| close_endpoint_conns(rc, shared.index, dir))
    }

    /// Close one connection with an application code and reason.
    pub fn close_connection(&self, conn: &Connection, code: u64, reason: &[u8]) -> Result<()> {
        conn.close(code, reason)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.shared.local_addr)
            .finish_non_exhaustive()
    }
}

/// Transport parameters used for every connection: 1 MiB connection flow
/// window, 32 concurrent bidirectional streams of 64 KiB each, no
/// unidirectional streams.
fn transport_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.max_concurrent_bidi_streams(VarInt::from_u32(32));
    config.max_concurrent_uni_streams(VarInt::from_u32(0));
    config.stream_receive_window(VarInt::from_u32(64 * 1024));
    config.receive_window(VarInt::from_u32(1024 * 1024));
    config.send_window(1024 * 1024);
    config
}

/// Create an endpoint bound to `addr` and register its socket with the loop.
pub(crate) fn create_endpoint(
    state: &mut LoopState,
    addr: SocketAddr,
    event_loop: Arc<LoopHandle>,
) -> Result<Endpoint> {
    let registry = state.poll.registry();
    let entry = state.endpoints.vacant_entry();
    let index = entry.key();
    let socket = UdpSocket::bind(addr, registry, Token(index))?;
    let local_addr = socket.local_addr()?;
    let proto = quinn_proto::Endpoint::new(Arc::new(EndpointConfig::default()), None, true, None);
    let shared = Arc::new(EndpointShared {
        event_loop: event_loop.clone(),
        index,
        local_addr,
    });
    entry.insert(EndpointState {
        local_addr,
        socket,
        proto,
        accepting: false,
        conns: HashMap::new(),
        event_loop,
        server_hooks: ConnectionHooks::default(),
        backlog: VecDeque::new(),
        recv_buf: vec![0; RECV_SLICE_LEN * BATCH_SIZE].into_boxed_slice(),
    });
    state.endpoints_by_addr.insert(local_addr, index);
    debug!(%local_addr, "endpoint created");
    Ok(Endpoint { shared })
}

pub(crate) fn close_endpoint_conns(rc: &LoopRc, index: usize, dir: Option<Direction>) {
    let handles: Vec<ConnectionHandle> = {
        let state = rc.borrow();
        state
            .endpoints
            .get(index)
            .map(|ep| {
                ep.conns
                    .iter()
                    .filter(|(_, conn)| dir.map_or(true, |d| conn.direction() == d))
                    .map(|(&ch, _)| ch)
                    .collect()
            })
            .unwrap_or_default()
    };
    for ch in handles {
        {
            let mut guard = rc.borrow_mut();
            let state = &mut *guard;
            if let Some(conn) = state
                .endpoints
                .get_mut(index)
                .and_then(|ep| ep.conns.get_mut(&ch))
            {
                conn.begin_close(0, Bytes::new());
            }
        }
        drive_conn(rc, index, ch);
    }
}

/// Socket readiness entry point, called from the loop for each I/O event.
pub(crate) fn drive_endpoint_io(rc: &LoopRc, index: usize, readable: bool, writable: bool) {
    if writable {
        flush_backlog(rc, index);
        let parked: Vec<ConnectionHandle> = {
            let state = rc.borrow();
            state
                .endpoints
                .get(index)
                .map(|ep| {
                    ep.conns
                        .iter()
                        .filter(|(_, conn)| conn.has_blocked_transmit())
                        .map(|(&ch, _)| ch)
                        .collect()
                })
                .unwrap_or_default()
        };
        for ch in parked {
            drive_conn(rc, index, ch);
        }
        let mut guard = rc.borrow_mut();
        let state = &mut *guard;
        let registry = state.poll.registry();
        if let Some(ep) = state.endpoints.get_mut(index) {
            if ep.backlog.is_empty() && ep.conns.values().all(|c| !c.has_blocked_transmit()) {
                let _ = ep.socket.set_want_write(registry, false);
            }
        }
    }
    if readable {
        loop {
            let (dirty, more) = {
                let mut guard = rc.borrow_mut();
                recv_step(&mut guard, index)
            };
            for ch in dirty {
                drive_conn(rc, index, ch);
            }
            if !more {
                break;
            }
        }
    }
}

/// Receive one batch of datagrams and feed them through the engine's
/// demultiplexer. Returns the connections touched and whether the socket may
/// hold more data.
fn recv_step(state: &mut LoopState, index: usize) -> (Vec<ConnectionHandle>, bool) {
    let mut dirty: Vec<ConnectionHandle> = Vec::new();
    let now = Instant::now();
    let registry = state.poll.registry();
    let timers = &mut state.timers;
    let Some(ep) = state.endpoints.get_mut(index) else {
        return (dirty, false);
    };

    let mut buf = std::mem::take(&mut ep.recv_buf);
    let slice_len = buf.len() / BATCH_SIZE.max(1);
    let mut metas = [RecvMeta::default(); BATCH_SIZE];
    let mut more = false;
    {
        let mut slices: Vec<IoSliceMut<'_>> =
            buf.chunks_mut(slice_len).map(IoSliceMut::new).collect();
        match ep.socket.recv(&mut slices, &mut metas) {
            Ok(count) => {
                more = count > 0;
                for (slice, meta) in slices.iter().zip(metas.iter()).take(count) {
                    let data = &slice[..meta.len];
                    let stride = if meta.stride == 0 { meta.len } else { meta.stride };
                    if stride == 0 {
                        continue;
                    }
                    for segment in data.chunks(stride) {
                        let mut response = Vec::new();
                        let event = ep.proto.handle(
                            now,
                            meta.addr,
                            meta.dst_ip,
                            proto_ecn(meta.ecn),
                            BytesMut::from(segment),
                            &mut response,
                        );
                        match event {
                            Some(DatagramEvent::ConnectionEvent(ch, conn_event)) => {
                                if let Some(conn) = ep.conns.get_mut(&ch) {
                                    conn.proto.handle_event(conn_event);
                                    if !dirty.contains(&ch) {
                                        dirty.push(ch);
                                    }
                                }
                            }
                            Some(DatagramEvent::NewConnection(incoming)) => {
                                if !ep.accepting {
                                    let transmit = ep.proto.refuse(incoming, &mut response);
                                    if ep.send_one_shot(&transmit, &response) {
                                        let _ = ep.socket.set_want_write(registry, true);
                                    }
                                    continue;
                                }
                                match ep.proto.accept(incoming, now, &mut response, None) {
                                    Ok((ch, proto_conn)) => {
                                        let conn_shared = Arc::new(ConnShared {
                                            event_loop: ep.event_loop.clone(),
                                            endpoint: index,
                                            handle: ch,
                                            remote: meta.addr,
                                            local: ep.local_addr,
                                            direction: Direction::Inbound,
                                            gone: AtomicBool::new(false),
                                        });
                                        let timer = timers.add(Box::new(move |rc| {
                                            on_conn_timeout(rc, index, ch)
                                        }));
                                        ep.conns.insert(
                                            ch,
                                            ConnectionState::new(
                                                conn_shared,
                                                proto_conn,
                                                ep.server_hooks.clone(),
                                                timer,
                                            ),
                                        );
                                        debug!(remote = %meta.addr, "accepted connection");
                                        dirty.push(ch);
                                    }
                                    Err(err) => {
                                        debug!(remote = %meta.addr, "refused connection: {}", err.cause);
                                        if let Some(transmit) = err.response {
                                            if ep.send_one_shot(&transmit, &response) {
                                                let _ =
                                                    ep.socket.set_want_write(registry, true);
                                            }
                                        }
                                    }
                                }
                            }
                            Some(DatagramEvent::Response(transmit)) => {
                                // Version negotiation or stateless reset.
                                trace!(remote = %meta.addr, "sending endpoint response");
                                if ep.send_one_shot(&transmit, &response) {
                                    let _ = ep.socket.set_want_write(registry, true);
                                }
                            }
                            None => {}
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("recv on {} failed: {e}", ep.local_addr),
        }
    }
    ep.recv_buf = buf;
    (dirty, more)
}

fn flush_backlog(rc: &LoopRc, index: usize) {
    let mut guard = rc.borrow_mut();
    let state = &mut *guard;
    let Some(ep) = state.endpoints.get_mut(index) else {
        return;
    };
    while let Some(shot) = ep.backlog.front() {
        let transmit = UdpTransmit {
            destination: shot.destination,
            ecn: shot
                .ecn
                .and_then(|ecn| quinn_udp::EcnCodepoint::from_bits(ecn as u8)),
            contents: &shot.contents,
            segment_size: shot.segment_size,
            src_ip: shot.src_ip,
        };
        match ep.socket.send(&transmit) {
            SendResult::Blocked => return,
            SendResult::Ok | SendResult::Failed => {
                ep.backlog.pop_front();
            }
        }
    }
}

impl EndpointState {
    /// Send a one-shot packet, queueing it on the backlog when the socket is
    /// full. Returns true when writable interest is needed.
    fn send_one_shot(&mut self, transmit: &quinn_proto::Transmit, buf: &[u8]) -> bool {
        let contents = &buf[..transmit.size];
        match self.socket.send(&udp_transmit(transmit, contents)) {
            SendResult::Ok | SendResult::Failed => false,
            SendResult::Blocked => {
                self.backlog.push_back(OneShot {
                    destination: transmit.destination,
                    ecn: transmit.ecn,
                    contents: contents.to_vec(),
                    segment_size: transmit.segment_size,
                    src_ip: transmit.src_ip,
                });
                true
            }
        }
    }
}
