//! Per-peer connection state and the drive cycle that moves it.
//!
//! A connection is driven entirely on the event loop: engine events are
//! polled, buffered stream data is fed to the engine, produced datagrams are
//! sent, and the retransmit timer is re-armed from the engine's expiry. User
//! callbacks are collected while the loop state is borrowed and dispatched
//! afterwards, so a callback may re-enter any API (send from a data callback,
//! start a nested chunked send from a completion callback) without
//! deadlocking.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use quinn_proto::{
    ConnectionError, ConnectionHandle, Dir, Event, FinishError, ReadError, SendDatagramError,
    StreamEvent, StreamId, VarInt, WriteError,
};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, STREAM_ERROR_CONNECTION_EXPIRED, STREAM_ERROR_EXCEPTION};
use crate::event_loop::{LoopHandle, LoopRc, LoopState, TimerHandle};
use crate::stream::{
    ChunkDone, ChunkDriver, ChunkPipeline, SendQueue, Stream, StreamCloseCb, StreamDataCb,
    StreamOpenCb, StreamShared,
};
use crate::udp::{udp_transmit, SendResult, UdpSocket};
use crate::HANDSHAKE_MAGIC;

/// Stream-data packets produced in one drive round before the connection
/// reschedules itself, so a busy sender cannot starve the loop.
const MAX_TRANSMIT_DATAGRAMS: usize = 24;

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listening endpoint.
    Inbound,
    /// Initiated by us.
    Outbound,
}

/// Handshake completed; the connection is ready for streams.
pub type ConnOpenCb = Arc<dyn Fn(&Connection) + Send + Sync>;
/// The connection entered its closing/draining state, with the close code.
pub type ConnCloseCb = Arc<dyn Fn(&Connection, u64) + Send + Sync>;
/// An unreliable datagram arrived.
pub type DatagramCb = Arc<dyn Fn(&Connection, Bytes) + Send + Sync>;

/// Callbacks installed on a connection. Inbound connections inherit the set
/// given to [`Endpoint::listen`](crate::Endpoint::listen); outbound the set
/// given to [`Endpoint::connect`](crate::Endpoint::connect). Stream-level
/// entries are defaults, overridable per stream at open time.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_open: Option<ConnOpenCb>,
    pub on_closing: Option<ConnCloseCb>,
    pub on_stream_open: Option<StreamOpenCb>,
    pub on_stream_data: Option<StreamDataCb>,
    pub on_stream_close: Option<StreamCloseCb>,
    pub on_datagram: Option<DatagramCb>,
}

/// Handle to one QUIC connection. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<ConnShared>,
}

pub(crate) struct ConnShared {
    pub(crate) event_loop: Arc<LoopHandle>,
    pub(crate) endpoint: usize,
    pub(crate) handle: ConnectionHandle,
    pub(crate) remote: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) direction: Direction,
    pub(crate) gone: AtomicBool,
}

impl Connection {
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn local_address(&self) -> SocketAddr {
        self.shared.local
    }

    /// Stable identifier of this connection within its endpoint.
    pub fn id(&self) -> u64 {
        self.shared.handle.0 as u64
    }

    /// Open a new outgoing bidirectional stream.
    ///
    /// Per-stream callbacks fall back to the connection-level defaults when
    /// `None`. If the peer's concurrent-stream limit is exhausted the stream
    /// is queued and bound once credit arrives; data sent meanwhile is
    /// buffered.
    pub fn open_stream(
        &self,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Result<Stream> {
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let stream = {
                let mut state = rc.borrow_mut();
                let conn = lookup_conn(&mut state, &shared).ok_or(Error::ConnectionClosed)?;
                if matches!(conn.phase, ConnPhase::Closing | ConnPhase::Draining) {
                    return Err(Error::ConnectionClosed);
                }
                conn.open_local_stream(data_cb, close_cb)
            };
            drive_conn(rc, shared.endpoint, shared.handle);
            Ok(stream)
        })?
    }

    /// Send an unreliable datagram on this connection.
    pub fn send_datagram(&self, data: impl Into<Bytes>) -> Result<()> {
        let data: Bytes = data.into();
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let sent = {
                let mut state = rc.borrow_mut();
                let conn = lookup_conn(&mut state, &shared).ok_or(Error::ConnectionClosed)?;
                if matches!(conn.phase, ConnPhase::Closing | ConnPhase::Draining) {
                    return Err(Error::ConnectionClosed);
                }
                match conn.proto.datagrams().send(data, true) {
                    Ok(()) => Ok(()),
                    Err(SendDatagramError::TooLarge) => Err(Error::DatagramTooLarge),
                    Err(SendDatagramError::UnsupportedByPeer | SendDatagramError::Disabled) => {
                        Err(Error::DatagramUnsupported)
                    }
                    Err(e) => {
                        warn!("datagram send failed: {e}");
                        Ok(())
                    }
                }
            };
            drive_conn(rc, shared.endpoint, shared.handle);
            sent
        })?
    }

    /// Close the connection with an application error code.
    ///
    /// A single CONNECTION_CLOSE is emitted and every open stream's close
    /// callback fires with `code`, in stream-id order. Closing an already
    /// closing or draining connection is a no-op.
    pub fn close(&self, code: u64, reason: &[u8]) -> Result<()> {
        let reason = Bytes::copy_from_slice(reason);
        let shared = self.shared.clone();
        self.shared.event_loop.call(move |rc| {
            {
                let mut state = rc.borrow_mut();
                if let Some(conn) = lookup_conn(&mut state, &shared) {
                    conn.begin_close(code, reason);
                }
            }
            drive_conn(rc, shared.endpoint, shared.handle);
        })
    }

    /// Whether the connection has reached its closing or draining state.
    pub fn is_closed(&self) -> bool {
        self.shared.gone.load(Ordering::Acquire) || !self.shared.event_loop.is_running()
    }

    /// Current smoothed round-trip estimate from the engine.
    pub fn rtt(&self) -> Result<Duration> {
        let shared = self.shared.clone();
        self.shared.event_loop.call_get(move |rc| {
            let mut state = rc.borrow_mut();
            lookup_conn(&mut state, &shared)
                .map(|conn| conn.proto.rtt())
                .ok_or(Error::ConnectionClosed)
        })?
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.handle.0)
            .field("remote", &self.shared.remote)
            .field("direction", &self.shared.direction)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    Handshaking,
    Live,
    Closing,
    Draining,
}

/// Exchange state for the 8-byte handshake tag carried on the control
/// stream: the client sends it, the server verifies and echoes it back.
#[derive(Default)]
struct ControlStream {
    id: Option<StreamId>,
    rx: Vec<u8>,
    tx: Bytes,
    verified: bool,
}

struct StreamState {
    shared: Arc<StreamShared>,
    queue: SendQueue,
    pipeline: ChunkPipeline,
    sent_fin: bool,
    /// Engine reported the stream write-blocked; cleared on `Writable`.
    blocked: bool,
    on_data: Option<StreamDataCb>,
    on_close: Option<StreamCloseCb>,
    close_delivered: bool,
}

impl StreamState {
    fn public(&self) -> Stream {
        Stream {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct ConnectionState {
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) proto: quinn_proto::Connection,
    pub(crate) phase: ConnPhase,
    pub(crate) hooks: ConnectionHooks,
    pub(crate) timer: TimerHandle,
    streams: Slab<StreamState>,
    by_id: HashMap<StreamId, usize>,
    pending_streams: VecDeque<usize>,
    /// Transmit parked on a full socket buffer, resent on writable.
    blocked_transmit: Option<(quinn_proto::Transmit, Vec<u8>)>,
    send_buf: Vec<u8>,
    control: ControlStream,
    local_close_code: u64,
    close_delivered: bool,
}

/// A user-callback invocation collected during a drive step and dispatched
/// with no loop-state borrow held.
pub(crate) enum Action {
    StreamData {
        cb: StreamDataCb,
        stream: Stream,
        data: Bytes,
    },
    StreamOpened {
        cb: StreamOpenCb,
        stream: Stream,
    },
    StreamClosed {
        cb: StreamCloseCb,
        stream: Stream,
        code: u64,
    },
    PullChunk {
        stream: Stream,
    },
    ChunksDone {
        cb: ChunkDone,
        stream: Stream,
    },
    ConnOpened {
        cb: ConnOpenCb,
        conn: Connection,
    },
    ConnClosed {
        cb: ConnCloseCb,
        conn: Connection,
        code: u64,
    },
    Datagram {
        cb: DatagramCb,
        conn: Connection,
        data: Bytes,
    },
}

impl ConnectionState {
    pub(crate) fn new(
        shared: Arc<ConnShared>,
        proto: quinn_proto::Connection,
        hooks: ConnectionHooks,
        timer: TimerHandle,
    ) -> Self {
        Self {
            shared,
            proto,
            phase: ConnPhase::Handshaking,
            hooks,
            timer,
            streams: Slab::new(),
            by_id: HashMap::new(),
            pending_streams: VecDeque::new(),
            blocked_transmit: None,
            send_buf: Vec::new(),
            control: ControlStream::default(),
            local_close_code: 0,
            close_delivered: false,
        }
    }

    pub(crate) fn public(&self) -> Connection {
        Connection {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub(crate) fn has_blocked_transmit(&self) -> bool {
        self.blocked_transmit.is_some()
    }

    pub(crate) fn open_local_stream(
        &mut self,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Stream {
        let entry = self.streams.vacant_entry();
        let key = entry.key();
        let shared = Arc::new(StreamShared {
            conn: self.shared.clone(),
            key,
            id: OnceLock::new(),
        });
        entry.insert(StreamState {
            shared: shared.clone(),
            queue: SendQueue::new(),
            pipeline: ChunkPipeline::default(),
            sent_fin: false,
            blocked: false,
            on_data: data_cb.or_else(|| self.hooks.on_stream_data.clone()),
            on_close: close_cb.or_else(|| self.hooks.on_stream_close.clone()),
            close_delivered: false,
        });
        // Streams opened before the handshake finishes wait so the control
        // stream is always the first one the peer sees.
        if self.phase == ConnPhase::Live {
            if let Some(id) = self.proto.streams().open(Dir::Bi) {
                shared.id.set(id).ok();
                self.by_id.insert(id, key);
                trace!(stream = %id, "opened stream");
            } else {
                trace!("stream credit exhausted, queueing stream");
                self.pending_streams.push_back(key);
            }
        } else {
            self.pending_streams.push_back(key);
        }
        Stream { shared }
    }

    pub(crate) fn begin_close(&mut self, code: u64, reason: Bytes) {
        if matches!(self.phase, ConnPhase::Closing | ConnPhase::Draining) {
            return;
        }
        debug!(code, "closing connection");
        self.local_close_code = code;
        self.phase = ConnPhase::Closing;
        let code = VarInt::from_u64(code).unwrap_or(VarInt::MAX);
        self.proto.close(Instant::now(), code, reason);
    }

    fn poll_events(&mut self, actions: &mut Vec<Action>) {
        while let Some(event) = self.proto.poll() {
            match event {
                Event::HandshakeDataReady => {}
                Event::Connected => {
                    debug!(remote = %self.shared.remote, "handshake complete");
                    self.phase = ConnPhase::Live;
                    if self.direction() == Direction::Outbound {
                        self.open_control_stream();
                    }
                    self.bind_pending_streams();
                    if let Some(cb) = self.hooks.on_open.clone() {
                        actions.push(Action::ConnOpened {
                            cb,
                            conn: self.public(),
                        });
                    }
                }
                Event::ConnectionLost { reason } => self.on_lost(&reason, actions),
                Event::Stream(StreamEvent::Opened { dir }) => self.accept_streams(dir, actions),
                Event::Stream(StreamEvent::Readable { id }) => self.read_stream(id, actions),
                Event::Stream(StreamEvent::Writable { id }) => {
                    if let Some(&key) = self.by_id.get(&id) {
                        self.streams[key].blocked = false;
                    }
                }
                Event::Stream(StreamEvent::Finished { id }) => {
                    self.stream_terminal(id, 0, actions)
                }
                Event::Stream(StreamEvent::Stopped { id, error_code }) => {
                    self.stream_terminal(id, error_code.into_inner(), actions)
                }
                Event::Stream(StreamEvent::Available { dir }) => {
                    if dir == Dir::Bi {
                        self.bind_pending_streams();
                    }
                }
                Event::DatagramReceived => {
                    while let Some(data) = self.proto.datagrams().recv() {
                        if let Some(cb) = self.hooks.on_datagram.clone() {
                            actions.push(Action::Datagram {
                                cb,
                                conn: self.public(),
                                data,
                            });
                        }
                    }
                }
                Event::DatagramsUnblocked => {}
            }
        }
    }

    fn open_control_stream(&mut self) {
        if self.control.id.is_some() {
            return;
        }
        match self.proto.streams().open(Dir::Bi) {
            Some(id) => {
                trace!(stream = %id, "opened control stream");
                self.control.id = Some(id);
                self.control.tx = Bytes::from_static(&HANDSHAKE_MAGIC);
            }
            None => warn!("no stream credit available for control stream"),
        }
    }

    fn bind_pending_streams(&mut self) {
        if self.phase != ConnPhase::Live {
            return;
        }
        while let Some(&key) = self.pending_streams.front() {
            if !self.streams.contains(key) {
                self.pending_streams.pop_front();
                continue;
            }
            let Some(id) = self.proto.streams().open(Dir::Bi) else {
                break;
            };
            self.pending_streams.pop_front();
            let st = &mut self.streams[key];
            st.shared.id.set(id).ok();
            self.by_id.insert(id, key);
            trace!(stream = %id, "bound pending stream");
        }
    }

    fn accept_streams(&mut self, dir: Dir, actions: &mut Vec<Action>) {
        while let Some(id) = self.proto.streams().accept(dir) {
            if dir != Dir::Bi {
                continue;
            }
            // The first stream an accepting side sees is the peer's control
            // stream; it is consumed internally and never surfaced.
            if self.direction() == Direction::Inbound && self.control.id.is_none() {
                trace!(stream = %id, "peer opened control stream");
                self.control.id = Some(id);
                self.read_control();
                continue;
            }
            let entry = self.streams.vacant_entry();
            let key = entry.key();
            let shared = Arc::new(StreamShared {
                conn: self.shared.clone(),
                key,
                id: OnceLock::new(),
            });
            shared.id.set(id).ok();
            entry.insert(StreamState {
                shared,
                queue: SendQueue::new(),
                pipeline: ChunkPipeline::default(),
                sent_fin: false,
                blocked: false,
                on_data: self.hooks.on_stream_data.clone(),
                on_close: self.hooks.on_stream_close.clone(),
                close_delivered: false,
            });
            self.by_id.insert(id, key);
            trace!(stream = %id, "peer opened stream");
            if let Some(cb) = self.hooks.on_stream_open.clone() {
                actions.push(Action::StreamOpened {
                    cb,
                    stream: self.streams[key].public(),
                });
            }
            // Data may have arrived in the same flight that opened the
            // stream; drain it now rather than waiting for a later packet.
            self.read_stream(id, actions);
        }
    }

    fn read_stream(&mut self, id: StreamId, actions: &mut Vec<Action>) {
        if matches!(self.phase, ConnPhase::Closing | ConnPhase::Draining) {
            return;
        }
        if Some(id) == self.control.id {
            self.read_control();
            return;
        }
        let Some(&key) = self.by_id.get(&id) else {
            return;
        };
        let stream = self.streams[key].public();
        let on_data = self.streams[key].on_data.clone();
        let mut terminal = None;
        let mut recv = self.proto.recv_stream(id);
        let Ok(mut chunks) = recv.read(true) else {
            return;
        };
        loop {
            match chunks.next(usize::MAX) {
                Ok(Some(chunk)) => {
                    if let Some(cb) = on_data.clone() {
                        actions.push(Action::StreamData {
                            cb,
                            stream: stream.clone(),
                            data: chunk.bytes,
                        });
                    }
                }
                Ok(None) => {
                    terminal = Some(0);
                    break;
                }
                Err(ReadError::Blocked) => break,
                Err(ReadError::Reset(code)) => {
                    terminal = Some(code.into_inner());
                    break;
                }
                // Stream state already torn down on the engine side.
                Err(_) => {
                    terminal = Some(0);
                    break;
                }
            }
        }
        let _ = chunks.finalize();
        if let Some(code) = terminal {
            self.stream_terminal(id, code, actions);
        }
    }

    fn read_control(&mut self) {
        let Some(id) = self.control.id else {
            return;
        };
        {
            let mut recv = self.proto.recv_stream(id);
            let Ok(mut chunks) = recv.read(true) else {
                return;
            };
            while let Ok(Some(chunk)) = chunks.next(usize::MAX) {
                // Only the first few bytes matter; the tail is reserved.
                if self.control.rx.len() < 64 {
                    self.control.rx.extend_from_slice(&chunk.bytes);
                }
            }
            let _ = chunks.finalize();
        }
        if self.control.verified || self.control.rx.len() < HANDSHAKE_MAGIC.len() {
            return;
        }
        if self.control.rx[..HANDSHAKE_MAGIC.len()] == HANDSHAKE_MAGIC {
            trace!("handshake tag verified");
            self.control.verified = true;
            if self.direction() == Direction::Inbound {
                self.control.tx = Bytes::from_static(&HANDSHAKE_MAGIC);
            }
        } else {
            warn!("peer sent bad handshake tag, closing");
            self.begin_close(
                crate::error::ERROR_BAD_INIT,
                Bytes::from_static(b"bad handshake tag"),
            );
        }
    }

    /// Deliver a stream's close callback (at most once) and drop its state.
    fn stream_terminal(&mut self, id: StreamId, code: u64, actions: &mut Vec<Action>) {
        if let Some(key) = self.by_id.remove(&id) {
            self.finish_stream(key, code, actions);
        }
    }

    fn finish_stream(&mut self, key: usize, code: u64, actions: &mut Vec<Action>) {
        let Some(st) = self.streams.get_mut(key) else {
            return;
        };
        if !st.close_delivered {
            st.close_delivered = true;
            if let Some(cb) = st.on_close.clone() {
                actions.push(Action::StreamClosed {
                    cb,
                    stream: st.public(),
                    code,
                });
            }
        }
        let id = st.shared.id.get().copied();
        let sent_fin = st.sent_fin;
        self.streams.remove(key);
        self.pending_streams.retain(|&k| k != key);
        if let Some(id) = id {
            self.by_id.remove(&id);
            // Complete our send half so the engine can retire the stream and
            // replenish the peer's concurrent-stream credit.
            if !sent_fin && self.phase == ConnPhase::Live {
                let _ = self.proto.send_stream(id).finish();
            }
        }
    }

    pub(crate) fn reset_stream(&mut self, key: usize, code: u64, actions: &mut Vec<Action>) {
        if self.phase == ConnPhase::Live {
            if let Some(st) = self.streams.get(key) {
                if let Some(&id) = st.shared.id.get() {
                    let _ = self
                        .proto
                        .send_stream(id)
                        .reset(VarInt::from_u64(code).unwrap_or(VarInt::MAX));
                }
            }
        }
        self.finish_stream(key, code, actions);
    }

    fn on_lost(&mut self, reason: &ConnectionError, actions: &mut Vec<Action>) {
        let code = match reason {
            ConnectionError::ApplicationClosed(close) => close.error_code.into_inner(),
            ConnectionError::LocallyClosed => self.local_close_code,
            ConnectionError::TimedOut => STREAM_ERROR_CONNECTION_EXPIRED,
            _ => 0,
        };
        debug!(remote = %self.shared.remote, %reason, "connection lost");
        self.phase = if matches!(reason, ConnectionError::LocallyClosed) {
            ConnPhase::Closing
        } else {
            ConnPhase::Draining
        };
        self.shared.gone.store(true, Ordering::Release);

        // Stream closes fire in stream-id order, bound streams first, then
        // still-pending ones in the order they were opened.
        let mut bound: Vec<(StreamId, usize)> =
            self.by_id.iter().map(|(&id, &key)| (id, key)).collect();
        bound.sort_by_key(|&(id, _)| id);
        for (_, key) in bound {
            self.finish_stream(key, code, actions);
        }
        let pending: Vec<usize> = self.pending_streams.drain(..).collect();
        for key in pending {
            self.finish_stream(key, code, actions);
        }

        if !self.close_delivered {
            self.close_delivered = true;
            if let Some(cb) = self.hooks.on_closing.clone() {
                actions.push(Action::ConnClosed {
                    cb,
                    conn: self.public(),
                    code,
                });
            }
        }
    }

    /// Pass one of the send pipeline: move buffered stream bytes (and FINs)
    /// into the engine, which coalesces them into datagrams. Streams that
    /// report `Blocked` wait for their `Writable` event.
    fn flush_streams(&mut self, actions: &mut Vec<Action>) {
        if self.phase != ConnPhase::Live {
            return;
        }
        self.flush_control();
        let keys: Vec<usize> = self.streams.iter().map(|(key, _)| key).collect();
        for key in keys {
            if let Some(st) = self.streams.get(key) {
                if st.pipeline.wants_pull() && !st.queue.closing {
                    actions.push(Action::PullChunk {
                        stream: st.public(),
                    });
                }
            }
            self.flush_stream(key, actions);
        }
    }

    fn flush_stream(&mut self, key: usize, actions: &mut Vec<Action>) {
        let Some(st) = self.streams.get_mut(key) else {
            return;
        };
        let Some(&id) = st.shared.id.get() else {
            return;
        };
        let mut terminal = None;

        while !st.blocked {
            let Some(front) = st.queue.front() else {
                break;
            };
            match self.proto.send_stream(id).write(front) {
                Ok(0) => break,
                Ok(n) => {
                    trace!(stream = %id, n, "engine accepted stream bytes");
                    if st.queue.advance(n) {
                        st.pipeline.chunk_retired();
                    }
                }
                Err(WriteError::Blocked) => {
                    st.blocked = true;
                    break;
                }
                Err(WriteError::Stopped(code)) => {
                    st.queue.clear();
                    terminal = Some(code.into_inner());
                    break;
                }
                Err(WriteError::ClosedStream) => {
                    st.queue.clear();
                    break;
                }
            }
        }

        if terminal.is_none() && st.queue.closing && !st.sent_fin && st.queue.is_empty() {
            match self.proto.send_stream(id).finish() {
                Ok(()) => {
                    trace!(stream = %id, "sent FIN");
                    st.sent_fin = true;
                }
                Err(FinishError::Stopped(code)) => terminal = Some(code.into_inner()),
                Err(FinishError::ClosedStream) => {}
            }
        }

        while let Some(done) = st.pipeline.take_done() {
            actions.push(Action::ChunksDone {
                cb: done,
                stream: st.public(),
            });
        }

        if let Some(code) = terminal {
            self.finish_stream(key, code, actions);
        }
    }

    fn flush_control(&mut self) {
        let Some(id) = self.control.id else {
            return;
        };
        while !self.control.tx.is_empty() {
            match self.proto.send_stream(id).write(&self.control.tx) {
                Ok(n) => self.control.tx.advance(n),
                Err(WriteError::Blocked) => break,
                Err(_) => {
                    self.control.tx = Bytes::new();
                    break;
                }
            }
        }
    }

    /// Pass two of the send pipeline: pull coalesced datagrams out of the
    /// engine (handshake, ACK and control frames included) and put them on
    /// the wire, bounded per round for fairness.
    fn flush_transmits(&mut self, socket: &UdpSocket, now: Instant, max_gso: usize) -> bool {
        if let Some((transmit, buf)) = self.blocked_transmit.take() {
            match socket.send(&udp_transmit(&transmit, &buf[..transmit.size])) {
                SendResult::Blocked => {
                    self.blocked_transmit = Some((transmit, buf));
                    return true;
                }
                SendResult::Ok | SendResult::Failed => {}
            }
        }

        let mut datagrams = 0;
        while datagrams < MAX_TRANSMIT_DATAGRAMS {
            self.send_buf.clear();
            let Some(transmit) = self
                .proto
                .poll_transmit(now, max_gso.max(1), &mut self.send_buf)
            else {
                break;
            };
            datagrams += match transmit.segment_size {
                Some(segment) if segment > 0 => transmit.size.div_ceil(segment),
                _ => 1,
            };
            match socket.send(&udp_transmit(&transmit, &self.send_buf[..transmit.size])) {
                SendResult::Ok | SendResult::Failed => {}
                SendResult::Blocked => {
                    self.blocked_transmit = Some((transmit, std::mem::take(&mut self.send_buf)));
                    return true;
                }
            }
        }

        if datagrams >= MAX_TRANSMIT_DATAGRAMS {
            let (endpoint, handle) = (self.shared.endpoint, self.shared.handle);
            let _ = self
                .shared
                .event_loop
                .call_soon(Box::new(move |rc| drive_conn(rc, endpoint, handle)));
        }
        false
    }
}

impl LoopState {
    /// One quiescence-seeking step of a connection's drive cycle. Returns the
    /// user callbacks to dispatch; an empty vector means the connection has
    /// no further work.
    pub(crate) fn conn_step(&mut self, ep: usize, ch: ConnectionHandle) -> Vec<Action> {
        let mut actions = Vec::new();
        let now = Instant::now();
        let registry = self.poll.registry();

        let Some(epst) = self.endpoints.get_mut(ep) else {
            return actions;
        };
        let socket = &mut epst.socket;
        let ep_proto = &mut epst.proto;
        let Some(conn) = epst.conns.get_mut(&ch) else {
            return actions;
        };
        let max_gso = socket.max_gso_segments();

        let mut drained = false;
        loop {
            conn.poll_events(&mut actions);
            conn.flush_streams(&mut actions);
            if conn.flush_transmits(socket, now, max_gso) {
                let _ = socket.set_want_write(registry, true);
            }
            let mut progressed = false;
            while let Some(event) = conn.proto.poll_endpoint_events() {
                progressed = true;
                drained |= event.is_drained();
                if let Some(conn_event) = ep_proto.handle_event(ch, event) {
                    conn.proto.handle_event(conn_event);
                }
            }
            if !progressed {
                break;
            }
        }

        if drained {
            trace!(remote = %conn.shared.remote, "connection drained");
            let timer = conn.timer;
            let shared = conn.shared.clone();
            epst.conns.remove(&ch);
            self.timers.remove(timer);
            shared.gone.store(true, Ordering::Release);
            return actions;
        }

        let timer = conn.timer;
        match conn.proto.poll_timeout() {
            Some(deadline) => self
                .timers
                .start(timer, deadline.saturating_duration_since(now)),
            None => self.timers.stop(timer),
        }
        actions
    }
}

/// Drive a connection to quiescence, alternating engine steps with user
/// callback dispatch.
pub(crate) fn drive_conn(rc: &LoopRc, ep: usize, ch: ConnectionHandle) {
    loop {
        let actions = rc.borrow_mut().conn_step(ep, ch);
        if actions.is_empty() {
            break;
        }
        for action in actions {
            dispatch(rc, action);
        }
    }
}

/// Retransmit/expiry timer fired: let the engine handle the deadline, then
/// drive the resulting work (probes, loss retransmission, drain deadlines).
pub(crate) fn on_conn_timeout(rc: &LoopRc, ep: usize, ch: ConnectionHandle) {
    {
        let mut state = rc.borrow_mut();
        let Some(conn) = state
            .endpoints
            .get_mut(ep)
            .and_then(|e| e.conns.get_mut(&ch))
        else {
            return;
        };
        conn.proto.handle_timeout(Instant::now());
    }
    drive_conn(rc, ep, ch);
}

fn dispatch(rc: &LoopRc, action: Action) {
    match action {
        Action::StreamData { cb, stream, data } => {
            guard_stream(rc, &stream, move |stream| cb(stream, data));
        }
        Action::StreamOpened { cb, stream } => {
            guard_stream(rc, &stream, move |stream| cb(stream));
        }
        Action::StreamClosed { cb, stream, code } => {
            // Panics here have nothing left to reset; log and move on.
            if catch_unwind(AssertUnwindSafe(|| cb(&stream, code))).is_err() {
                warn!("stream close callback panicked");
            }
        }
        Action::ChunksDone { cb, stream } => {
            guard_stream(rc, &stream, move |stream| cb(stream));
        }
        Action::PullChunk { stream } => pull_chunk(rc, &stream),
        Action::ConnOpened { cb, conn } => {
            if catch_unwind(AssertUnwindSafe(|| cb(&conn))).is_err() {
                warn!("connection open callback panicked");
            }
        }
        Action::ConnClosed { cb, conn, code } => {
            if catch_unwind(AssertUnwindSafe(|| cb(&conn, code))).is_err() {
                warn!("connection close callback panicked");
            }
        }
        Action::Datagram { cb, conn, data } => {
            if catch_unwind(AssertUnwindSafe(|| cb(&conn, data))).is_err() {
                warn!("datagram callback panicked");
            }
        }
    }
}

/// Run a stream-scoped user callback; a panic closes the stream with the
/// reserved exception code instead of unwinding through the loop.
fn guard_stream(rc: &LoopRc, stream: &Stream, f: impl FnOnce(&Stream)) {
    if catch_unwind(AssertUnwindSafe(|| f(stream))).is_err() {
        warn!("user stream callback panicked, resetting stream");
        stream_close(rc, &stream.shared, STREAM_ERROR_EXCEPTION);
    }
}

enum Pulled {
    Chunk(Bytes),
    End,
    Panicked,
}

fn pull_chunk(rc: &LoopRc, stream: &Stream) {
    let producer = {
        let mut state = rc.borrow_mut();
        match lookup_stream(&mut state, &stream.shared) {
            Some(st) => st.pipeline.take_producer(),
            None => None,
        }
    };
    let Some(mut producer) = producer else {
        return;
    };
    let pulled = match catch_unwind(AssertUnwindSafe(|| producer(stream))) {
        Ok(Some(chunk)) if !chunk.is_empty() => Pulled::Chunk(chunk),
        Ok(_) => Pulled::End,
        Err(_) => Pulled::Panicked,
    };
    {
        let mut state = rc.borrow_mut();
        let Some(st) = lookup_stream(&mut state, &stream.shared) else {
            return;
        };
        st.pipeline.put_producer(producer);
        match &pulled {
            Pulled::Chunk(chunk) => {
                st.queue.push(chunk.clone(), true);
                st.pipeline.chunk_queued();
            }
            Pulled::End | Pulled::Panicked => st.pipeline.producer_ended(),
        }
    }
    if matches!(pulled, Pulled::Panicked) {
        warn!("chunk producer panicked, resetting stream");
        stream_close(rc, &stream.shared, STREAM_ERROR_EXCEPTION);
    }
}

fn lookup_conn<'a>(
    state: &'a mut LoopState,
    shared: &Arc<ConnShared>,
) -> Option<&'a mut ConnectionState> {
    let conn = state
        .endpoints
        .get_mut(shared.endpoint)?
        .conns
        .get_mut(&shared.handle)?;
    if Arc::ptr_eq(&conn.shared, shared) {
        Some(conn)
    } else {
        None
    }
}

fn lookup_stream<'a>(
    state: &'a mut LoopState,
    shared: &Arc<StreamShared>,
) -> Option<&'a mut StreamState> {
    let st = lookup_conn(state, &shared.conn)?.streams.get_mut(shared.key)?;
    if Arc::ptr_eq(&st.shared, shared) {
        Some(st)
    } else {
        None
    }
}

pub(crate) fn stream_append(
    rc: &LoopRc,
    shared: &Arc<StreamShared>,
    data: Bytes,
) -> Result<()> {
    {
        let mut state = rc.borrow_mut();
        let Some(st) = lookup_stream(&mut state, shared) else {
            return Err(Error::StreamClosed);
        };
        if st.queue.closing {
            return Err(Error::StreamClosed);
        }
        st.queue.push(data, false);
    }
    drive_conn(rc, shared.conn.endpoint, shared.conn.handle);
    Ok(())
}

pub(crate) fn stream_start_chunks(
    rc: &LoopRc,
    shared: &Arc<StreamShared>,
    driver: ChunkDriver,
) -> Result<()> {
    {
        let mut state = rc.borrow_mut();
        let Some(st) = lookup_stream(&mut state, shared) else {
            return Err(Error::StreamClosed);
        };
        if st.queue.closing {
            return Err(Error::StreamClosed);
        }
        st.pipeline.push(driver);
    }
    drive_conn(rc, shared.conn.endpoint, shared.conn.handle);
    Ok(())
}

pub(crate) fn stream_close(rc: &LoopRc, shared: &Arc<StreamShared>, code: u64) {
    let mut actions = Vec::new();
    {
        let mut state = rc.borrow_mut();
        let Some(conn) = lookup_conn(&mut state, &shared.conn) else {
            return;
        };
        let valid = conn
            .streams
            .get(shared.key)
            .is_some_and(|st| Arc::ptr_eq(&st.shared, shared));
        if !valid {
            return;
        }
        if code == 0 {
            conn.streams[shared.key].queue.closing = true;
        } else {
            conn.reset_stream(shared.key, code, &mut actions);
        }
    }
    for action in actions {
        dispatch(rc, action);
    }
    drive_conn(rc, shared.conn.endpoint, shared.conn.handle);
}

pub(crate) fn stream_query<R: Default>(
    rc: &LoopRc,
    shared: &Arc<StreamShared>,
    f: impl FnOnce(&SendQueue) -> R,
) -> R {
    let mut state = rc.borrow_mut();
    match lookup_stream(&mut state, shared) {
        Some(st) => f(&st.queue),
        None => R::default(),
    }
}
