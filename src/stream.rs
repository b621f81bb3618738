//! Ordered byte streams.
//!
//! A [`Stream`] handle is cheap to clone and safe to use from any thread;
//! every operation is forwarded to the owning connection's event loop. Bytes
//! are staged in a per-stream send queue until the engine accepts them into
//! its (flow-control-bounded) retransmission buffer, so `available()` drops
//! to zero once 64 KiB are outstanding and recovers as the peer acknowledges
//! data.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes};
use quinn_proto::StreamId;

use crate::connection::{self, ConnShared, Connection};
use crate::error::Result;

/// Bytes delivered in offset order for one stream.
pub type StreamDataCb = Arc<dyn Fn(&Stream, Bytes) + Send + Sync>;
/// Stream closure, fired exactly once with the application error code
/// (0 for a clean FIN).
pub type StreamCloseCb = Arc<dyn Fn(&Stream, u64) + Send + Sync>;
/// A peer opened a new stream on an accepting connection.
pub type StreamOpenCb = Arc<dyn Fn(&Stream) + Send + Sync>;

/// Lazily produces the next chunk of a bulk transfer; `None` ends the
/// sequence. Invoked on the loop thread, must not block.
pub type ChunkProducer = Box<dyn FnMut(&Stream) -> Option<Bytes> + Send>;
/// Fired exactly once when a chunked send has fully drained.
pub type ChunkDone = Box<dyn FnOnce(&Stream) + Send>;

/// Per-stream send buffer limit; mirrors the per-stream flow control window
/// so a full queue means 64 KiB are already in flight unacknowledged.
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Handle to one ordered byte stream within a connection.
#[derive(Clone)]
pub struct Stream {
    pub(crate) shared: Arc<StreamShared>,
}

pub(crate) struct StreamShared {
    pub(crate) conn: Arc<ConnShared>,
    /// Slot in the owning connection's stream table.
    pub(crate) key: usize,
    /// Engine stream id; unset while the stream waits for stream credit.
    pub(crate) id: OnceLock<StreamId>,
}

impl Stream {
    /// The engine-assigned stream id, once the stream has been bound.
    ///
    /// Streams opened beyond the peer's concurrent-stream credit stay
    /// pending (and return `None` here) until credit arrives; anything
    /// already queued on them is flushed at that point.
    pub fn id(&self) -> Option<u64> {
        self.shared
            .id
            .get()
            .map(|id| u64::from(quinn_proto::VarInt::from(*id)))
    }

    /// The connection this stream belongs to.
    pub fn connection(&self) -> Connection {
        Connection {
            shared: self.shared.conn.clone(),
        }
    }

    /// Append bytes to the stream.
    ///
    /// The bytes are buffered (taking ownership, no copy for `Bytes` input)
    /// and drained as flow control and the congestion window allow. Delivery
    /// is in FIFO order with respect to every other `send` and chunked send
    /// on this stream. Fails with [`Error::StreamClosed`](crate::Error) once
    /// the stream is closing or gone.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let data: Bytes = data.into();
        let shared = self.shared.clone();
        self.shared
            .conn
            .event_loop
            .call_get(move |rc| connection::stream_append(rc, &shared, data))?
    }

    /// Drive `producer` to keep up to `parallel` chunks outstanding.
    ///
    /// The producer is polled on the loop thread whenever fewer than
    /// `parallel` of its chunks are unretired; returning `None` (or an empty
    /// chunk) ends the sequence. `on_done` fires exactly once after the
    /// sequence has ended and every produced byte has drained, and may itself
    /// start another chunked send on the same stream; ordering across such
    /// nesting is preserved. Fails with [`Error::StreamClosed`](crate::Error)
    /// once the stream is closing or gone.
    pub fn send_chunks(
        &self,
        producer: impl FnMut(&Stream) -> Option<Bytes> + Send + 'static,
        on_done: impl FnOnce(&Stream) + Send + 'static,
        parallel: usize,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let driver = ChunkDriver::new(Box::new(producer), Box::new(on_done), parallel);
        self.shared
            .conn
            .event_loop
            .call_get(move |rc| connection::stream_start_chunks(rc, &shared, driver))?
    }

    /// Close the stream.
    ///
    /// With `error_code == 0` the stream finishes cleanly: buffered data is
    /// flushed, a FIN is sent, and the close callback fires with 0 once
    /// everything is acknowledged. A non-zero code resets the stream
    /// immediately, discarding buffered data. Closing twice is a no-op.
    pub fn close(&self, error_code: u64) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .conn
            .event_loop
            .call(move |rc| connection::stream_close(rc, &shared, error_code))
    }

    /// Bytes of buffer space left before the stream reports full;
    /// 0 once the stream is closing.
    pub fn available(&self) -> usize {
        self.query(|q| q.available())
    }

    /// Bytes currently buffered and not yet accepted by the engine.
    pub fn used(&self) -> usize {
        self.query(|q| q.used())
    }

    /// Synonym for [`used`](Self::used): everything still buffered here has
    /// not yet been handed to the engine.
    pub fn unsent(&self) -> usize {
        self.query(|q| q.used())
    }

    pub fn is_closing(&self) -> bool {
        self.query(|q| q.closing)
    }

    fn query<R: Send + 'static>(&self, f: impl FnOnce(&SendQueue) -> R + Send + 'static) -> R
    where
        R: Default,
    {
        let shared = self.shared.clone();
        self.shared
            .conn
            .event_loop
            .call_get(move |rc| connection::stream_query(rc, &shared, f))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id.get())
            .finish_non_exhaustive()
    }
}

struct PendingChunk {
    data: Bytes,
    from_producer: bool,
}

/// FIFO of bytes awaiting engine acceptance, with the accounting the flush
/// pipeline and the public accessors rely on.
#[derive(Default)]
pub(crate) struct SendQueue {
    chunks: VecDeque<PendingChunk>,
    queued: usize,
    capacity: usize,
    pub(crate) closing: bool,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            queued: 0,
            capacity: STREAM_BUFFER_SIZE,
            closing: false,
        }
    }

    pub(crate) fn push(&mut self, data: Bytes, from_producer: bool) {
        if data.is_empty() {
            return;
        }
        self.queued += data.len();
        self.chunks.push_back(PendingChunk {
            data,
            from_producer,
        });
    }

    pub(crate) fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| c.data.as_ref())
    }

    /// Advance the head of the queue past `n` accepted bytes. Returns true
    /// when this completed a producer-originated chunk.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        let Some(front) = self.chunks.front_mut() else {
            debug_assert_eq!(n, 0);
            return false;
        };
        debug_assert!(n <= front.data.len());
        front.data.advance(n);
        self.queued -= n;
        if front.data.is_empty() {
            let from_producer = front.from_producer;
            self.chunks.pop_front();
            return from_producer;
        }
        false
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.queued = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn used(&self) -> usize {
        self.queued
    }

    pub(crate) fn available(&self) -> usize {
        if self.closing || self.capacity == 0 {
            0
        } else {
            self.capacity.saturating_sub(self.queued)
        }
    }
}

/// One `send_chunks` invocation: the producer, its completion callback and
/// the outstanding-chunk budget.
pub(crate) struct ChunkDriver {
    pub(crate) producer: Option<ChunkProducer>,
    on_done: Option<ChunkDone>,
    parallel: usize,
    outstanding: usize,
    ended: bool,
}

impl ChunkDriver {
    pub(crate) fn new(producer: ChunkProducer, on_done: ChunkDone, parallel: usize) -> Self {
        Self {
            producer: Some(producer),
            on_done: Some(on_done),
            parallel: parallel.max(1),
            outstanding: 0,
            ended: false,
        }
    }
}

/// FIFO of chunk drivers on one stream. Only the front driver pulls; drivers
/// queued behind it (including ones installed from an `on_done`) start once
/// their predecessor has fully retired.
#[derive(Default)]
pub(crate) struct ChunkPipeline {
    drivers: VecDeque<ChunkDriver>,
}

impl ChunkPipeline {
    pub(crate) fn push(&mut self, driver: ChunkDriver) {
        self.drivers.push_back(driver);
    }

    /// Whether the front driver should be polled for another chunk.
    pub(crate) fn wants_pull(&self) -> bool {
        match self.drivers.front() {
            Some(d) => !d.ended && d.producer.is_some() && d.outstanding < d.parallel,
            None => false,
        }
    }

    pub(crate) fn take_producer(&mut self) -> Option<ChunkProducer> {
        self.drivers.front_mut()?.producer.take()
    }

    pub(crate) fn put_producer(&mut self, producer: ChunkProducer) {
        if let Some(d) = self.drivers.front_mut() {
            if d.producer.is_none() {
                d.producer = Some(producer);
            }
        }
    }

    pub(crate) fn chunk_queued(&mut self) {
        if let Some(d) = self.drivers.front_mut() {
            d.outstanding += 1;
        }
    }

    pub(crate) fn producer_ended(&mut self) {
        if let Some(d) = self.drivers.front_mut() {
            d.ended = true;
        }
    }

    /// A producer chunk fully drained into the engine.
    pub(crate) fn chunk_retired(&mut self) {
        if let Some(d) = self.drivers.front_mut() {
            d.outstanding = d.outstanding.saturating_sub(1);
        }
    }

    /// If the front driver has ended and fully drained, pop it and hand back
    /// its completion callback.
    pub(crate) fn take_done(&mut self) -> Option<ChunkDone> {
        let front = self.drivers.front_mut()?;
        if front.ended && front.outstanding == 0 {
            let done = front.on_done.take();
            self.drivers.pop_front();
            done
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_accounting() {
        let mut q = SendQueue::new();
        assert_eq!(q.available(), STREAM_BUFFER_SIZE);
        q.push(Bytes::from_static(b"hello"), false);
        q.push(Bytes::from_static(b" world"), false);
        assert_eq!(q.used(), 11);
        assert_eq!(q.available(), STREAM_BUFFER_SIZE - 11);

        // Partial acceptance keeps the head chunk in place.
        assert!(!q.advance(3));
        assert_eq!(q.used(), 8);
        assert_eq!(q.front().unwrap(), b"lo");
        assert!(!q.advance(2));
        assert_eq!(q.front().unwrap(), b" world");
        assert!(!q.advance(6));
        assert!(q.is_empty());
        assert_eq!(q.used(), 0);
    }

    #[test]
    fn closing_queue_reports_no_room() {
        let mut q = SendQueue::new();
        q.push(Bytes::from_static(b"x"), false);
        q.closing = true;
        assert_eq!(q.available(), 0);
        assert_eq!(q.used(), 1);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let mut q = SendQueue::new();
        q.push(Bytes::new(), false);
        assert!(q.is_empty());
    }

    #[test]
    fn producer_chunk_retires_only_when_fully_accepted() {
        let mut q = SendQueue::new();
        q.push(Bytes::from_static(b"aaaa"), true);
        assert!(!q.advance(2));
        assert!(q.advance(2));
    }

    #[test]
    fn pipeline_bounds_outstanding_chunks() {
        let mut p = ChunkPipeline::default();
        p.push(ChunkDriver::new(
            Box::new(|_| None),
            Box::new(|_| {}),
            2,
        ));
        assert!(p.wants_pull());
        p.chunk_queued();
        assert!(p.wants_pull());
        p.chunk_queued();
        assert!(!p.wants_pull());
        p.chunk_retired();
        assert!(p.wants_pull());
    }

    #[test]
    fn done_fires_only_after_end_and_drain() {
        let mut p = ChunkPipeline::default();
        p.push(ChunkDriver::new(Box::new(|_| None), Box::new(|_| {}), 2));
        p.chunk_queued();
        p.producer_ended();
        assert!(p.take_done().is_none());
        p.chunk_retired();
        assert!(p.take_done().is_some());
        // The driver is gone; completion is delivered at most once.
        assert!(p.take_done().is_none());
    }

    #[test]
    fn queued_driver_waits_for_predecessor() {
        let mut p = ChunkPipeline::default();
        p.push(ChunkDriver::new(Box::new(|_| None), Box::new(|_| {}), 1));
        p.push(ChunkDriver::new(Box::new(|_| None), Box::new(|_| {}), 1));
        p.chunk_queued();
        p.producer_ended();
        // Front driver still draining: no pulls for the queued one.
        assert!(!p.wants_pull());
        p.chunk_retired();
        assert!(p.take_done().is_some());
        assert!(p.wants_pull());
    }

    #[test]
    fn parallel_zero_is_clamped() {
        let mut p = ChunkPipeline::default();
        p.push(ChunkDriver::new(Box::new(|_| None), Box::new(|_| {}), 0));
        assert!(p.wants_pull());
        p.chunk_queued();
        assert!(!p.wants_pull());
    }
}
