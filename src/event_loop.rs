//! Single-threaded cooperative event loop.
//!
//! All endpoint, connection and stream state is owned by one loop thread.
//! Public handles submit jobs to the loop; a job submitted from the loop
//! thread itself runs inline so that callbacks can re-enter the API without
//! deadlocking. Each loop iteration processes expired timers, I/O readiness
//! and then the cross-thread job queue (swapped out under a mutex so enqueues
//! never block the loop).

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use tracing::{error, trace};

use crate::endpoint::EndpointState;
use crate::error::{Error, Result};

/// Token reserved for the cross-thread waker; endpoint sockets use their slab
/// index as their token.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

pub(crate) type LoopRc = Rc<RefCell<LoopState>>;
pub(crate) type Job = Box<dyn FnOnce(&LoopRc) + Send>;
pub(crate) type TimerCb = Box<dyn FnMut(&LoopRc)>;

thread_local! {
    static CURRENT: RefCell<Option<LoopRc>> = const { RefCell::new(None) };
}

/// Cross-thread face of the loop: job queue, waker and thread identity.
pub(crate) struct LoopHandle {
    jobs: Mutex<VecDeque<Job>>,
    waker: Waker,
    thread: OnceLock<ThreadId>,
    running: AtomicBool,
}

impl LoopHandle {
    pub(crate) fn in_event_loop(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueue a job for the next queue drain, never running it inline.
    pub(crate) fn call_soon(&self, job: Job) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        self.jobs.lock().unwrap().push_back(job);
        self.waker.wake()?;
        Ok(())
    }

    /// Run `f` on the loop thread; inline when already there.
    pub(crate) fn call(&self, f: impl FnOnce(&LoopRc) + Send + 'static) -> Result<()> {
        if self.in_event_loop() {
            let rc = CURRENT
                .with(|c| c.borrow().clone())
                .ok_or(Error::Shutdown)?;
            f(&rc);
            Ok(())
        } else {
            self.call_soon(Box::new(f))
        }
    }

    /// Run `f` on the loop thread and return its result, blocking the caller
    /// until the loop has committed the work. Inline fast path on the loop
    /// thread, so callbacks may use value-returning APIs freely.
    pub(crate) fn call_get<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&LoopRc) -> R + Send + 'static,
    {
        if self.in_event_loop() {
            let rc = CURRENT
                .with(|c| c.borrow().clone())
                .ok_or(Error::Shutdown)?;
            return Ok(f(&rc));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.call_soon(Box::new(move |rc| {
            let _ = tx.send(f(rc));
        }))?;
        rx.recv().map_err(|_| Error::Shutdown)
    }

    /// Stop accepting new jobs. Jobs already queued still run unless the loop
    /// exits first.
    pub(crate) fn stop_accepting(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// Cancellable, rescheduleable timer registered with [`Timers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerHandle(usize);

struct TimerSlot {
    cb: Option<TimerCb>,
    /// Bumped on every start/stop; heap entries with a stale generation are
    /// discarded when popped.
    gen: u64,
    armed: bool,
}

/// Deadline-ordered timer set with lazy cancellation.
#[derive(Default)]
pub(crate) struct Timers {
    slots: Slab<TimerSlot>,
    heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    gen: u64,
}

impl Timers {
    pub(crate) fn add(&mut self, cb: TimerCb) -> TimerHandle {
        TimerHandle(self.slots.insert(TimerSlot {
            cb: Some(cb),
            gen: 0,
            armed: false,
        }))
    }

    pub(crate) fn start(&mut self, handle: TimerHandle, delay: Duration) {
        let Some(slot) = self.slots.get_mut(handle.0) else {
            return;
        };
        self.gen += 1;
        slot.gen = self.gen;
        slot.armed = true;
        self.heap
            .push(Reverse((Instant::now() + delay, self.gen, handle.0)));
    }

    pub(crate) fn stop(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0) {
            self.gen += 1;
            slot.gen = self.gen;
            slot.armed = false;
        }
    }

    pub(crate) fn remove(&mut self, handle: TimerHandle) {
        if self.slots.contains(handle.0) {
            self.slots.remove(handle.0);
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let &Reverse((when, gen, key)) = self.heap.peek()?;
            match self.slots.get(key) {
                Some(slot) if slot.gen == gen && slot.armed => return Some(when),
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop one expired timer, disarming it. Stale heap entries are discarded
    /// along the way.
    fn pop_due(&mut self, now: Instant) -> Option<usize> {
        loop {
            let &Reverse((when, gen, key)) = self.heap.peek()?;
            match self.slots.get_mut(key) {
                Some(slot) if slot.gen == gen && slot.armed => {
                    if when > now {
                        return None;
                    }
                    self.heap.pop();
                    slot.armed = false;
                    return Some(key);
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

/// Loop-owned state. Only ever touched from the loop thread.
pub(crate) struct LoopState {
    pub(crate) handle: Arc<LoopHandle>,
    pub(crate) poll: Poll,
    pub(crate) endpoints: Slab<EndpointState>,
    pub(crate) endpoints_by_addr: HashMap<SocketAddr, usize>,
    pub(crate) timers: Timers,
    pub(crate) shutdown: bool,
}

/// Spawn the loop thread. Returns the cross-thread handle and the join
/// handle for shutdown.
pub(crate) fn spawn() -> Result<(Arc<LoopHandle>, thread::JoinHandle<()>)> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    let handle = Arc::new(LoopHandle {
        jobs: Mutex::new(VecDeque::new()),
        waker,
        thread: OnceLock::new(),
        running: AtomicBool::new(true),
    });
    let loop_handle = handle.clone();
    let thread = thread::Builder::new()
        .name("loquic-loop".into())
        .spawn(move || run(loop_handle, poll))?;
    Ok((handle, thread))
}

fn run(handle: Arc<LoopHandle>, poll: Poll) {
    let _ = handle.thread.set(thread::current().id());
    let rc: LoopRc = Rc::new(RefCell::new(LoopState {
        handle: handle.clone(),
        poll,
        endpoints: Slab::new(),
        endpoints_by_addr: HashMap::new(),
        timers: Timers::default(),
        shutdown: false,
    }));
    CURRENT.with(|c| *c.borrow_mut() = Some(rc.clone()));
    trace!("event loop started");

    let mut events = Events::with_capacity(64);
    loop {
        let timeout = {
            let mut state = rc.borrow_mut();
            if state.shutdown {
                break;
            }
            if handle.jobs.lock().unwrap().is_empty() {
                state
                    .timers
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()))
            } else {
                // Don't sleep with submitted work pending; the waker event
                // may already have been consumed.
                Some(Duration::ZERO)
            }
        };

        if let Err(e) = rc.borrow_mut().poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("event loop poll failed: {e}");
            break;
        }

        fire_timers(&rc);
        for event in events.iter() {
            let token = event.token();
            if token != WAKER_TOKEN {
                crate::endpoint::drive_endpoint_io(
                    &rc,
                    token.0,
                    event.is_readable(),
                    event.is_writable(),
                );
            }
        }
        process_jobs(&rc);

        if rc.borrow().shutdown {
            break;
        }
    }

    handle.stop_accepting();
    CURRENT.with(|c| c.borrow_mut().take());
    trace!("event loop finished");
}

/// Fire all expired timers. Each callback runs with no loop-state borrow
/// held, so it may freely re-enter the API or reschedule its own timer.
fn fire_timers(rc: &LoopRc) {
    loop {
        let due = rc.borrow_mut().timers.pop_due(Instant::now());
        let Some(key) = due else {
            break;
        };
        let cb = rc
            .borrow_mut()
            .timers
            .slots
            .get_mut(key)
            .and_then(|slot| slot.cb.take());
        if let Some(mut cb) = cb {
            cb(rc);
            let mut state = rc.borrow_mut();
            if let Some(slot) = state.timers.slots.get_mut(key) {
                if slot.cb.is_none() {
                    slot.cb = Some(cb);
                }
            }
        }
    }
}

fn process_jobs(rc: &LoopRc) {
    let jobs = {
        let handle = rc.borrow().handle.clone();
        let mut queue = handle.jobs.lock().unwrap();
        std::mem::take(&mut *queue)
    };
    for job in jobs {
        job(rc);
    }
}
