//! Top-level context: owns the event loop thread and the endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::info;

use crate::endpoint::{close_endpoint_conns, create_endpoint, Endpoint, EndpointShared};
use crate::error::Result;
use crate::event_loop::{self, LoopHandle};

/// The network context. Creating one spawns the event loop thread; endpoints,
/// connections and streams all live on that thread and outlive their handles
/// until the network is closed.
pub struct Network {
    handle: Arc<LoopHandle>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Network {
    pub fn new() -> Result<Self> {
        let (handle, thread) = event_loop::spawn()?;
        info!("network started");
        Ok(Self {
            handle,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }

    /// Get or create the endpoint bound to `local_addr`.
    ///
    /// Requesting an address an endpoint is already bound to returns that
    /// endpoint; port 0 always creates a new endpoint on an OS-assigned port.
    pub fn endpoint(&self, local_addr: SocketAddr) -> Result<Endpoint> {
        let handle = self.handle.clone();
        self.handle.call_get(move |rc| {
            let mut guard = rc.borrow_mut();
            let state = &mut *guard;
            if local_addr.port() != 0 {
                if let Some(&index) = state.endpoints_by_addr.get(&local_addr) {
                    return Ok(Endpoint {
                        shared: Arc::new(EndpointShared {
                            event_loop: handle.clone(),
                            index,
                            local_addr,
                        }),
                    });
                }
            }
            create_endpoint(state, local_addr, handle.clone())
        })?
    }

    /// Shut the network down and join the loop thread.
    ///
    /// A graceful close first closes every connection on every endpoint,
    /// flushing their CONNECTION_CLOSE packets; an ungraceful one just clears
    /// the endpoints and exits the loop, dropping any pending jobs. No
    /// callback fires after this returns. Closing twice is a no-op.
    pub fn close(&self, graceful: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.join();
            return Ok(());
        }
        info!(graceful, "shutting down network");
        let _ = self.handle.call_get(move |rc| {
            if graceful {
                let indices: Vec<usize> =
                    rc.borrow().endpoints.iter().map(|(index, _)| index).collect();
                for index in indices {
                    close_endpoint_conns(rc, index, None);
                }
            }
            let mut state = rc.borrow_mut();
            state.endpoints.clear();
            state.endpoints_by_addr.clear();
            state.shutdown = true;
        });
        self.handle.stop_accepting();
        let _ = self.handle.wake();
        self.join();
        Ok(())
    }

    fn join(&self) {
        if self.handle.in_event_loop() {
            // Closing from inside a callback: the loop exits on its own once
            // the current iteration finishes; it cannot join itself.
            return;
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        let _ = self.close(true);
    }
}
