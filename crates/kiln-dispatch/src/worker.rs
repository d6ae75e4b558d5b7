//! Worker threads and the dispatch/worker handoff.
//!
//! Each worker is driven by a single atomic state word. Dispatch installs a
//! work item and swaps the state to `WORKING`; the worker executes the RPC,
//! publishes the reply, and drops back to `POLLING`. A worker that polls for
//! longer than the configured window parks itself: it CASes
//! `POLLING -> SLEEPING` (the compare-exchange closes the race against a
//! concurrent handoff) and blocks on the state word's condvar until the next
//! handoff wakes it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use kiln_wire::Status;

use crate::service::{error_reply, Rpc, Service};
use crate::transport::{ReplySink, ServerRpc};

/// Worker has no assigned RPC and is watching its state word.
pub const POLLING: u32 = 0;
/// Dispatch has handed the worker an RPC that is still executing.
pub const WORKING: u32 = 1;
/// The reply is ready for dispatch to send; the worker is still doing
/// post-reply bookkeeping.
pub const POSTPROCESSING: u32 = 2;
/// The worker gave up polling and is parked on the state word.
pub const SLEEPING: u32 = 3;

/// What dispatch hands to a worker.
pub enum WorkItem {
    Rpc {
        service: Arc<dyn Service>,
        rpc: ServerRpc,
    },
    /// Sentinel delivered through the normal handoff path during shutdown.
    Exit,
}

/// State shared between one worker thread and the dispatch thread.
pub struct WorkerShared {
    state: AtomicU32,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
    /// Dispatch -> worker. Written only while the worker is not `WORKING`.
    inbox: Mutex<Option<WorkItem>>,
    /// Worker -> dispatch. Read only while the worker is not `WORKING`.
    outbox: Mutex<Option<(Vec<u8>, ReplySink)>>,
}

impl WorkerShared {
    fn new() -> Arc<Self> {
        Arc::new(WorkerShared {
            state: AtomicU32::new(POLLING),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
            inbox: Mutex::new(None),
            outbox: Mutex::new(None),
        })
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Installs a work item and transfers the worker to `WORKING`, waking it
    /// if it went to sleep. Must only be called when the worker is idle from
    /// dispatch's point of view (no outstanding item).
    pub fn handoff(&self, item: WorkItem) {
        {
            let mut inbox = self.inbox.lock();
            debug_assert!(inbox.is_none(), "handoff to a worker with a pending item");
            *inbox = Some(item);
        }
        let previous = self.state.swap(WORKING, Ordering::AcqRel);
        if previous == SLEEPING {
            // The worker got tired of polling; wake it through the condvar
            // attached to the state word.
            let _guard = self.sleep_lock.lock();
            self.wakeup.notify_one();
        }
    }

    /// Called from the worker (via [`Rpc`]) to make the reply visible to
    /// dispatch. With `postprocessing` set the state word moves to
    /// `POSTPROCESSING` immediately so dispatch can send the reply while the
    /// handler finishes up.
    pub(crate) fn publish_reply(&self, reply: Vec<u8>, sink: ReplySink, postprocessing: bool) {
        *self.outbox.lock() = Some((reply, sink));
        if postprocessing {
            self.state.store(POSTPROCESSING, Ordering::Release);
        }
    }

    /// Dispatch side: takes the finished reply, if one is waiting.
    pub(crate) fn take_reply(&self) -> Option<(Vec<u8>, ReplySink)> {
        self.outbox.lock().take()
    }
}

/// Dispatch-side record of one worker thread.
pub struct Worker {
    pub shared: Arc<WorkerShared>,
    pub thread: Option<JoinHandle<()>>,
    /// Service the current (or most recent) RPC belongs to.
    pub service_id: u16,
    /// Index in the busy vector, or `usize::MAX` when idle.
    pub busy_index: usize,
}

impl Worker {
    /// Spawns a worker thread polling for handoffs.
    pub fn spawn(index: usize, poll_window: Duration) -> Worker {
        let shared = WorkerShared::new();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("kiln-worker-{index}"))
            .spawn(move || worker_main(thread_shared, poll_window))
            .expect("failed to spawn worker thread");
        Worker {
            shared,
            thread: Some(thread),
            service_id: 0,
            busy_index: usize::MAX,
        }
    }

    /// Sends the exit sentinel and joins the thread. Must only be called
    /// when the worker is idle.
    pub fn exit(mut self) {
        self.shared.handoff(WorkItem::Exit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_main(shared: Arc<WorkerShared>, poll_window: Duration) {
    debug!(thread = ?thread::current().name(), "worker started");
    loop {
        let stop_polling = Instant::now() + poll_window;
        while shared.state.load(Ordering::Acquire) != WORKING {
            if Instant::now() >= stop_polling {
                if shared
                    .state
                    .compare_exchange(POLLING, SLEEPING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let mut guard = shared.sleep_lock.lock();
                    while shared.state.load(Ordering::Acquire) == SLEEPING {
                        shared.wakeup.wait(&mut guard);
                    }
                }
            } else {
                std::hint::spin_loop();
            }
        }

        let item = shared.inbox.lock().take();
        match item {
            Some(WorkItem::Exit) => {
                shared.state.store(POLLING, Ordering::Release);
                break;
            }
            Some(WorkItem::Rpc { service, rpc }) => {
                let (request, sink) = rpc.into_parts();
                let mut rpc = Rpc::on_worker(&request, sink, &shared);
                // Handlers are expected to turn every failure into a status
                // code; a panic must still not unwind past the worker.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    service.handle(&mut rpc)
                }));
                if outcome.is_err() {
                    error!("rpc handler panicked");
                    *rpc.reply_mut() = error_reply(Status::Internal);
                }
                rpc.finish();
                shared.state.store(POLLING, Ordering::Release);
            }
            None => {
                // Spurious transition with no item; nothing to do.
                shared.state.store(POLLING, Ordering::Release);
            }
        }
    }
    debug!(thread = ?thread::current().name(), "worker exiting");
}
