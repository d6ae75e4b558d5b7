//! The dispatch loop: one thread, all transports, no blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::manager::ServiceManager;
use crate::transport::{ServerRpc, Transport};

/// Owns the server-side transports and the service manager, and turns
/// transport arrivals into worker handoffs. Everything here runs on the
/// dispatch thread; transports are polled, never waited on.
pub struct Dispatch {
    manager: ServiceManager,
    transports: Vec<Box<dyn Transport>>,
    incoming: Vec<ServerRpc>,
}

impl Dispatch {
    pub fn new(manager: ServiceManager) -> Self {
        Dispatch {
            manager,
            transports: Vec::new(),
            incoming: Vec::new(),
        }
    }

    pub fn add_transport(&mut self, transport: Box<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn manager_mut(&mut self) -> &mut ServiceManager {
        &mut self.manager
    }

    /// One tick: collect arrived RPCs, admit them, service the worker pool.
    /// Returns the number of observable actions, so callers can back off
    /// when the loop is idle.
    pub fn poll(&mut self) -> usize {
        let mut actions = 0;
        for transport in &mut self.transports {
            transport.poll(&mut self.incoming);
        }
        actions += self.incoming.len();
        for rpc in self.incoming.drain(..) {
            self.manager.handle_rpc(rpc);
        }
        actions += self.manager.poll();
        actions
    }

    /// Polls until `shutdown` is raised, then drains the worker pool.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Acquire) {
            if self.poll() == 0 {
                thread::yield_now();
            }
        }
        self.manager.shutdown();
    }
}
