//! Per-service admission and the worker pool.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use kiln_wire::{RequestHeader, Status};

use crate::service::{error_reply, Service};
use crate::transport::ServerRpc;
use crate::worker::{WorkItem, Worker, POSTPROCESSING, WORKING};

/// Tuning knobs for the worker pool.
#[derive(Debug, Clone)]
pub struct ServiceManagerConfig {
    /// How long a worker keeps spinning for new work before it parks.
    /// Should be much longer than a typical request interarrival gap so an
    /// ongoing conversation never pays the wakeup cost.
    pub poll_window: Duration,
}

impl Default for ServiceManagerConfig {
    fn default() -> Self {
        ServiceManagerConfig {
            poll_window: Duration::from_micros(100),
        }
    }
}

struct ServiceSlot {
    service: Arc<dyn Service>,
    max_threads: usize,
    requests_running: usize,
    waiting: VecDeque<ServerRpc>,
}

/// Routes incoming RPCs to registered services, enforcing each service's
/// concurrency cap and queueing the overflow in arrival order. Owned and
/// driven exclusively by the dispatch thread.
pub struct ServiceManager {
    config: ServiceManagerConfig,
    services: HashMap<u16, ServiceSlot>,
    busy: Vec<Worker>,
    idle: Vec<Worker>,
    spawned: usize,
}

impl ServiceManager {
    pub fn new(config: ServiceManagerConfig) -> Self {
        ServiceManager {
            config,
            services: HashMap::new(),
            busy: Vec::new(),
            idle: Vec::new(),
            spawned: 0,
        }
    }

    /// Registers a service; incoming RPCs whose header names `service_id`
    /// are dispatched to it, at most `max_threads` concurrently.
    pub fn add_service(&mut self, service_id: u16, service: Arc<dyn Service>, max_threads: usize) {
        debug_assert!(max_threads >= 1);
        let previous = self.services.insert(
            service_id,
            ServiceSlot {
                service,
                max_threads,
                requests_running: 0,
                waiting: VecDeque::new(),
            },
        );
        debug_assert!(previous.is_none(), "service id registered twice");
    }

    /// Accepts an incoming RPC: replies immediately on header errors,
    /// queues it if the service is at its cap, otherwise hands it to a
    /// worker.
    pub fn handle_rpc(&mut self, rpc: ServerRpc) {
        let service_id = match RequestHeader::peek_service(&rpc.request) {
            Ok(id) => id,
            Err(_) => {
                warn!(len = rpc.request.len(), "incoming rpc has no header");
                rpc.respond(error_reply(Status::MessageTooShort));
                return;
            }
        };
        let Some(slot) = self.services.get_mut(&service_id) else {
            warn!(service_id, "incoming rpc requested unavailable service");
            rpc.respond(error_reply(Status::ServiceNotAvailable));
            return;
        };

        if slot.requests_running >= slot.max_threads {
            slot.waiting.push_back(rpc);
            return;
        }
        slot.requests_running += 1;
        let service = Arc::clone(&slot.service);

        let mut worker = match self.idle.pop() {
            Some(worker) => worker,
            None => {
                let worker = Worker::spawn(self.spawned, self.config.poll_window);
                self.spawned += 1;
                worker
            }
        };
        worker.service_id = service_id;
        worker.shared.handoff(WorkItem::Rpc { service, rpc });
        worker.busy_index = self.busy.len();
        self.busy.push(worker);
    }

    /// One dispatch tick over the busy workers. Returns how many replies
    /// were sent or handoffs performed.
    ///
    /// Iteration runs in reverse index order so a worker can be retired
    /// mid-loop by swapping it with the last element without disturbing the
    /// remaining iterations.
    pub fn poll(&mut self) -> usize {
        let mut actions = 0;
        for index in (0..self.busy.len()).rev() {
            debug_assert_eq!(self.busy[index].busy_index, index);
            let state = self.busy[index].shared.state();
            if state == WORKING {
                continue;
            }

            // Worker is postprocessing or idle; if its reply hasn't been
            // sent yet, send it now.
            if let Some((reply, sink)) = self.busy[index].shared.take_reply() {
                sink(reply);
                actions += 1;
            }

            if state == POSTPROCESSING {
                continue;
            }

            let service_id = self.busy[index].service_id;
            let slot = self
                .services
                .get_mut(&service_id)
                .expect("busy worker belongs to an unregistered service");
            if let Some(next) = slot.waiting.pop_front() {
                let service = Arc::clone(&slot.service);
                self.busy[index]
                    .shared
                    .handoff(WorkItem::Rpc { service, rpc: next });
                actions += 1;
            } else {
                let mut worker = self.busy.swap_remove(index);
                if index < self.busy.len() {
                    self.busy[index].busy_index = index;
                }
                worker.busy_index = usize::MAX;
                self.idle.push(worker);
                slot.requests_running -= 1;
            }
        }
        actions
    }

    /// True when no RPC is executing or awaiting a worker.
    pub fn idle(&self) -> bool {
        self.busy.is_empty()
            && self
                .services
                .values()
                .all(|slot| slot.waiting.is_empty())
    }

    /// Drains the busy workers, then retires every worker through the
    /// exit-sentinel handoff and joins it.
    pub fn shutdown(&mut self) {
        while !self.busy.is_empty() {
            self.poll();
            std::hint::spin_loop();
        }
        for worker in self.idle.drain(..) {
            worker.exit();
        }
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
