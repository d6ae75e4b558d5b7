//! A queued in-process transport for exercising the full dispatch path.
//!
//! Unlike [`crate::bind::BindTransport`], requests sent here are not served
//! inline: they land in a queue that the dispatch thread drains through
//! [`Transport::poll`], flow through admission and a worker handoff, and
//! complete asynchronously from the caller's point of view.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{PendingRpc, ServerRpc, Session, Transport};

/// Creates a connected transport/connector pair.
pub fn pair(locator: &str) -> (LoopbackTransport, LoopbackConnector) {
    let inbox = Arc::new(Mutex::new(VecDeque::new()));
    (
        LoopbackTransport {
            inbox: Arc::clone(&inbox),
        },
        LoopbackConnector {
            inbox,
            locator: locator.to_string(),
        },
    )
}

/// Server half: owned by the dispatch loop.
pub struct LoopbackTransport {
    inbox: Arc<Mutex<VecDeque<ServerRpc>>>,
}

impl Transport for LoopbackTransport {
    fn poll(&mut self, incoming: &mut Vec<ServerRpc>) {
        let mut inbox = self.inbox.lock();
        incoming.extend(inbox.drain(..));
    }
}

/// Client half: hands out sessions that enqueue onto the transport.
#[derive(Clone)]
pub struct LoopbackConnector {
    inbox: Arc<Mutex<VecDeque<ServerRpc>>>,
    locator: String,
}

impl LoopbackConnector {
    pub fn session(&self) -> Arc<dyn Session> {
        Arc::new(LoopbackSession {
            inbox: Arc::clone(&self.inbox),
            locator: self.locator.clone(),
        })
    }
}

struct LoopbackSession {
    inbox: Arc<Mutex<VecDeque<ServerRpc>>>,
    locator: String,
}

impl std::fmt::Debug for LoopbackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSession")
            .field("locator", &self.locator)
            .finish()
    }
}

impl Session for LoopbackSession {
    fn send(&self, request: Vec<u8>) -> PendingRpc {
        let (pending, responder) = PendingRpc::new_pair();
        let rpc = ServerRpc::new(
            request,
            Box::new(move |reply| responder.complete(Ok(reply))),
        );
        self.inbox.lock().push_back(rpc);
        pending
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}
