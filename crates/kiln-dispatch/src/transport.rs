//! Sessions, pending RPCs, and the transport registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use kiln_wire::{ServiceLocator, WireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No transport is registered for the locator's scheme.
    #[error("no transport found for this service locator: {0}")]
    NoSuchTransport(String),
    /// The transport recognized the scheme but nothing listens at the
    /// locator.
    #[error("no service at locator: {0}")]
    NoSuchLocator(String),
    /// The locator string itself was malformed.
    #[error("bad service locator: {0}")]
    BadLocator(#[from] WireError),
    /// The peer went away before replying.
    #[error("session to {0} closed")]
    SessionClosed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Completion slot shared between a [`PendingRpc`] and its responder.
struct RpcCompletion {
    slot: Mutex<Option<TransportResult<Vec<u8>>>>,
    ready: Condvar,
}

/// Handle to an RPC that has been sent but may not have completed.
///
/// The owner may poll without blocking (recovery does this across its
/// channels) or block until the reply arrives (replication `sync` does).
pub struct PendingRpc {
    completion: Arc<RpcCompletion>,
}

impl PendingRpc {
    /// Creates a pending RPC plus the responder that will complete it.
    pub fn new_pair() -> (PendingRpc, RpcResponder) {
        let completion = Arc::new(RpcCompletion {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        (
            PendingRpc {
                completion: Arc::clone(&completion),
            },
            RpcResponder { completion },
        )
    }

    /// Creates an already-completed RPC. Used by transports that fail
    /// before the request leaves the process.
    pub fn completed(result: TransportResult<Vec<u8>>) -> PendingRpc {
        let (pending, responder) = PendingRpc::new_pair();
        responder.complete(result);
        pending
    }

    pub fn is_ready(&self) -> bool {
        self.completion.slot.lock().is_some()
    }

    /// Takes the result if the RPC has completed.
    pub fn poll(&self) -> Option<TransportResult<Vec<u8>>> {
        self.completion.slot.lock().take()
    }

    /// Blocks until the RPC completes and returns the result.
    pub fn wait(self) -> TransportResult<Vec<u8>> {
        let mut slot = self.completion.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.completion.ready.wait(&mut slot);
        }
    }
}

/// Write-side of a [`PendingRpc`].
pub struct RpcResponder {
    completion: Arc<RpcCompletion>,
}

impl RpcResponder {
    pub fn complete(self, result: TransportResult<Vec<u8>>) {
        let mut slot = self.completion.slot.lock();
        *slot = Some(result);
        self.completion.ready.notify_all();
    }
}

/// Client end of a connection to one remote service.
pub trait Session: Send + Sync + fmt::Debug {
    /// Ships a fully-formed request. The returned handle completes when the
    /// reply (or a transport failure) arrives.
    fn send(&self, request: Vec<u8>) -> PendingRpc;

    /// The locator this session was opened against.
    fn locator(&self) -> &str;
}

/// Callback that delivers a finished reply back to the client side.
pub type ReplySink = Box<dyn FnOnce(Vec<u8>) + Send + 'static>;

/// A fully-received incoming request, ready for service.
pub struct ServerRpc {
    pub request: Vec<u8>,
    sink: ReplySink,
}

impl ServerRpc {
    pub fn new(request: Vec<u8>, sink: ReplySink) -> Self {
        ServerRpc { request, sink }
    }

    /// Sends `reply` back to the client and consumes the RPC.
    pub fn respond(self, reply: Vec<u8>) {
        (self.sink)(reply)
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, ReplySink) {
        (self.request, self.sink)
    }
}

/// Server end of a transport, polled by the dispatch thread. `poll` must
/// never block; it appends any requests that have fully arrived.
pub trait Transport: Send {
    fn poll(&mut self, incoming: &mut Vec<ServerRpc>);
}

/// Opens sessions for one locator scheme.
pub trait SessionFactory: Send + Sync {
    fn open_session(&self, locator: &ServiceLocator) -> TransportResult<Arc<dyn Session>>;
}

/// Resolves service locator strings to sessions.
///
/// Factories are registered per scheme; resolved sessions are cached by
/// their full locator string so repeated lookups are cheap.
#[derive(Default)]
pub struct TransportManager {
    factories: Mutex<HashMap<String, Arc<dyn SessionFactory>>>,
    sessions: Mutex<HashMap<String, Arc<dyn Session>>>,
}

impl TransportManager {
    pub fn new() -> Self {
        TransportManager::default()
    }

    pub fn register(&self, scheme: &str, factory: Arc<dyn SessionFactory>) {
        self.factories.lock().insert(scheme.to_string(), factory);
    }

    pub fn get_session(&self, locator: &str) -> TransportResult<Arc<dyn Session>> {
        if let Some(session) = self.sessions.lock().get(locator) {
            return Ok(Arc::clone(session));
        }
        let parsed = ServiceLocator::parse(locator)?;
        let factory = self
            .factories
            .lock()
            .get(parsed.scheme())
            .cloned()
            .ok_or_else(|| TransportError::NoSuchTransport(locator.to_string()))?;
        let session = factory.open_session(&parsed)?;
        self.sessions
            .lock()
            .insert(locator.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Drops a cached session, forcing the next lookup to reopen it.
    pub fn flush_session(&self, locator: &str) {
        self.sessions.lock().remove(locator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_rpc_poll_and_wait() {
        let (pending, responder) = PendingRpc::new_pair();
        assert!(!pending.is_ready());
        assert!(pending.poll().is_none());
        responder.complete(Ok(vec![1, 2, 3]));
        assert!(pending.is_ready());
        assert_eq!(pending.poll().unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn pending_rpc_wait_blocks_until_complete() {
        let (pending, responder) = PendingRpc::new_pair();
        let waiter = std::thread::spawn(move || pending.wait());
        std::thread::sleep(std::time::Duration::from_millis(5));
        responder.complete(Err(TransportError::SessionClosed("x".into())));
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let manager = TransportManager::new();
        let err = manager.get_session("warp:host=nowhere").unwrap_err();
        assert!(matches!(err, TransportError::NoSuchTransport(_)));
    }
}
