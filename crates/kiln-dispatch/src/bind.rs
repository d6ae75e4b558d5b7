//! In-process transport binding services straight to locators.
//!
//! Sessions opened through a [`BindTransport`] invoke the bound service
//! synchronously on `send`: the reply is complete before `send` returns.
//! This is the transport used by single-process clusters and by every test
//! harness; a locator with no bound service fails at session open, exactly
//! like a locator naming an unreachable host.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use kiln_wire::ServiceLocator;

use crate::service::{Rpc, Service};
use crate::transport::{PendingRpc, Session, SessionFactory, TransportError, TransportResult};

#[derive(Clone, Default)]
pub struct BindTransport {
    inner: Arc<BindInner>,
}

#[derive(Default)]
struct BindInner {
    bound: Mutex<HashMap<String, Arc<dyn Service>>>,
}

impl BindTransport {
    pub fn new() -> Self {
        BindTransport::default()
    }

    /// Binds `service` to the full locator string.
    pub fn bind(&self, locator: &str, service: Arc<dyn Service>) {
        self.inner.bound.lock().insert(locator.to_string(), service);
    }

    /// Removes a binding; sends through already-open sessions then fail.
    pub fn unbind(&self, locator: &str) {
        self.inner.bound.lock().remove(locator);
    }
}

impl SessionFactory for BindTransport {
    fn open_session(&self, locator: &ServiceLocator) -> TransportResult<Arc<dyn Session>> {
        if !self.inner.bound.lock().contains_key(locator.as_str()) {
            return Err(TransportError::NoSuchLocator(locator.as_str().to_string()));
        }
        Ok(Arc::new(BindSession {
            inner: Arc::clone(&self.inner),
            locator: locator.as_str().to_string(),
        }))
    }
}

struct BindSession {
    inner: Arc<BindInner>,
    locator: String,
}

impl std::fmt::Debug for BindSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindSession")
            .field("locator", &self.locator)
            .finish()
    }
}

impl Session for BindSession {
    fn send(&self, request: Vec<u8>) -> PendingRpc {
        let service = self.inner.bound.lock().get(&self.locator).cloned();
        let Some(service) = service else {
            return PendingRpc::completed(Err(TransportError::SessionClosed(
                self.locator.clone(),
            )));
        };
        let (pending, responder) = PendingRpc::new_pair();
        let mut rpc = Rpc::direct(
            &request,
            Box::new(move |reply| responder.complete(Ok(reply))),
        );
        service.handle(&mut rpc);
        rpc.finish();
        pending
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}
