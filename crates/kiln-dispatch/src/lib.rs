//! RPC dispatch for kiln servers.
//!
//! The threading model is a single *dispatch thread* that owns every
//! transport and all admission state, plus a pool of *worker threads* that
//! execute one RPC at a time. Dispatch never blocks: it polls transports for
//! arrived requests, hands them to workers through a single-slot exchange
//! guarded by an atomic state word, and sends replies as workers finish.
//! Workers spin briefly waiting for work, then park on the state word until
//! the next handoff wakes them.
//!
//! Client-side plumbing lives here too: [`Session`]s resolved from service
//! locator strings by the [`TransportManager`], returning [`PendingRpc`]
//! completion handles that callers may poll or block on.

pub mod bind;
pub mod dispatch;
pub mod loopback;
pub mod manager;
pub mod service;
pub mod transport;
pub mod worker;

pub use bind::BindTransport;
pub use dispatch::Dispatch;
pub use manager::{ServiceManager, ServiceManagerConfig};
pub use service::{error_reply, Rpc, Service};
pub use transport::{
    PendingRpc, ServerRpc, Session, Transport, TransportError, TransportManager, TransportResult,
};
