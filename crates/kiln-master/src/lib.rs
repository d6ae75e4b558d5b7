//! The kiln master: an in-memory tablet server for a distributed
//! key-value store.
//!
//! A master holds tablets (contiguous object-id ranges of tables) and
//! services reads, writes, creates, and removes against the objects in
//! them. Object bytes live in an append-only [`log`] of fixed-size
//! segments; the packed [`hash_table`] maps each key to the log address of
//! its current object. Durability is remote: every dirty log byte is
//! streamed to a replica set of backup servers ([`replication`]) before a
//! mutation replies, and a crashed master's partition is rebuilt by
//! fetching its segments back from those backups in parallel
//! ([`recovery`]) and replaying them with strict version ordering.
//!
//! ## Structure
//!
//! - [`hash_table`] — 8-byte packed entries, 8 per cache line, chained
//!   overflow lines; maps `(table_id, object_id)` to a 47-bit log address.
//! - [`log`] — typed, checksummed, length-prefixed entries in power-of-two
//!   segments; the source of truth for object bytes.
//! - [`table`] — the tablet map and per-table id/version state.
//! - [`master`] — the request-level operations and the RPC surface.
//! - [`replication`] / [`recovery`] — the backup write and read paths.
//! - [`coordinator`] — the contract with the (external) coordinator.
//! - [`client`] — a client stub used by tooling and the test suites.
//! - [`metrics`] — per-thread counters summed on demand.
//! - [`test_support`] — in-memory coordinator/backup fixtures.
//!
//! Mutations are serialized: the production configuration admits one
//! request at a time into the mutating path, and the state lock covers
//! configurations that admit more.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash_table;
pub mod log;
pub mod master;
pub mod metrics;
pub mod recovery;
pub mod replication;
pub mod table;
pub mod test_support;

pub use client::{ClientError, ClientResult, MasterClient};
pub use config::MasterConfig;
pub use coordinator::CoordinatorClient;
pub use error::{MasterError, MasterResult};
pub use hash_table::{AddressResolver, HashTable};
pub use log::{EntryType, Log, LogAddress};
pub use master::{reject_operation, MasterService};
pub use metrics::{collect as collect_perf_stats, PerfStats, PerfStatsSnapshot};
pub use recovery::{detect_segment_recovery_failure, FetchState, SegmentRecovery};
pub use replication::ReplicaSet;
pub use table::{Table, Tablet, TabletMap};
