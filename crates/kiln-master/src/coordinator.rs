//! Contract with the coordinator service.
//!
//! Cluster membership and tablet assignment live elsewhere; the master only
//! needs this narrow client surface: table DDL delegation and the recovery
//! completion announcement.

use kiln_wire::rpc::TabletEntry;

use crate::error::MasterResult;

pub trait CoordinatorClient: Send + Sync {
    /// Creates the named table (idempotent), failing with `NoTableSpace`
    /// when the table space is exhausted.
    fn create_table(&self, name: &str) -> MasterResult<()>;

    /// Resolves a table name to its id, failing with `TableDoesntExist`.
    fn open_table(&self, name: &str) -> MasterResult<u32>;

    /// Drops the named table; succeeds even if it does not exist.
    fn drop_table(&self, name: &str) -> MasterResult<()>;

    /// Announces that this master now serves the given tablets after a
    /// successful recovery.
    fn tablets_recovered(&self, master_id: u64, tablets: &[TabletEntry]) -> MasterResult<()>;
}
