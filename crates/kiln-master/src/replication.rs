//! Backup replication client.
//!
//! Every dirty byte range of the log head is pushed to the full replica set
//! as `WriteSegment` RPCs; the log's `sync` does not return until each
//! replica has acknowledged, so a mutation's reply implies the bytes are
//! durable at every backup. Transient transport failures are retried a
//! bounded number of times per replica before the operation surfaces a
//! retryable error to the client.

use std::sync::Arc;

use tracing::{debug, warn};

use kiln_dispatch::{Session, TransportManager};
use kiln_wire::{
    Opcode, RequestHeader, ResponseHeader, ServiceType, Status, WriteSegmentRequest,
    REQUEST_HEADER_LEN,
};

use crate::error::{MasterError, MasterResult};

pub struct ReplicaSet {
    master_id: u64,
    sessions: Vec<Arc<dyn Session>>,
    retries: usize,
}

impl ReplicaSet {
    /// Opens a session to every configured backup. Fails fast if any
    /// locator cannot be resolved; a master without its replica set must
    /// not accept writes.
    pub fn open(
        transports: &TransportManager,
        master_id: u64,
        locators: &[String],
        retries: usize,
    ) -> MasterResult<ReplicaSet> {
        let mut sessions = Vec::with_capacity(locators.len());
        for locator in locators {
            sessions.push(transports.get_session(locator)?);
        }
        Ok(ReplicaSet {
            master_id,
            sessions,
            retries: retries.max(1),
        })
    }

    pub fn replica_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stores `data` at `offset` of `segment_id` on every replica, waiting
    /// for all acknowledgements. `close` marks the segment complete.
    pub fn write(
        &self,
        segment_id: u64,
        offset: u32,
        data: &[u8],
        close: bool,
    ) -> MasterResult<()> {
        let mut request = Vec::with_capacity(REQUEST_HEADER_LEN + 25 + data.len());
        RequestHeader::new(Opcode::WriteSegment, ServiceType::Backup).encode(&mut request);
        WriteSegmentRequest {
            master_id: self.master_id,
            segment_id,
            offset,
            close,
            data: data.to_vec(),
        }
        .encode(&mut request);

        // First round goes out to every replica in parallel; stragglers are
        // retried one at a time.
        let pending: Vec<_> = self
            .sessions
            .iter()
            .map(|session| session.send(request.clone()))
            .collect();
        for (session, rpc) in self.sessions.iter().zip(pending) {
            let mut outcome = Self::finish(rpc);
            let mut attempts = 1;
            while outcome.is_err() && attempts < self.retries {
                warn!(
                    locator = session.locator(),
                    segment_id, attempts, "replica write failed, retrying"
                );
                outcome = Self::finish(session.send(request.clone()));
                attempts += 1;
            }
            outcome.map_err(|err| MasterError::ReplicationFailed {
                locator: session.locator().to_string(),
                detail: err.to_string(),
            })?;
        }
        debug!(
            segment_id,
            offset,
            len = data.len(),
            close,
            replicas = self.sessions.len(),
            "segment bytes replicated"
        );
        Ok(())
    }

    fn finish(rpc: kiln_dispatch::PendingRpc) -> Result<(), MasterError> {
        let reply = rpc.wait()?;
        let header = ResponseHeader::decode(&reply).map_err(MasterError::Wire)?;
        if header.status != Status::Ok {
            return Err(MasterError::internal(format!(
                "backup rejected segment write with {:?}",
                header.status
            )));
        }
        Ok(())
    }
}
