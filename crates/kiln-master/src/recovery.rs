//! Parallel segment fetch for crash recovery.
//!
//! The backup list names, for every segment of the crashed master's
//! partition, each replica that may hold it. The engine keeps a bounded set
//! of channels, each carrying at most one in-flight `GetRecoveryData` RPC,
//! and at most one RPC in flight per segment id: a second replica of a
//! segment is only tried after an earlier attempt fails. Entries whose
//! locator cannot be resolved fail immediately and the scan advances in the
//! same step. After every state change the list is checked for a *lost*
//! segment, one with no surviving replica; losing any segment aborts the
//! recovery.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use kiln_dispatch::{PendingRpc, TransportManager, TransportResult};
use kiln_wire::rpc::BackupListEntry;
use kiln_wire::{
    GetRecoveryDataRequest, GetRecoveryDataResponse, Opcode, RequestHeader, ResponseHeader,
    ServiceType, Status,
};

use crate::error::{MasterError, MasterResult};

/// Fetch progress of one backup-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    NotStarted,
    Active,
    Ok,
    Failed,
}

#[derive(Debug)]
pub struct RecoveryEntry {
    pub segment_id: u64,
    pub locator: String,
    pub state: FetchState,
}

impl RecoveryEntry {
    pub fn new(segment_id: u64, locator: impl Into<String>) -> Self {
        RecoveryEntry {
            segment_id,
            locator: locator.into(),
            state: FetchState::NotStarted,
        }
    }
}

/// Fails iff some segment has been lost: every list entry for it `Failed`,
/// none `Ok` or still in play.
pub fn detect_segment_recovery_failure(entries: &[RecoveryEntry]) -> MasterResult<()> {
    let mut lost: Option<u64> = None;
    for entry in entries {
        if entry.state != FetchState::Failed {
            continue;
        }
        let segment_id = entry.segment_id;
        let alive = entries
            .iter()
            .any(|other| other.segment_id == segment_id && other.state != FetchState::Failed);
        if !alive {
            lost = Some(segment_id);
            break;
        }
    }
    match lost {
        Some(segment_id) => {
            warn!(segment_id, "segment has no surviving replica");
            Err(MasterError::SegmentRecoveryFailed { segment_id })
        }
        None => Ok(()),
    }
}

struct Channel {
    entry_index: usize,
    rpc: PendingRpc,
}

pub struct SegmentRecovery<'a> {
    transports: &'a TransportManager,
    crashed_master_id: u64,
    partition_id: u64,
    entries: Vec<RecoveryEntry>,
    channels: Vec<Option<Channel>>,
}

impl<'a> SegmentRecovery<'a> {
    pub fn new(
        transports: &'a TransportManager,
        channel_count: usize,
        crashed_master_id: u64,
        partition_id: u64,
        backups: &[BackupListEntry],
    ) -> Self {
        let entries = backups
            .iter()
            .map(|backup| RecoveryEntry::new(backup.segment_id, backup.locator.clone()))
            .collect();
        SegmentRecovery {
            transports,
            crashed_master_id,
            partition_id,
            entries,
            channels: (0..channel_count.max(1)).map(|_| None).collect(),
        }
    }

    /// Final per-entry states, for callers that want to report them.
    pub fn entry_states(&self) -> Vec<(u64, FetchState)> {
        self.entries
            .iter()
            .map(|entry| (entry.segment_id, entry.state))
            .collect()
    }

    /// Fetches every distinct segment from some replica and feeds its bytes
    /// to `replay`, in completion order. A replay rejection (corrupt bytes)
    /// counts as a failed fetch for that entry; any other replay error is
    /// fatal.
    pub fn run(
        &mut self,
        mut replay: impl FnMut(u64, &[u8]) -> MasterResult<()>,
    ) -> MasterResult<()> {
        info!(
            crashed_master_id = self.crashed_master_id,
            partition_id = self.partition_id,
            hosts = self.entries.len(),
            "recovering from backup list"
        );

        // Initial round: channels fill strictly in list order.
        for channel_index in 0..self.channels.len() {
            if !self.start_next(channel_index, true) {
                break;
            }
            detect_segment_recovery_failure(&self.entries)?;
        }
        detect_segment_recovery_failure(&self.entries)?;

        while self.channels.iter().any(Option::is_some) {
            let mut progressed = false;
            for channel_index in 0..self.channels.len() {
                let Some(result) = self.channels[channel_index]
                    .as_ref()
                    .and_then(|channel| channel.rpc.poll())
                else {
                    continue;
                };
                progressed = true;
                let entry_index = self.channels[channel_index]
                    .take()
                    .map(|channel| channel.entry_index)
                    .expect("polled channel is occupied");
                let segment_id = self.entries[entry_index].segment_id;

                match Self::decode_reply(result) {
                    Ok(data) => match replay(segment_id, &data) {
                        Ok(()) => {
                            debug!(segment_id, "segment replay complete");
                            self.mark_segment_ok(segment_id);
                        }
                        Err(MasterError::Corruption(detail)) => {
                            warn!(
                                segment_id,
                                locator = %self.entries[entry_index].locator,
                                detail,
                                "recovery data corrupt, trying next replica"
                            );
                            self.entries[entry_index].state = FetchState::Failed;
                        }
                        Err(fatal) => return Err(fatal),
                    },
                    Err(err) => {
                        warn!(
                            segment_id,
                            locator = %self.entries[entry_index].locator,
                            error = %err,
                            "recovery rpc failed, trying next replica"
                        );
                        self.entries[entry_index].state = FetchState::Failed;
                    }
                }
                detect_segment_recovery_failure(&self.entries)?;
                self.start_next(channel_index, false);
                detect_segment_recovery_failure(&self.entries)?;
            }
            if !progressed {
                thread::sleep(Duration::from_micros(50));
            }
        }

        detect_segment_recovery_failure(&self.entries)
    }

    /// Scans the list in order for the next entry worth fetching and starts
    /// it on the given channel. Bad locators fail their entry on the spot
    /// and the scan keeps moving. Returns false when no candidate remains.
    fn start_next(&mut self, channel_index: usize, initial_round: bool) -> bool {
        debug_assert!(self.channels[channel_index].is_none());
        for entry_index in 0..self.entries.len() {
            if self.entries[entry_index].state != FetchState::NotStarted {
                continue;
            }
            let segment_id = self.entries[entry_index].segment_id;
            if self.segment_settled_or_in_flight(segment_id) {
                continue;
            }
            match self.start_rpc(entry_index) {
                Ok(rpc) => {
                    info!(
                        segment_id,
                        locator = %self.entries[entry_index].locator,
                        channel = channel_index,
                        initial_round,
                        "starting getRecoveryData"
                    );
                    self.entries[entry_index].state = FetchState::Active;
                    self.channels[channel_index] = Some(Channel { entry_index, rpc });
                    return true;
                }
                Err(err) => {
                    warn!(
                        segment_id,
                        locator = %self.entries[entry_index].locator,
                        error = %err,
                        "cannot reach backup, skipping entry"
                    );
                    self.entries[entry_index].state = FetchState::Failed;
                }
            }
        }
        false
    }

    fn segment_settled_or_in_flight(&self, segment_id: u64) -> bool {
        self.entries.iter().any(|entry| {
            entry.segment_id == segment_id
                && matches!(entry.state, FetchState::Ok | FetchState::Active)
        })
    }

    /// A fetched segment satisfies every remaining entry for it.
    fn mark_segment_ok(&mut self, segment_id: u64) {
        for entry in &mut self.entries {
            if entry.segment_id == segment_id && entry.state != FetchState::Failed {
                entry.state = FetchState::Ok;
            }
        }
    }

    fn start_rpc(&self, entry_index: usize) -> MasterResult<PendingRpc> {
        let entry = &self.entries[entry_index];
        let session = self.transports.get_session(&entry.locator)?;
        let mut request = Vec::new();
        RequestHeader::new(Opcode::GetRecoveryData, ServiceType::Backup).encode(&mut request);
        GetRecoveryDataRequest {
            master_id: self.crashed_master_id,
            segment_id: entry.segment_id,
            partition_id: self.partition_id,
        }
        .encode(&mut request);
        Ok(session.send(request))
    }

    fn decode_reply(result: TransportResult<Vec<u8>>) -> MasterResult<Vec<u8>> {
        let reply = result?;
        let header = ResponseHeader::decode(&reply)?;
        if header.status != Status::Ok {
            return Err(MasterError::internal(format!(
                "backup replied {:?}",
                header.status
            )));
        }
        let body = GetRecoveryDataResponse::decode(&reply[kiln_wire::RESPONSE_HEADER_LEN..])?;
        Ok(body.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(segment_id: u64, state: FetchState) -> RecoveryEntry {
        RecoveryEntry {
            segment_id,
            locator: "bind:host=backup1".to_string(),
            state,
        }
    }

    #[test]
    fn detect_passes_while_replicas_survive() {
        let entries = vec![
            entry(87, FetchState::Failed),
            entry(88, FetchState::Ok),
            entry(89, FetchState::Ok),
            entry(88, FetchState::Ok),
            entry(87, FetchState::Ok),
        ];
        detect_segment_recovery_failure(&entries).unwrap();
    }

    #[test]
    fn detect_fails_on_a_lost_segment() {
        let entries = vec![entry(87, FetchState::Failed), entry(88, FetchState::Ok)];
        let err = detect_segment_recovery_failure(&entries).unwrap_err();
        assert!(matches!(
            err,
            MasterError::SegmentRecoveryFailed { segment_id: 87 }
        ));
    }

    #[test]
    fn detect_treats_pending_entries_as_alive() {
        let entries = vec![
            entry(87, FetchState::Failed),
            entry(87, FetchState::NotStarted),
            entry(88, FetchState::Failed),
            entry(88, FetchState::Active),
        ];
        detect_segment_recovery_failure(&entries).unwrap();
    }
}
