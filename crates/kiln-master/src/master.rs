//! The master service: object operations over the index and log, plus
//! crash recovery of a failed master's partition.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use kiln_dispatch::{Rpc, Service, TransportManager};
use kiln_wire::rpc::{decode_tablet_list, BackupListEntry, TabletEntry, TabletState};
use kiln_wire::{
    CreateRequest, CreateResponse, MultiReadPart, MultiReadRequest, MultiReadResponse, Opcode,
    OpenTableResponse, ReadRequest, ReadResponse, RecoverRequest, RejectRules, RemoveRequest,
    RequestHeader, ResponseHeader, Status, TableNameRequest, VersionResponse, WriteRequest,
    REQUEST_HEADER_LEN,
};

use crate::config::MasterConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::{MasterError, MasterResult};
use crate::hash_table::HashTable;
use crate::log::{
    iter_entries, verify_segment, EntryType, Log, LogAddress, ObjectView, TombstoneView,
};
use crate::metrics::PerfStats;
use crate::recovery::SegmentRecovery;
use crate::replication::ReplicaSet;
use crate::table::TabletMap;

/// Evaluates the conditional-operation rules against the version currently
/// held for a key (zero meaning the object does not exist). Pure function
/// of its inputs. When the object does not exist only the existence rule
/// applies; the version comparisons are about versions an object actually
/// has.
pub fn reject_operation(rules: &RejectRules, current_version: u64) -> MasterResult<()> {
    if current_version == 0 {
        if rules.doesnt_exist {
            return Err(MasterError::ObjectDoesntExist { version: 0 });
        }
        return Ok(());
    }
    if rules.exists {
        return Err(MasterError::ObjectExists {
            version: current_version,
        });
    }
    if rules.version_le_given && current_version <= rules.given_version {
        return Err(MasterError::WrongVersion {
            version: current_version,
        });
    }
    if rules.version_ne_given && current_version != rules.given_version {
        return Err(MasterError::WrongVersion {
            version: current_version,
        });
    }
    Ok(())
}

/// Everything a mutation touches, behind one lock. The production
/// configuration admits a single mutating request at a time; the lock
/// carries configurations that allow more.
struct MasterState {
    log: Log,
    object_map: HashTable,
    tablets: TabletMap,
}

impl MasterState {
    /// What the index holds for a key: address, entry kind, and the version
    /// recorded in the log entry.
    fn index_entry(&mut self, table_id: u32, id: u64) -> Option<(LogAddress, EntryType, u64)> {
        let raw = self.object_map.lookup(table_id, id, &self.log)?;
        let address = LogAddress::from_raw(raw);
        match self.log.entry_at(address) {
            Ok((EntryType::Object, payload)) => ObjectView::parse(payload)
                .ok()
                .map(|object| (address, EntryType::Object, object.version)),
            Ok((EntryType::Tombstone, payload)) => TombstoneView::parse(payload)
                .ok()
                .map(|tombstone| (address, EntryType::Tombstone, tombstone.version)),
            _ => None,
        }
    }
}

pub struct MasterService {
    config: MasterConfig,
    coordinator: Arc<dyn CoordinatorClient>,
    transports: Arc<TransportManager>,
    state: Mutex<MasterState>,
}

impl MasterService {
    pub fn new(
        config: MasterConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        transports: Arc<TransportManager>,
    ) -> MasterResult<MasterService> {
        let config = config.normalized();
        let replicas = if config.replica_locators.is_empty() {
            None
        } else {
            Some(ReplicaSet::open(
                &transports,
                config.master_id,
                &config.replica_locators,
                config.replication_retries,
            )?)
        };
        let log = Log::new(config.master_id, config.segment_bytes, replicas)?;
        let object_map = HashTable::new(config.hash_table_buckets);
        Ok(MasterService {
            config,
            coordinator,
            transports,
            state: Mutex::new(MasterState {
                log,
                object_map,
                tablets: TabletMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Installs the authoritative tablet assignment, carrying over state
    /// for tables this master already serves.
    pub fn set_tablets(&self, entries: &[TabletEntry]) {
        let mut state = self.state.lock();
        state.tablets.set_all(entries);
        info!(tablets = entries.len(), "now serving tablets");
    }

    /// The entry kind and version the index currently holds for a key.
    /// Diagnostic surface for tooling and tests.
    pub fn probe_index(&self, table_id: u32, id: u64) -> Option<(EntryType, u64)> {
        let mut state = self.state.lock();
        state
            .index_entry(table_id, id)
            .map(|(_, entry_type, version)| (entry_type, version))
    }

    pub fn read(
        &self,
        table_id: u32,
        id: u64,
        rules: &RejectRules,
    ) -> MasterResult<(u64, Vec<u8>)> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.tablets.check(table_id, id)?;
        let Some((address, EntryType::Object, version)) = state.index_entry(table_id, id) else {
            return Err(MasterError::ObjectDoesntExist { version: 0 });
        };
        reject_operation(rules, version)?;
        let object = state.log.object_at(address)?;
        PerfStats::bump(|stats| &stats.read_count);
        Ok((version, object.data.to_vec()))
    }

    pub fn write(
        &self,
        table_id: u32,
        id: u64,
        data: &[u8],
        rules: &RejectRules,
    ) -> MasterResult<u64> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.tablets.check(table_id, id)?;
        let current_version = match state.index_entry(table_id, id) {
            Some((_, EntryType::Object, version)) => version,
            _ => 0,
        };
        reject_operation(rules, current_version)?;
        let version = state
            .tablets
            .table_mut(table_id, id)?
            .next_version(current_version);
        let payload = ObjectView::encode(table_id, id, version, data);
        let address = state.log.append(EntryType::Object, &payload, true)?;
        state.object_map.replace(address.as_raw(), &state.log);
        PerfStats::bump(|stats| &stats.write_count);
        Ok(version)
    }

    /// Writes a new object under a server-assigned id: the lowest unused id
    /// of the table's first tablet at or above the allocation cursor.
    pub fn create(&self, table_id: u32, data: &[u8]) -> MasterResult<(u64, u64)> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let tablet = state
            .tablets
            .first_tablet(table_id)
            .ok_or(MasterError::TableDoesntExist)?;
        let cursor = state
            .tablets
            .table_state_mut(table_id)
            .ok_or(MasterError::TableDoesntExist)?
            .id_cursor();

        let id = Self::allocate_id(state, table_id, tablet.start_id, tablet.end_id, cursor)?;
        let table = state
            .tablets
            .table_mut(table_id, id)
            .expect("allocated id lies inside the tablet");
        table.set_id_cursor(id + 1);
        let version = table.next_version(0);

        let payload = ObjectView::encode(table_id, id, version, data);
        let address = state.log.append(EntryType::Object, &payload, true)?;
        state.object_map.replace(address.as_raw(), &state.log);
        PerfStats::bump(|stats| &stats.create_count);
        Ok((id, version))
    }

    fn allocate_id(
        state: &mut MasterState,
        table_id: u32,
        start_id: u64,
        end_id: u64,
        cursor: u64,
    ) -> MasterResult<u64> {
        let first = cursor.clamp(start_id, end_id);
        let forward = first..=end_id;
        let wrapped = start_id..first;
        for id in forward.chain(wrapped) {
            if state.object_map.lookup(table_id, id, &state.log).is_none() {
                return Ok(id);
            }
        }
        // Every id in the tablet is live. Give up rather than spin.
        warn!(table_id, "object id space exhausted");
        Err(MasterError::IdSpaceExhausted { table_id })
    }

    /// Removes an object if present, appending a tombstone one version
    /// above it. Removing an absent object succeeds with version zero
    /// unless the rules forbid it.
    pub fn remove(&self, table_id: u32, id: u64, rules: &RejectRules) -> MasterResult<u64> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.tablets.check(table_id, id)?;
        let Some((address, EntryType::Object, version)) = state.index_entry(table_id, id) else {
            reject_operation(rules, 0)?;
            return Ok(0);
        };
        reject_operation(rules, version)?;

        let tombstone = TombstoneView {
            table_id,
            id,
            version: version + 1,
            segment_id: address.segment_id(),
        };
        // The tombstone consumes a version so later writes stay above it.
        state
            .tablets
            .table_mut(table_id, id)?
            .note_version(version + 1);
        state
            .log
            .append(EntryType::Tombstone, &tombstone.encode(), true)?;
        state.object_map.remove(table_id, id, &state.log);
        PerfStats::bump(|stats| &stats.remove_count);
        Ok(version)
    }

    /// Independent per-request lookups; each request carries its own
    /// status and partial failure is expected.
    pub fn multi_read(&self, requests: &[(u32, u64)]) -> Vec<MultiReadPart> {
        let mut state = self.state.lock();
        let state = &mut *state;
        PerfStats::bump(|stats| &stats.multi_read_count);
        requests
            .iter()
            .map(|&(table_id, id)| {
                if state.tablets.check(table_id, id).is_err() {
                    return MultiReadPart {
                        status: Status::TableDoesntExist,
                        version: 0,
                        data: Vec::new(),
                    };
                }
                match state.index_entry(table_id, id) {
                    Some((address, EntryType::Object, version)) => {
                        match state.log.object_at(address) {
                            Ok(object) => MultiReadPart {
                                status: Status::Ok,
                                version,
                                data: object.data.to_vec(),
                            },
                            Err(_) => MultiReadPart {
                                status: Status::Internal,
                                version: 0,
                                data: Vec::new(),
                            },
                        }
                    }
                    _ => MultiReadPart {
                        status: Status::ObjectDoesntExist,
                        version: 0,
                        data: Vec::new(),
                    },
                }
            })
            .collect()
    }

    /// Rebuilds a crashed master's partition: adopts its tablets in
    /// recovering state, fetches every segment from the backup list, and
    /// replays them with version ordering before announcing the tablets
    /// recovered.
    pub fn recover(
        &self,
        crashed_master_id: u64,
        partition_id: u64,
        tablets: &[TabletEntry],
        backups: &[BackupListEntry],
    ) -> MasterResult<()> {
        info!(
            crashed_master_id,
            partition_id,
            tablets = tablets.len(),
            "starting recovery"
        );
        {
            let recovering: Vec<TabletEntry> = tablets
                .iter()
                .map(|tablet| TabletEntry {
                    state: TabletState::Recovering,
                    ..*tablet
                })
                .collect();
            let mut state = self.state.lock();
            state.tablets.add(&recovering);
        }

        let mut recovery = SegmentRecovery::new(
            &self.transports,
            self.config.recovery_channels,
            crashed_master_id,
            partition_id,
            backups,
        );
        recovery.run(|segment_id, data| self.recover_segment(segment_id, data))?;

        self.remove_tombstones();

        let entries = {
            let mut state = self.state.lock();
            state.log.sync()?;
            state.tablets.mark_recovered();
            state.tablets.entries()
        };
        self.coordinator
            .tablets_recovered(self.config.master_id, &entries)?;
        info!(crashed_master_id, "recovery complete");
        Ok(())
    }

    /// Replays one fetched segment. The bytes are fully validated before
    /// anything is applied, so a corrupt fetch rejects cleanly and the
    /// engine can try another replica.
    pub fn recover_segment(&self, segment_id: u64, data: &[u8]) -> MasterResult<()> {
        verify_segment(data)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        for entry in iter_entries(data) {
            let entry = entry?;
            match entry.entry_type {
                EntryType::Object => {
                    let object = ObjectView::parse(entry.payload)?;
                    Self::recover_object(state, object)?;
                }
                EntryType::Tombstone => {
                    let tombstone = TombstoneView::parse(entry.payload)?;
                    Self::recover_tombstone(state, tombstone)?;
                }
                EntryType::SegmentHeader | EntryType::SegmentFooter => {}
            }
            PerfStats::bump(|stats| &stats.replayed_entries);
        }
        PerfStats::bump(|stats| &stats.replayed_segments);
        debug!(segment_id, "segment replay complete");
        Ok(())
    }

    fn recover_object(state: &mut MasterState, object: ObjectView<'_>) -> MasterResult<()> {
        if let Some(table) = state.tablets.table_state_mut(object.table_id) {
            table.note_version(object.version);
        }
        match state.index_entry(object.table_id, object.id) {
            // A newer (or equal) survivor wins; the replayed copy is stale.
            Some((_, EntryType::Object, version)) if version >= object.version => Ok(()),
            Some((_, EntryType::Tombstone, version)) if version >= object.version => Ok(()),
            _ => {
                let payload =
                    ObjectView::encode(object.table_id, object.id, object.version, object.data);
                let address = state.log.append(EntryType::Object, &payload, false)?;
                state.object_map.replace(address.as_raw(), &state.log);
                Ok(())
            }
        }
    }

    fn recover_tombstone(state: &mut MasterState, tombstone: TombstoneView) -> MasterResult<()> {
        if let Some(table) = state.tablets.table_state_mut(tombstone.table_id) {
            table.note_version(tombstone.version);
        }
        match state.index_entry(tombstone.table_id, tombstone.id) {
            Some((_, EntryType::Object, version)) if version > tombstone.version => Ok(()),
            Some((_, EntryType::Tombstone, version)) if version >= tombstone.version => Ok(()),
            _ => {
                let address = state
                    .log
                    .append(EntryType::Tombstone, &tombstone.encode(), false)?;
                state.object_map.replace(address.as_raw(), &state.log);
                Ok(())
            }
        }
    }

    /// Clears every index slot that still points at a tombstone. The
    /// tombstones stay in the log for the cleaner.
    pub fn remove_tombstones(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut doomed = Vec::new();
        state.object_map.for_each(|raw| {
            if let Ok((EntryType::Tombstone, payload)) =
                state.log.entry_at(LogAddress::from_raw(raw))
            {
                if let Ok(tombstone) = TombstoneView::parse(payload) {
                    doomed.push((tombstone.table_id, tombstone.id));
                }
            }
        });
        debug!(count = doomed.len(), "sweeping tombstones from the index");
        for (table_id, id) in doomed {
            state.object_map.remove(table_id, id, &state.log);
        }
    }

    // RPC surface -----------------------------------------------------

    fn ping_rpc(&self, rpc: &mut Rpc<'_>) {
        ResponseHeader { status: Status::Ok }.encode(rpc.reply_mut());
    }

    fn create_table_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = TableNameRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| self.coordinator.create_table(&request.name));
        let status = match result {
            Ok(()) => Status::Ok,
            Err(err) => err.status(),
        };
        ResponseHeader { status }.encode(rpc.reply_mut());
    }

    fn open_table_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = TableNameRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| self.coordinator.open_table(&request.name));
        let reply = rpc.reply_mut();
        match result {
            Ok(table_id) => {
                ResponseHeader { status: Status::Ok }.encode(reply);
                OpenTableResponse { table_id }.encode(reply);
            }
            Err(err) => {
                ResponseHeader {
                    status: err.status(),
                }
                .encode(reply);
                OpenTableResponse { table_id: 0 }.encode(reply);
            }
        }
    }

    fn drop_table_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = TableNameRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| self.coordinator.drop_table(&request.name));
        let status = match result {
            Ok(()) => Status::Ok,
            Err(err) => err.status(),
        };
        ResponseHeader { status }.encode(rpc.reply_mut());
    }

    fn create_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = CreateRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| self.create(request.table_id, &request.data));
        let reply = rpc.reply_mut();
        match result {
            Ok((id, version)) => {
                ResponseHeader { status: Status::Ok }.encode(reply);
                CreateResponse { id, version }.encode(reply);
            }
            Err(err) => {
                ResponseHeader {
                    status: err.status(),
                }
                .encode(reply);
                CreateResponse { id: 0, version: 0 }.encode(reply);
            }
        }
    }

    fn read_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = ReadRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| self.read(request.table_id, request.id, &request.reject_rules));
        let reply = rpc.reply_mut();
        match result {
            Ok((version, data)) => {
                ResponseHeader { status: Status::Ok }.encode(reply);
                ReadResponse { version, data }.encode(reply);
            }
            Err(err) => {
                ResponseHeader {
                    status: err.status(),
                }
                .encode(reply);
                ReadResponse {
                    version: err.found_version(),
                    data: Vec::new(),
                }
                .encode(reply);
            }
        }
    }

    fn write_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = WriteRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| {
                self.write(
                    request.table_id,
                    request.id,
                    &request.data,
                    &request.reject_rules,
                )
            });
        Self::version_reply(result, rpc);
    }

    fn remove_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = RemoveRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| self.remove(request.table_id, request.id, &request.reject_rules));
        Self::version_reply(result, rpc);
    }

    fn version_reply(result: MasterResult<u64>, rpc: &mut Rpc<'_>) {
        let reply = rpc.reply_mut();
        match result {
            Ok(version) => {
                ResponseHeader { status: Status::Ok }.encode(reply);
                VersionResponse { version }.encode(reply);
            }
            Err(err) => {
                ResponseHeader {
                    status: err.status(),
                }
                .encode(reply);
                VersionResponse {
                    version: err.found_version(),
                }
                .encode(reply);
            }
        }
    }

    fn multi_read_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let reply = rpc.reply_mut();
        match MultiReadRequest::decode(body) {
            Ok(request) => {
                let parts = self.multi_read(&request.requests);
                ResponseHeader { status: Status::Ok }.encode(reply);
                MultiReadResponse { parts }.encode(reply);
            }
            Err(_) => {
                ResponseHeader {
                    status: Status::MessageTooShort,
                }
                .encode(reply);
            }
        }
    }

    fn set_tablets_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let status = match decode_tablet_list(body) {
            Ok(entries) => {
                self.set_tablets(&entries);
                Status::Ok
            }
            Err(_) => Status::MessageTooShort,
        };
        ResponseHeader { status }.encode(rpc.reply_mut());
    }

    fn recover_rpc(&self, body: &[u8], rpc: &mut Rpc<'_>) {
        let result = RecoverRequest::decode(body)
            .map_err(MasterError::from)
            .and_then(|request| {
                self.recover(
                    request.crashed_master_id,
                    request.partition_id,
                    &request.tablets,
                    &request.backups,
                )
            });
        let status = match result {
            Ok(()) => Status::Ok,
            Err(err) => {
                warn!(error = %err, "recovery failed");
                err.status()
            }
        };
        ResponseHeader { status }.encode(rpc.reply_mut());
    }
}

impl Service for MasterService {
    fn handle(&self, rpc: &mut Rpc<'_>) {
        let header = match RequestHeader::decode(rpc.request()) {
            Ok(header) => header,
            Err(_) => {
                ResponseHeader {
                    status: Status::MessageTooShort,
                }
                .encode(rpc.reply_mut());
                return;
            }
        };
        let body = &rpc.request()[REQUEST_HEADER_LEN..];
        match header.opcode {
            Opcode::Ping => self.ping_rpc(rpc),
            Opcode::OpenTable => self.open_table_rpc(body, rpc),
            Opcode::CreateTable => self.create_table_rpc(body, rpc),
            Opcode::DropTable => self.drop_table_rpc(body, rpc),
            Opcode::Create => self.create_rpc(body, rpc),
            Opcode::Read => self.read_rpc(body, rpc),
            Opcode::Write => self.write_rpc(body, rpc),
            Opcode::Remove => self.remove_rpc(body, rpc),
            Opcode::MultiRead => self.multi_read_rpc(body, rpc),
            Opcode::SetTablets => self.set_tablets_rpc(body, rpc),
            Opcode::Recover => self.recover_rpc(body, rpc),
            Opcode::WriteSegment | Opcode::GetRecoveryData => {
                // Backup-service operations have no business here.
                ResponseHeader {
                    status: Status::ServiceNotAvailable,
                }
                .encode(rpc.reply_mut());
            }
        }
    }
}
