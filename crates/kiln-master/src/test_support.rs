//! In-memory collaborators for tests and single-process clusters: a
//! coordinator with a bounded table space, a wire-level backup service,
//! and a recovery-segment builder.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use kiln_dispatch::{Rpc, Service};
use kiln_wire::rpc::TabletEntry;
use kiln_wire::{
    GetRecoveryDataRequest, GetRecoveryDataResponse, Opcode, RequestHeader, ResponseHeader,
    Status, WriteSegmentRequest, REQUEST_HEADER_LEN,
};

use crate::coordinator::CoordinatorClient;
use crate::error::{MasterError, MasterResult};
use crate::log::{EntryType, ObjectView, Segment, TombstoneView};

/// Coordinator stand-in: a name-to-id table registry with a fixed capacity
/// and a record of `tablets_recovered` announcements.
pub struct LocalCoordinator {
    inner: Mutex<CoordinatorInner>,
    recovered: Mutex<Vec<(u64, Vec<TabletEntry>)>>,
}

struct CoordinatorInner {
    tables: HashMap<String, u32>,
    next_id: u32,
    max_tables: usize,
}

impl LocalCoordinator {
    pub fn new(max_tables: usize) -> Arc<LocalCoordinator> {
        Arc::new(LocalCoordinator {
            inner: Mutex::new(CoordinatorInner {
                tables: HashMap::new(),
                next_id: 0,
                max_tables,
            }),
            recovered: Mutex::new(Vec::new()),
        })
    }

    /// Every `tablets_recovered` call seen so far.
    pub fn recovered_announcements(&self) -> Vec<(u64, Vec<TabletEntry>)> {
        self.recovered.lock().clone()
    }
}

impl CoordinatorClient for LocalCoordinator {
    fn create_table(&self, name: &str) -> MasterResult<()> {
        let mut inner = self.inner.lock();
        if inner.tables.contains_key(name) {
            return Ok(());
        }
        if inner.tables.len() >= inner.max_tables {
            return Err(MasterError::NoTableSpace);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tables.insert(name.to_string(), id);
        Ok(())
    }

    fn open_table(&self, name: &str) -> MasterResult<u32> {
        self.inner
            .lock()
            .tables
            .get(name)
            .copied()
            .ok_or(MasterError::TableDoesntExist)
    }

    fn drop_table(&self, name: &str) -> MasterResult<()> {
        self.inner.lock().tables.remove(name);
        Ok(())
    }

    fn tablets_recovered(&self, master_id: u64, tablets: &[TabletEntry]) -> MasterResult<()> {
        self.recovered.lock().push((master_id, tablets.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct StoredSegment {
    data: Vec<u8>,
    closed: bool,
}

/// Wire-level backup service holding segments in memory. Serves
/// `WriteSegment` and `GetRecoveryData`; asking for a segment it does not
/// hold fails the RPC, which is how tests stage dead replicas.
#[derive(Default)]
pub struct InMemoryBackup {
    segments: Mutex<HashMap<(u64, u64), StoredSegment>>,
    recovery_queries: Mutex<HashMap<u64, u64>>,
}

impl InMemoryBackup {
    pub fn new() -> Arc<InMemoryBackup> {
        Arc::new(InMemoryBackup::default())
    }

    /// Stages segment bytes as if a master had replicated them here.
    pub fn put_segment(&self, master_id: u64, segment_id: u64, data: Vec<u8>) {
        self.segments.lock().insert(
            (master_id, segment_id),
            StoredSegment { data, closed: true },
        );
    }

    pub fn segment_bytes(&self, master_id: u64, segment_id: u64) -> Option<Vec<u8>> {
        self.segments
            .lock()
            .get(&(master_id, segment_id))
            .map(|stored| stored.data.clone())
    }

    pub fn is_closed(&self, master_id: u64, segment_id: u64) -> bool {
        self.segments
            .lock()
            .get(&(master_id, segment_id))
            .map(|stored| stored.closed)
            .unwrap_or(false)
    }

    /// How many `GetRecoveryData` RPCs have named this segment.
    pub fn recovery_query_count(&self, segment_id: u64) -> u64 {
        self.recovery_queries
            .lock()
            .get(&segment_id)
            .copied()
            .unwrap_or(0)
    }

    fn write_segment(&self, request: WriteSegmentRequest) -> Status {
        let mut segments = self.segments.lock();
        let stored = segments
            .entry((request.master_id, request.segment_id))
            .or_default();
        let end = request.offset as usize + request.data.len();
        if stored.data.len() < end {
            stored.data.resize(end, 0);
        }
        stored.data[request.offset as usize..end].copy_from_slice(&request.data);
        stored.closed |= request.close;
        Status::Ok
    }

    fn get_recovery_data(&self, request: GetRecoveryDataRequest, reply: &mut Vec<u8>) {
        *self
            .recovery_queries
            .lock()
            .entry(request.segment_id)
            .or_insert(0) += 1;
        match self.segment_bytes(request.master_id, request.segment_id) {
            Some(data) => {
                ResponseHeader { status: Status::Ok }.encode(reply);
                GetRecoveryDataResponse { data }.encode(reply);
            }
            None => {
                // Bad segment id: this backup never held it.
                ResponseHeader {
                    status: Status::Internal,
                }
                .encode(reply);
            }
        }
    }
}

impl Service for InMemoryBackup {
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
            Opcode::WriteSegment => {
                let status = match WriteSegmentRequest::decode(body) {
                    Ok(request) => self.write_segment(request),
                    Err(_) => Status::MessageTooShort,
                };
                ResponseHeader { status }.encode(rpc.reply_mut());
            }
            Opcode::GetRecoveryData => match GetRecoveryDataRequest::decode(body) {
                Ok(request) => self.get_recovery_data(request, rpc.reply_mut()),
                Err(_) => {
                    ResponseHeader {
                        status: Status::MessageTooShort,
                    }
                    .encode(rpc.reply_mut());
                }
            },
            _ => {
                ResponseHeader {
                    status: Status::ServiceNotAvailable,
                }
                .encode(rpc.reply_mut());
            }
        }
    }
}

/// One entry of a hand-built recovery segment.
pub enum SegmentEntrySpec {
    Object {
        table_id: u32,
        id: u64,
        version: u64,
        data: Vec<u8>,
    },
    Tombstone {
        table_id: u32,
        id: u64,
        version: u64,
        segment_id: u64,
    },
}

/// Builds the byte image of a closed segment holding the given entries, as
/// a backup would serve it during recovery.
pub fn build_segment(log_id: u64, segment_id: u64, entries: &[SegmentEntrySpec]) -> Vec<u8> {
    let mut segment = Segment::new(log_id, segment_id, 64 * 1024);
    for spec in entries {
        match spec {
            SegmentEntrySpec::Object {
                table_id,
                id,
                version,
                data,
            } => {
                let payload = ObjectView::encode(*table_id, *id, *version, data);
                segment
                    .try_append(EntryType::Object, &payload)
                    .expect("test segment overflow");
            }
            SegmentEntrySpec::Tombstone {
                table_id,
                id,
                version,
                segment_id,
            } => {
                let tombstone = TombstoneView {
                    table_id: *table_id,
                    id: *id,
                    version: *version,
                    segment_id: *segment_id,
                };
                segment
                    .try_append(EntryType::Tombstone, &tombstone.encode())
                    .expect("test segment overflow");
            }
        }
    }
    segment.close();
    segment.bytes().to_vec()
}
