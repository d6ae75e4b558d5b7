//! The append-only log: fixed-size segments of typed, checksummed entries.
//!
//! The log is the source of truth for object bytes; the index stores packed
//! [`LogAddress`] handles into it. Entries are never rewritten, and an
//! address stays valid for the life of its segment. Durability comes from
//! streaming every dirty byte range to the replica set before an operation
//! replies.

use std::collections::BTreeMap;

use crc64fast_nvme::Digest;
use tracing::debug;

use crate::error::{MasterError, MasterResult};
use crate::hash_table::AddressResolver;
use crate::replication::ReplicaSet;

/// Bits of a packed address reserved for the in-segment offset. Segments
/// are capped at 16 MiB so offsets always fit.
const SEGMENT_OFFSET_BITS: u32 = 24;
const SEGMENT_OFFSET_MASK: u64 = (1 << SEGMENT_OFFSET_BITS) - 1;

/// Segment ids must fit in the remaining bits of a 47-bit pointer.
pub const MAX_SEGMENT_ID: u64 = (1 << (47 - SEGMENT_OFFSET_BITS)) - 1;

/// `{type: u8, length: u32, checksum: u32}` precedes every payload.
pub const ENTRY_HEADER_LEN: usize = 9;

const SEGMENT_HEADER_LEN: usize = 16;
const SEGMENT_FOOTER_LEN: usize = 4;
/// Space kept free in every segment so `close` can always write a footer.
const FOOTER_RESERVE: usize = ENTRY_HEADER_LEN + SEGMENT_FOOTER_LEN;

pub const OBJECT_HEADER_LEN: usize = 20;
pub const TOMBSTONE_LEN: usize = 28;

/// A 47-bit log entry address: `(segment_id << 24) | offset`.
///
/// Never zero for a real entry: offset zero always holds the segment
/// header, so objects and tombstones start at offset `>= 9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogAddress(u64);

impl LogAddress {
    pub fn new(segment_id: u64, offset: u32) -> Self {
        debug_assert!(segment_id <= MAX_SEGMENT_ID);
        debug_assert!((offset as u64) <= SEGMENT_OFFSET_MASK);
        LogAddress((segment_id << SEGMENT_OFFSET_BITS) | offset as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        LogAddress(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn segment_id(self) -> u64 {
        self.0 >> SEGMENT_OFFSET_BITS
    }

    pub fn offset(self) -> u32 {
        (self.0 & SEGMENT_OFFSET_MASK) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    SegmentHeader = 1,
    Object = 2,
    Tombstone = 3,
    SegmentFooter = 4,
}

impl EntryType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EntryType::SegmentHeader),
            2 => Some(EntryType::Object),
            3 => Some(EntryType::Tombstone),
            4 => Some(EntryType::SegmentFooter),
            _ => None,
        }
    }
}

/// Folds a 64-bit CRC into the 32 bits the entry header has room for.
pub fn fold_crc64(value: u64) -> u32 {
    (value >> 32) as u32 ^ value as u32
}

fn payload_checksum(payload: &[u8]) -> u32 {
    let mut digest = Digest::new();
    digest.write(payload);
    fold_crc64(digest.sum64())
}

/// A live object as laid out in its log entry:
/// `{table_id: u32, object_id: u64, version: u64, data}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectView<'a> {
    pub table_id: u32,
    pub id: u64,
    pub version: u64,
    pub data: &'a [u8],
}

impl<'a> ObjectView<'a> {
    pub fn encode(table_id: u32, id: u64, version: u64, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(OBJECT_HEADER_LEN + data.len());
        payload.extend_from_slice(&table_id.to_le_bytes());
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&version.to_le_bytes());
        payload.extend_from_slice(data);
        payload
    }

    pub fn parse(payload: &'a [u8]) -> MasterResult<Self> {
        if payload.len() < OBJECT_HEADER_LEN {
            return Err(MasterError::corruption("object entry too short"));
        }
        Ok(ObjectView {
            table_id: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            id: u64::from_le_bytes(payload[4..12].try_into().unwrap()),
            version: u64::from_le_bytes(payload[12..20].try_into().unwrap()),
            data: &payload[OBJECT_HEADER_LEN..],
        })
    }
}

/// A deletion marker: `{table_id: u32, object_id: u64, version: u64,
/// segment_id: u64}`. `segment_id` names the segment that held the deleted
/// object, for the cleaner's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstoneView {
    pub table_id: u32,
    pub id: u64,
    pub version: u64,
    pub segment_id: u64,
}

impl TombstoneView {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(TOMBSTONE_LEN);
        payload.extend_from_slice(&self.table_id.to_le_bytes());
        payload.extend_from_slice(&self.id.to_le_bytes());
        payload.extend_from_slice(&self.version.to_le_bytes());
        payload.extend_from_slice(&self.segment_id.to_le_bytes());
        payload
    }

    pub fn parse(payload: &[u8]) -> MasterResult<Self> {
        if payload.len() < TOMBSTONE_LEN {
            return Err(MasterError::corruption("tombstone entry too short"));
        }
        Ok(TombstoneView {
            table_id: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            id: u64::from_le_bytes(payload[4..12].try_into().unwrap()),
            version: u64::from_le_bytes(payload[12..20].try_into().unwrap()),
            segment_id: u64::from_le_bytes(payload[20..28].try_into().unwrap()),
        })
    }
}

/// One parsed entry yielded by [`iter_entries`].
#[derive(Debug, Clone, Copy)]
pub struct RawEntry<'a> {
    pub entry_type: EntryType,
    /// Offset of the entry header within the scanned region.
    pub offset: u32,
    pub payload: &'a [u8],
}

/// Walks a region of segment bytes entry by entry, verifying each entry's
/// checksum. Readers must reject regions whose checksums do not match.
pub fn iter_entries(data: &[u8]) -> EntryIter<'_> {
    EntryIter { data, offset: 0 }
}

pub struct EntryIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = MasterResult<RawEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let remaining = &self.data[self.offset..];
        if remaining.len() < ENTRY_HEADER_LEN {
            self.offset = self.data.len();
            return Some(Err(MasterError::corruption("truncated entry header")));
        }
        let Some(entry_type) = EntryType::from_u8(remaining[0]) else {
            self.offset = self.data.len();
            return Some(Err(MasterError::corruption(format!(
                "unknown entry type {}",
                remaining[0]
            ))));
        };
        let length = u32::from_le_bytes(remaining[1..5].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(remaining[5..9].try_into().unwrap());
        if remaining.len() < ENTRY_HEADER_LEN + length {
            self.offset = self.data.len();
            return Some(Err(MasterError::corruption("truncated entry payload")));
        }
        let payload = &remaining[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + length];
        let offset = self.offset as u32;
        if payload_checksum(payload) != checksum {
            self.offset = self.data.len();
            return Some(Err(MasterError::corruption(format!(
                "entry checksum mismatch at offset {offset}"
            ))));
        }
        self.offset += ENTRY_HEADER_LEN + length;
        Some(Ok(RawEntry {
            entry_type,
            offset,
            payload,
        }))
    }
}

/// Checks every entry checksum in `data`, and the whole-segment checksum
/// when a footer is present.
pub fn verify_segment(data: &[u8]) -> MasterResult<()> {
    let mut digest = Digest::new();
    for entry in iter_entries(data) {
        let entry = entry?;
        if entry.entry_type == EntryType::SegmentFooter {
            if entry.payload.len() < SEGMENT_FOOTER_LEN {
                return Err(MasterError::corruption("short segment footer"));
            }
            let expected = u32::from_le_bytes(entry.payload[0..4].try_into().unwrap());
            if fold_crc64(digest.sum64()) != expected {
                return Err(MasterError::corruption("segment checksum mismatch"));
            }
        } else {
            let start = entry.offset as usize;
            let end = start + ENTRY_HEADER_LEN + entry.payload.len();
            digest.write(&data[start..end]);
        }
    }
    Ok(())
}

/// A fixed-size append-only byte region. Starts with a `SegmentHeader`
/// entry, ends with a `SegmentFooter` once closed; immutable after close.
pub struct Segment {
    id: u64,
    capacity: u32,
    buf: Vec<u8>,
    closed: bool,
    /// Running digest over everything appended, for the footer.
    digest: Digest,
}

impl Segment {
    pub fn new(log_id: u64, id: u64, capacity: u32) -> Segment {
        let mut segment = Segment {
            id,
            capacity,
            buf: Vec::with_capacity(capacity as usize),
            closed: false,
            digest: Digest::new(),
        };
        let mut header = Vec::with_capacity(SEGMENT_HEADER_LEN);
        header.extend_from_slice(&log_id.to_le_bytes());
        header.extend_from_slice(&id.to_le_bytes());
        segment
            .push_entry(EntryType::SegmentHeader, &header)
            .expect("segment header always fits");
        segment
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Everything appended so far, header entry included.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn head(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Appends one entry, or returns `None` if the segment cannot hold it
    /// while keeping the footer reserve intact.
    pub(crate) fn try_append(&mut self, entry_type: EntryType, payload: &[u8]) -> Option<u32> {
        debug_assert!(!self.closed);
        let needed = ENTRY_HEADER_LEN + payload.len();
        let limit = self.capacity as usize - FOOTER_RESERVE;
        if self.buf.len() + needed > limit {
            return None;
        }
        Some(self.push_entry(entry_type, payload).expect("space was checked"))
    }

    fn push_entry(&mut self, entry_type: EntryType, payload: &[u8]) -> MasterResult<u32> {
        if self.buf.len() + ENTRY_HEADER_LEN + payload.len() > self.capacity as usize {
            return Err(MasterError::internal("segment overflow"));
        }
        let offset = self.buf.len() as u32;
        self.buf.push(entry_type as u8);
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf
            .extend_from_slice(&payload_checksum(payload).to_le_bytes());
        self.buf.extend_from_slice(payload);
        if entry_type != EntryType::SegmentFooter {
            self.digest.write(&self.buf[offset as usize..]);
        }
        Ok(offset)
    }

    /// Writes the footer and freezes the segment.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let checksum = fold_crc64(self.digest.sum64());
        self.push_entry(EntryType::SegmentFooter, &checksum.to_le_bytes())
            .expect("footer space is reserved");
        self.closed = true;
    }

    /// The entry whose header starts at `offset`.
    pub fn entry_at(&self, offset: u32) -> MasterResult<(EntryType, &[u8])> {
        let start = offset as usize;
        if start + ENTRY_HEADER_LEN > self.buf.len() {
            return Err(MasterError::corruption("entry offset out of range"));
        }
        let entry_type = EntryType::from_u8(self.buf[start])
            .ok_or_else(|| MasterError::corruption("unknown entry type"))?;
        let length =
            u32::from_le_bytes(self.buf[start + 1..start + 5].try_into().unwrap()) as usize;
        let end = start + ENTRY_HEADER_LEN + length;
        if end > self.buf.len() {
            return Err(MasterError::corruption("entry length out of range"));
        }
        Ok((entry_type, &self.buf[start + ENTRY_HEADER_LEN..end]))
    }
}

/// The master's log: a sequence of segments with an appendable head.
pub struct Log {
    log_id: u64,
    segment_bytes: u32,
    segments: BTreeMap<u64, Segment>,
    head_id: u64,
    next_segment_id: u64,
    replicas: Option<ReplicaSet>,
    /// Bytes of the head segment already acknowledged by every replica.
    replicated_through: u32,
}

impl Log {
    pub fn new(log_id: u64, segment_bytes: u64, replicas: Option<ReplicaSet>) -> MasterResult<Log> {
        if !segment_bytes.is_power_of_two() || segment_bytes > 1 << SEGMENT_OFFSET_BITS {
            return Err(MasterError::internal(format!(
                "segment size {segment_bytes} is not a power of two within the address budget"
            )));
        }
        let mut log = Log {
            log_id,
            segment_bytes: segment_bytes as u32,
            segments: BTreeMap::new(),
            head_id: 0,
            next_segment_id: 0,
            replicas,
            replicated_through: 0,
        };
        log.open_head();
        Ok(log)
    }

    fn open_head(&mut self) {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        debug_assert!(id <= MAX_SEGMENT_ID);
        self.segments
            .insert(id, Segment::new(self.log_id, id, self.segment_bytes));
        self.head_id = id;
        self.replicated_through = 0;
    }

    fn head(&mut self) -> &mut Segment {
        self.segments
            .get_mut(&self.head_id)
            .expect("log always has a head segment")
    }

    pub fn head_segment_id(&self) -> u64 {
        self.head_id
    }

    pub fn segment(&self, id: u64) -> Option<&Segment> {
        self.segments.get(&id)
    }

    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.keys().copied().collect()
    }

    /// Appends a typed entry, rolling the head if it is full. With `sync`
    /// set, blocks until every replica holds the bytes; the reply to a
    /// mutation must not be sent before that.
    pub fn append(
        &mut self,
        entry_type: EntryType,
        payload: &[u8],
        sync: bool,
    ) -> MasterResult<LogAddress> {
        let largest_fit = self.segment_bytes as usize
            - FOOTER_RESERVE
            - (ENTRY_HEADER_LEN + SEGMENT_HEADER_LEN)
            - ENTRY_HEADER_LEN;
        if payload.len() > largest_fit {
            return Err(MasterError::EntryTooBig(payload.len()));
        }

        let offset = match self.head().try_append(entry_type, payload) {
            Some(offset) => offset,
            None => {
                self.roll_head()?;
                self.head()
                    .try_append(entry_type, payload)
                    .ok_or_else(|| MasterError::internal("entry does not fit a fresh segment"))?
            }
        };
        let address = LogAddress::new(self.head_id, offset);
        if sync {
            self.sync()?;
        }
        Ok(address)
    }

    /// Closes the head (footer included), pushes its tail bytes to the
    /// replicas with the close flag, and opens a fresh head.
    fn roll_head(&mut self) -> MasterResult<()> {
        let head_id = self.head_id;
        self.head().close();
        debug!(segment_id = head_id, "log head closed");
        if let Some(replicas) = &self.replicas {
            let segment = &self.segments[&head_id];
            let from = self.replicated_through;
            replicas.write(
                head_id,
                from,
                &segment.bytes()[from as usize..],
                true,
            )?;
        }
        self.open_head();
        Ok(())
    }

    /// Pushes the head's dirty byte range to every replica and waits for
    /// all of them to acknowledge.
    pub fn sync(&mut self) -> MasterResult<()> {
        let head_id = self.head_id;
        let head_len = self.segments[&head_id].head();
        if let Some(replicas) = &self.replicas {
            let from = self.replicated_through;
            if from < head_len {
                let segment = &self.segments[&head_id];
                replicas.write(head_id, from, &segment.bytes()[from as usize..], false)?;
            }
        }
        self.replicated_through = head_len;
        Ok(())
    }

    pub fn entry_at(&self, address: LogAddress) -> MasterResult<(EntryType, &[u8])> {
        let segment = self
            .segments
            .get(&address.segment_id())
            .ok_or_else(|| MasterError::corruption("address names a missing segment"))?;
        segment.entry_at(address.offset())
    }

    pub fn object_at(&self, address: LogAddress) -> MasterResult<ObjectView<'_>> {
        match self.entry_at(address)? {
            (EntryType::Object, payload) => ObjectView::parse(payload),
            (other, _) => Err(MasterError::corruption(format!(
                "expected object entry, found {other:?}"
            ))),
        }
    }

    pub fn tombstone_at(&self, address: LogAddress) -> MasterResult<TombstoneView> {
        match self.entry_at(address)? {
            (EntryType::Tombstone, payload) => TombstoneView::parse(payload),
            (other, _) => Err(MasterError::corruption(format!(
                "expected tombstone entry, found {other:?}"
            ))),
        }
    }
}

impl AddressResolver for Log {
    fn key_at(&self, address: u64) -> Option<(u32, u64)> {
        let (entry_type, payload) = self.entry_at(LogAddress::from_raw(address)).ok()?;
        match entry_type {
            EntryType::Object => {
                let object = ObjectView::parse(payload).ok()?;
                Some((object.table_id, object.id))
            }
            EntryType::Tombstone => {
                let tombstone = TombstoneView::parse(payload).ok()?;
                Some((tombstone.table_id, tombstone.id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_object(log: &mut Log, table_id: u32, id: u64, version: u64, data: &[u8]) -> LogAddress {
        let payload = ObjectView::encode(table_id, id, version, data);
        log.append(EntryType::Object, &payload, false).unwrap()
    }

    #[test]
    fn addresses_pack_and_unpack() {
        let address = LogAddress::new(MAX_SEGMENT_ID, (1 << SEGMENT_OFFSET_BITS) - 1);
        assert_eq!(address.segment_id(), MAX_SEGMENT_ID);
        assert_eq!(address.offset(), (1 << SEGMENT_OFFSET_BITS) - 1);
        assert_eq!(address.as_raw() >> 47, 0);

        let address = LogAddress::new(3, 25);
        assert_eq!(LogAddress::from_raw(address.as_raw()), address);
    }

    #[test]
    fn appended_entries_read_back() {
        let mut log = Log::new(1, 64 * 1024, None).unwrap();
        let a = append_object(&mut log, 0, 7, 1, b"item0");
        let b = append_object(&mut log, 0, 8, 2, b"item1");
        assert_ne!(a.as_raw(), 0);

        let object = log.object_at(a).unwrap();
        assert_eq!(object.table_id, 0);
        assert_eq!(object.id, 7);
        assert_eq!(object.version, 1);
        assert_eq!(object.data, b"item0");
        assert_eq!(log.object_at(b).unwrap().data, b"item1");

        assert_eq!(log.key_at(a.as_raw()), Some((0, 7)));
        assert_eq!(log.key_at(b.as_raw()), Some((0, 8)));
    }

    #[test]
    fn tombstones_read_back() {
        let mut log = Log::new(1, 64 * 1024, None).unwrap();
        let tombstone = TombstoneView {
            table_id: 3,
            id: 44,
            version: 9,
            segment_id: 0,
        };
        let address = log
            .append(EntryType::Tombstone, &tombstone.encode(), false)
            .unwrap();
        assert_eq!(log.tombstone_at(address).unwrap(), tombstone);
        assert_eq!(log.key_at(address.as_raw()), Some((3, 44)));
    }

    #[test]
    fn head_rolls_when_full() {
        let mut log = Log::new(1, 64 * 1024, None).unwrap();
        let first_head = log.head_segment_id();
        let data = vec![0xabu8; 4000];
        let mut addresses = Vec::new();
        for id in 0..32u64 {
            addresses.push(append_object(&mut log, 0, id, id + 1, &data));
        }
        assert!(log.head_segment_id() > first_head, "head should have rolled");

        // Entries in closed segments stay readable at their old addresses.
        for (id, address) in addresses.iter().enumerate() {
            let object = log.object_at(*address).unwrap();
            assert_eq!(object.id, id as u64);
        }
        let closed = log.segment(first_head).unwrap();
        assert!(closed.is_closed());
        let last = iter_entries(closed.bytes()).last().unwrap().unwrap();
        assert_eq!(last.entry_type, EntryType::SegmentFooter);
        verify_segment(closed.bytes()).unwrap();
    }

    #[test]
    fn oversized_entries_are_refused() {
        let mut log = Log::new(1, 64 * 1024, None).unwrap();
        let huge = vec![0u8; 64 * 1024];
        let err = log.append(EntryType::Object, &huge, false).unwrap_err();
        assert!(matches!(err, MasterError::EntryTooBig(_)));
    }

    #[test]
    fn corrupted_bytes_are_rejected() {
        let mut log = Log::new(1, 64 * 1024, None).unwrap();
        append_object(&mut log, 0, 1, 1, b"payload");
        let mut bytes = log.segment(0).unwrap().bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let result: MasterResult<Vec<_>> = iter_entries(&bytes).collect();
        assert!(matches!(result, Err(MasterError::Corruption(_))));
        assert!(verify_segment(&bytes).is_err());
    }

    #[test]
    fn verify_segment_accepts_clean_bytes() {
        let mut log = Log::new(1, 64 * 1024, None).unwrap();
        append_object(&mut log, 0, 1, 1, b"abc");
        append_object(&mut log, 0, 2, 2, b"def");
        verify_segment(log.segment(0).unwrap().bytes()).unwrap();
    }
}
