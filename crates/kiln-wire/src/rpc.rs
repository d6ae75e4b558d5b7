//! Fixed-layout RPC headers and bodies.
//!
//! Layout rules: all integers little-endian, no padding, variable-length
//! regions last and described by a length field in the fixed part. The
//! common request header is `{opcode: u16, service: u16}`; the common
//! response header is `{status: u32}`.

use crate::{WireError, WireResult};

pub const REQUEST_HEADER_LEN: usize = 4;
pub const RESPONSE_HEADER_LEN: usize = 4;

/// Operation selector carried in every request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Ping = 1,
    OpenTable = 2,
    CreateTable = 3,
    DropTable = 4,
    Create = 5,
    Read = 6,
    Write = 7,
    Remove = 8,
    MultiRead = 9,
    SetTablets = 10,
    Recover = 11,
    WriteSegment = 12,
    GetRecoveryData = 13,
}

impl Opcode {
    pub fn from_u16(value: u16) -> WireResult<Self> {
        Ok(match value {
            1 => Opcode::Ping,
            2 => Opcode::OpenTable,
            3 => Opcode::CreateTable,
            4 => Opcode::DropTable,
            5 => Opcode::Create,
            6 => Opcode::Read,
            7 => Opcode::Write,
            8 => Opcode::Remove,
            9 => Opcode::MultiRead,
            10 => Opcode::SetTablets,
            11 => Opcode::Recover,
            12 => Opcode::WriteSegment,
            13 => Opcode::GetRecoveryData,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

/// Which service on the receiving server handles the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceType {
    Master = 0,
    Backup = 1,
    Coordinator = 2,
}

impl ServiceType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ServiceType::Master),
            1 => Some(ServiceType::Backup),
            2 => Some(ServiceType::Coordinator),
            _ => None,
        }
    }
}

/// Completion status carried in every response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    TableDoesntExist = 1,
    ObjectDoesntExist = 2,
    ObjectExists = 3,
    WrongVersion = 4,
    NoTableSpace = 5,
    MessageTooShort = 6,
    ServiceNotAvailable = 7,
    Retry = 8,
    SegmentRecoveryFailed = 9,
    Internal = 10,
}

impl Status {
    pub fn from_u32(value: u32) -> WireResult<Self> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::TableDoesntExist,
            2 => Status::ObjectDoesntExist,
            3 => Status::ObjectExists,
            4 => Status::WrongVersion,
            5 => Status::NoTableSpace,
            6 => Status::MessageTooShort,
            7 => Status::ServiceNotAvailable,
            8 => Status::Retry,
            9 => Status::SegmentRecoveryFailed,
            10 => Status::Internal,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }
}

/// Conditions under which a read, write, or remove must be refused.
///
/// `given_version` is only consulted by the two version comparisons. A
/// current version of zero means the object does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectRules {
    pub given_version: u64,
    pub doesnt_exist: bool,
    pub exists: bool,
    pub version_le_given: bool,
    pub version_ne_given: bool,
}

impl RejectRules {
    pub const WIRE_LEN: usize = 12;

    fn put(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.given_version.to_le_bytes());
        buf.push(self.doesnt_exist as u8);
        buf.push(self.exists as u8);
        buf.push(self.version_le_given as u8);
        buf.push(self.version_ne_given as u8);
    }

    fn take(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(RejectRules {
            given_version: r.u64()?,
            doesnt_exist: r.u8()? != 0,
            exists: r.u8()? != 0,
            version_le_given: r.u8()? != 0,
            version_ne_given: r.u8()? != 0,
        })
    }
}

/// Bounds-checked little-endian reader over a request or response body.
struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, offset: 0 }
    }

    fn short(&self, needed: usize) -> WireError {
        WireError::MessageTooShort {
            offset: self.offset,
            needed,
        }
    }

    fn bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let remaining = self.buf.len() - self.offset;
        if remaining < len {
            return Err(self.short(len - remaining));
        }
        let out = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn u8(&mut self) -> WireResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> WireResult<u16> {
        let raw = self.bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> WireResult<u32> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn u64(&mut self) -> WireResult<u64> {
        let raw = self.bytes(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    fn string(&mut self, len: usize) -> WireResult<String> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|err| WireError::InvalidString(err.to_string()))
    }
}

/// Common request header: `{opcode: u16, service: u16}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub service: u16,
}

impl RequestHeader {
    pub fn new(opcode: Opcode, service: ServiceType) -> Self {
        RequestHeader {
            opcode,
            service: service as u16,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.opcode as u16).to_le_bytes());
        buf.extend_from_slice(&self.service.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(buf);
        let opcode = Opcode::from_u16(r.u16()?)?;
        let service = r.u16()?;
        Ok(RequestHeader { opcode, service })
    }

    /// Reads only the service field, for admission routing. Unlike
    /// [`RequestHeader::decode`] this succeeds even when the opcode is
    /// unknown, so the owning service can report the error itself.
    pub fn peek_service(buf: &[u8]) -> WireResult<u16> {
        let mut r = Reader::new(buf);
        let _opcode = r.u16()?;
        r.u16()
    }
}

/// Common response header: `{status: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: Status,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.status as u32).to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(buf);
        Ok(ResponseHeader {
            status: Status::from_u32(r.u32()?)?,
        })
    }
}

/// Body of `OpenTable`, `CreateTable`, and `DropTable`: a name preceded by
/// its byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNameRequest {
    pub name: String,
}

impl TableNameRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let len = r.u32()? as usize;
        Ok(TableNameRequest {
            name: r.string(len)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTableResponse {
    pub table_id: u32,
}

impl OpenTableResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table_id.to_le_bytes());
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        Ok(OpenTableResponse {
            table_id: r.u32()?,
        })
    }
}

/// `Create` request: the server assigns the object id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub table_id: u32,
    pub data: Vec<u8>,
}

impl CreateRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let table_id = r.u32()?;
        let len = r.u32()? as usize;
        Ok(CreateRequest {
            table_id,
            data: r.bytes(len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResponse {
    pub id: u64,
    pub version: u64,
}

impl CreateResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        Ok(CreateResponse {
            id: r.u64()?,
            version: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub table_id: u32,
    pub id: u64,
    pub reject_rules: RejectRules,
}

impl ReadRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        self.reject_rules.put(buf);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        Ok(ReadRequest {
            table_id: r.u32()?,
            id: r.u64()?,
            reject_rules: RejectRules::take(&mut r)?,
        })
    }
}

/// `Read` response. The version field is meaningful even on failure: a
/// rejected read reports the version it found (zero when the object does
/// not exist).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub version: u64,
    pub data: Vec<u8>,
}

impl ReadResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let version = r.u64()?;
        let len = r.u32()? as usize;
        Ok(ReadResponse {
            version,
            data: r.bytes(len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub table_id: u32,
    pub id: u64,
    pub reject_rules: RejectRules,
    pub data: Vec<u8>,
}

impl WriteRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        self.reject_rules.put(buf);
        buf.extend_from_slice(&self.data);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let table_id = r.u32()?;
        let id = r.u64()?;
        let len = r.u32()? as usize;
        let reject_rules = RejectRules::take(&mut r)?;
        Ok(WriteRequest {
            table_id,
            id,
            reject_rules,
            data: r.bytes(len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveRequest {
    pub table_id: u32,
    pub id: u64,
    pub reject_rules: RejectRules,
}

impl RemoveRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        self.reject_rules.put(buf);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        Ok(RemoveRequest {
            table_id: r.u32()?,
            id: r.u64()?,
            reject_rules: RejectRules::take(&mut r)?,
        })
    }
}

/// Shared by `Write` and `Remove` replies. As with reads, the version is
/// reported on rejection as well as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionResponse {
    pub version: u64,
}

impl VersionResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        Ok(VersionResponse { version: r.u64()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiReadRequest {
    pub requests: Vec<(u32, u64)>,
}

impl MultiReadRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.requests.len() as u32).to_le_bytes());
        for &(table_id, id) in &self.requests {
            buf.extend_from_slice(&table_id.to_le_bytes());
            buf.extend_from_slice(&id.to_le_bytes());
        }
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let count = r.u32()? as usize;
        let mut requests = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let table_id = r.u32()?;
            let id = r.u64()?;
            requests.push((table_id, id));
        }
        Ok(MultiReadRequest { requests })
    }
}

/// One per-request result inside a `MultiRead` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiReadPart {
    pub status: Status,
    pub version: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiReadResponse {
    pub parts: Vec<MultiReadPart>,
}

impl MultiReadResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.parts.len() as u32).to_le_bytes());
        for part in &self.parts {
            buf.extend_from_slice(&(part.status as u32).to_le_bytes());
            buf.extend_from_slice(&part.version.to_le_bytes());
            buf.extend_from_slice(&(part.data.len() as u32).to_le_bytes());
            buf.extend_from_slice(&part.data);
        }
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let count = r.u32()? as usize;
        let mut parts = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let status = Status::from_u32(r.u32()?)?;
            let version = r.u64()?;
            let len = r.u32()? as usize;
            parts.push(MultiReadPart {
                status,
                version,
                data: r.bytes(len)?.to_vec(),
            });
        }
        Ok(MultiReadResponse { parts })
    }
}

/// Serving state of one tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TabletState {
    Normal = 0,
    Recovering = 1,
}

impl TabletState {
    fn from_u8(value: u8) -> WireResult<Self> {
        match value {
            0 => Ok(TabletState::Normal),
            1 => Ok(TabletState::Recovering),
            other => Err(WireError::InvalidString(format!(
                "bad tablet state {other}"
            ))),
        }
    }
}

/// One `(table, [start..end])` assignment in a `SetTablets` or `Recover`
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletEntry {
    pub table_id: u32,
    pub start_id: u64,
    pub end_id: u64,
    pub state: TabletState,
}

impl TabletEntry {
    fn put(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.start_id.to_le_bytes());
        buf.extend_from_slice(&self.end_id.to_le_bytes());
        buf.push(self.state as u8);
    }

    fn take(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(TabletEntry {
            table_id: r.u32()?,
            start_id: r.u64()?,
            end_id: r.u64()?,
            state: TabletState::from_u8(r.u8()?)?,
        })
    }
}

pub fn encode_tablet_list(tablets: &[TabletEntry], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(tablets.len() as u32).to_le_bytes());
    for tablet in tablets {
        tablet.put(buf);
    }
}

pub fn decode_tablet_list(body: &[u8]) -> WireResult<Vec<TabletEntry>> {
    let mut r = Reader::new(body);
    take_tablet_list(&mut r)
}

fn take_tablet_list(r: &mut Reader<'_>) -> WireResult<Vec<TabletEntry>> {
    let count = r.u32()? as usize;
    let mut tablets = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        tablets.push(TabletEntry::take(r)?);
    }
    Ok(tablets)
}

/// One `(segment, replica locator)` pair in a `Recover` request. A segment
/// appears once per replica that may hold it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupListEntry {
    pub segment_id: u64,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverRequest {
    pub crashed_master_id: u64,
    pub partition_id: u64,
    pub tablets: Vec<TabletEntry>,
    pub backups: Vec<BackupListEntry>,
}

impl RecoverRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.crashed_master_id.to_le_bytes());
        buf.extend_from_slice(&self.partition_id.to_le_bytes());
        encode_tablet_list(&self.tablets, buf);
        buf.extend_from_slice(&(self.backups.len() as u32).to_le_bytes());
        for backup in &self.backups {
            buf.extend_from_slice(&backup.segment_id.to_le_bytes());
            buf.extend_from_slice(&(backup.locator.len() as u16).to_le_bytes());
            buf.extend_from_slice(backup.locator.as_bytes());
        }
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let crashed_master_id = r.u64()?;
        let partition_id = r.u64()?;
        let tablets = take_tablet_list(&mut r)?;
        let count = r.u32()? as usize;
        let mut backups = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let segment_id = r.u64()?;
            let len = r.u16()? as usize;
            backups.push(BackupListEntry {
                segment_id,
                locator: r.string(len)?,
            });
        }
        Ok(RecoverRequest {
            crashed_master_id,
            partition_id,
            tablets,
            backups,
        })
    }
}

/// Backup contract: push a range of freshly appended segment bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSegmentRequest {
    pub master_id: u64,
    pub segment_id: u64,
    pub offset: u32,
    pub close: bool,
    pub data: Vec<u8>,
}

impl WriteSegmentRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.master_id.to_le_bytes());
        buf.extend_from_slice(&self.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.push(self.close as u8);
        buf.extend_from_slice(&self.data);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let master_id = r.u64()?;
        let segment_id = r.u64()?;
        let offset = r.u32()?;
        let len = r.u32()? as usize;
        let close = r.u8()? != 0;
        Ok(WriteSegmentRequest {
            master_id,
            segment_id,
            offset,
            close,
            data: r.bytes(len)?.to_vec(),
        })
    }
}

/// Backup contract: fetch one segment's bytes for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetRecoveryDataRequest {
    pub master_id: u64,
    pub segment_id: u64,
    pub partition_id: u64,
}

impl GetRecoveryDataRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.master_id.to_le_bytes());
        buf.extend_from_slice(&self.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.partition_id.to_le_bytes());
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        Ok(GetRecoveryDataRequest {
            master_id: r.u64()?,
            segment_id: r.u64()?,
            partition_id: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRecoveryDataResponse {
    pub data: Vec<u8>,
}

impl GetRecoveryDataResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(body);
        let len = r.u32()? as usize;
        Ok(GetRecoveryDataResponse {
            data: r.bytes(len)?.to_vec(),
        })
    }
}
