//! Client stub for the master service. Production clients live in their
//! own crate; this one exists for tooling and the integration suites.

use std::sync::Arc;

use kiln_dispatch::{Session, TransportError};
use kiln_wire::rpc::{BackupListEntry, TabletEntry};
use kiln_wire::{
    CreateRequest, CreateResponse, MultiReadPart, MultiReadRequest, MultiReadResponse, Opcode,
    OpenTableResponse, ReadRequest, ReadResponse, RecoverRequest, RejectRules, RemoveRequest,
    RequestHeader, ResponseHeader, ServiceType, Status, TableNameRequest, VersionResponse,
    WireError, WriteRequest, RESPONSE_HEADER_LEN,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server refused the operation. For version-bearing operations
    /// `version` is the version the server found (zero when the object did
    /// not exist).
    #[error("rpc failed with {status:?} (found version {version})")]
    Rpc { status: Status, version: u64 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ClientError {
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Rpc { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn found_version(&self) -> u64 {
        match self {
            ClientError::Rpc { version, .. } => *version,
            _ => 0,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

pub struct MasterClient {
    session: Arc<dyn Session>,
}

impl MasterClient {
    pub fn new(session: Arc<dyn Session>) -> MasterClient {
        MasterClient { session }
    }

    fn request(opcode: Opcode, service: ServiceType) -> Vec<u8> {
        let mut request = Vec::new();
        RequestHeader::new(opcode, service).encode(&mut request);
        request
    }

    fn call(&self, request: Vec<u8>) -> ClientResult<(Status, Vec<u8>)> {
        let reply = self.session.send(request).wait()?;
        let header = ResponseHeader::decode(&reply)?;
        let body = reply[RESPONSE_HEADER_LEN.min(reply.len())..].to_vec();
        Ok((header.status, body))
    }

    pub fn ping(&self) -> ClientResult<()> {
        let (status, _) = self.call(Self::request(Opcode::Ping, ServiceType::Master))?;
        expect_ok(status, 0)
    }

    pub fn create_table(&self, name: &str) -> ClientResult<()> {
        let mut request = Self::request(Opcode::CreateTable, ServiceType::Master);
        TableNameRequest {
            name: name.to_string(),
        }
        .encode(&mut request);
        let (status, _) = self.call(request)?;
        expect_ok(status, 0)
    }

    pub fn open_table(&self, name: &str) -> ClientResult<u32> {
        let mut request = Self::request(Opcode::OpenTable, ServiceType::Master);
        TableNameRequest {
            name: name.to_string(),
        }
        .encode(&mut request);
        let (status, body) = self.call(request)?;
        expect_ok(status, 0)?;
        Ok(OpenTableResponse::decode(&body)?.table_id)
    }

    pub fn drop_table(&self, name: &str) -> ClientResult<()> {
        let mut request = Self::request(Opcode::DropTable, ServiceType::Master);
        TableNameRequest {
            name: name.to_string(),
        }
        .encode(&mut request);
        let (status, _) = self.call(request)?;
        expect_ok(status, 0)
    }

    /// Creates an object with a server-assigned id; returns `(id, version)`.
    pub fn create(&self, table_id: u32, data: &[u8]) -> ClientResult<(u64, u64)> {
        let mut request = Self::request(Opcode::Create, ServiceType::Master);
        CreateRequest {
            table_id,
            data: data.to_vec(),
        }
        .encode(&mut request);
        let (status, body) = self.call(request)?;
        expect_ok(status, 0)?;
        let response = CreateResponse::decode(&body)?;
        Ok((response.id, response.version))
    }

    /// Reads an object; returns `(data, version)`. On rejection the error
    /// carries the version the server found.
    pub fn read(
        &self,
        table_id: u32,
        id: u64,
        rules: Option<&RejectRules>,
    ) -> ClientResult<(Vec<u8>, u64)> {
        let mut request = Self::request(Opcode::Read, ServiceType::Master);
        ReadRequest {
            table_id,
            id,
            reject_rules: rules.copied().unwrap_or_default(),
        }
        .encode(&mut request);
        let (status, body) = self.call(request)?;
        let response = ReadResponse::decode(&body).unwrap_or(ReadResponse {
            version: 0,
            data: Vec::new(),
        });
        expect_ok(status, response.version)?;
        Ok((response.data, response.version))
    }

    pub fn write(
        &self,
        table_id: u32,
        id: u64,
        data: &[u8],
        rules: Option<&RejectRules>,
    ) -> ClientResult<u64> {
        let mut request = Self::request(Opcode::Write, ServiceType::Master);
        WriteRequest {
            table_id,
            id,
            reject_rules: rules.copied().unwrap_or_default(),
            data: data.to_vec(),
        }
        .encode(&mut request);
        let (status, body) = self.call(request)?;
        let version = VersionResponse::decode(&body)
            .map(|response| response.version)
            .unwrap_or(0);
        expect_ok(status, version)?;
        Ok(version)
    }

    /// Removes an object, returning its version prior to deletion (zero if
    /// it did not exist).
    pub fn remove(
        &self,
        table_id: u32,
        id: u64,
        rules: Option<&RejectRules>,
    ) -> ClientResult<u64> {
        let mut request = Self::request(Opcode::Remove, ServiceType::Master);
        RemoveRequest {
            table_id,
            id,
            reject_rules: rules.copied().unwrap_or_default(),
        }
        .encode(&mut request);
        let (status, body) = self.call(request)?;
        let version = VersionResponse::decode(&body)
            .map(|response| response.version)
            .unwrap_or(0);
        expect_ok(status, version)?;
        Ok(version)
    }

    /// Batched independent reads; each part reports its own status.
    pub fn multi_read(&self, requests: &[(u32, u64)]) -> ClientResult<Vec<MultiReadPart>> {
        let mut request = Self::request(Opcode::MultiRead, ServiceType::Master);
        MultiReadRequest {
            requests: requests.to_vec(),
        }
        .encode(&mut request);
        let (status, body) = self.call(request)?;
        expect_ok(status, 0)?;
        Ok(MultiReadResponse::decode(&body)?.parts)
    }

    pub fn set_tablets(&self, tablets: &[TabletEntry]) -> ClientResult<()> {
        let mut request = Self::request(Opcode::SetTablets, ServiceType::Master);
        kiln_wire::rpc::encode_tablet_list(tablets, &mut request);
        let (status, _) = self.call(request)?;
        expect_ok(status, 0)
    }

    pub fn recover(
        &self,
        crashed_master_id: u64,
        partition_id: u64,
        tablets: &[TabletEntry],
        backups: &[BackupListEntry],
    ) -> ClientResult<()> {
        let mut request = Self::request(Opcode::Recover, ServiceType::Master);
        RecoverRequest {
            crashed_master_id,
            partition_id,
            tablets: tablets.to_vec(),
            backups: backups.to_vec(),
        }
        .encode(&mut request);
        let (status, _) = self.call(request)?;
        expect_ok(status, 0)
    }
}

fn expect_ok(status: Status, version: u64) -> ClientResult<()> {
    if status == Status::Ok {
        Ok(())
    } else {
        Err(ClientError::Rpc { status, version })
    }
}
