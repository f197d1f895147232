//! gRPC wiring for the file service.

use pfs_config::PfsError;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use pfs_proto::v1::file_service_server::FileService;
use pfs_proto::v1::{
    DeleteChunkRequest, DeleteChunkResponse, InitializeRequest, InitializeResponse, PingRequest,
    PingResponse, ReadChunkRequest, ReadChunkResponse, WriteChunkRequest, WriteChunkResponse,
};

use crate::storage::ChunkStore;

pub struct FileServerService {
    store: ChunkStore,
    server_index: u32,
}

impl FileServerService {
    pub fn new(store: ChunkStore, server_index: u32) -> Self {
        Self {
            store,
            server_index,
        }
    }
}

#[tonic::async_trait]
impl FileService for FileServerService {
    async fn ping(&self, _req: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse { ok: true }))
    }

    async fn initialize(
        &self,
        _req: Request<InitializeRequest>,
    ) -> Result<Response<InitializeResponse>, Status> {
        Ok(Response::new(InitializeResponse {
            client_id: 0,
            error: String::new(),
        }))
    }

    async fn write_file(
        &self,
        req: Request<WriteChunkRequest>,
    ) -> Result<Response<WriteChunkResponse>, Status> {
        let req = req.into_inner();

        debug!(
            chunk = %req.chunk_filename,
            offset = req.offset,
            len = req.buf.len(),
            "write chunk"
        );

        let resp = match self.store.write(&req.chunk_filename, req.offset, &req.buf).await {
            Ok(n) => WriteChunkResponse {
                bytes_written: n,
                error: String::new(),
            },
            Err(e) => {
                warn!(chunk = %req.chunk_filename, error = %e, "write failed");
                WriteChunkResponse {
                    bytes_written: 0,
                    error: PfsError::TransportFailed(e.to_string()).to_wire(),
                }
            }
        };
        Ok(Response::new(resp))
    }

    async fn read_file(
        &self,
        req: Request<ReadChunkRequest>,
    ) -> Result<Response<ReadChunkResponse>, Status> {
        let req = req.into_inner();

        let resp = match self.store.read(&req.chunk_filename, req.offset, req.length).await {
            Ok(content) => ReadChunkResponse {
                bytes_read: content.len() as u64,
                content,
                error: String::new(),
            },
            Err(e) => {
                warn!(chunk = %req.chunk_filename, error = %e, "read failed");
                ReadChunkResponse {
                    content: Vec::new(),
                    bytes_read: 0,
                    error: PfsError::TransportFailed(e.to_string()).to_wire(),
                }
            }
        };
        Ok(Response::new(resp))
    }

    async fn delete_file(
        &self,
        req: Request<DeleteChunkRequest>,
    ) -> Result<Response<DeleteChunkResponse>, Status> {
        let req = req.into_inner();
        debug!(
            server_index = self.server_index,
            stem = %req.filename_stem,
            "delete chunks"
        );
        let resp = match self
            .store
            .delete_all(req.fileserver_number, &req.filename_stem)
            .await
        {
            Ok(()) => DeleteChunkResponse {
                error: String::new(),
            },
            Err(e) => DeleteChunkResponse {
                error: PfsError::TransportFailed(e.to_string()).to_wire(),
            },
        };
        Ok(Response::new(resp))
    }
}
