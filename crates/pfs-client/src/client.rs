//! The client-facing PFS API: `create`/`open`/`read`/`write`/`close`/
//! `delete`/`fstat`/`execstat`, backed by the metadata RPC surface, the
//! token/data caches, and the stream listener.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pfs_config::{Mode, PfsConfig, PfsError, ServerList, TokenKind};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, warn};

use pfs_proto::v1::file_service_client::FileServiceClient;
use pfs_proto::v1::metadata_service_client::MetadataServiceClient;
use pfs_proto::v1::{
    CloseFileRequest, CreateFileRequest, DeleteChunkRequest, DeleteFileRequest, FileMetadataRequest,
    FinishRequest, InitializeRequest, OpenFileRequest, ReadChunkRequest, ReadFileRequest,
    ReadInstruction, TokenRequest, WriteChunkRequest, WriteInstruction, WriteToFileRequest,
};

use crate::execstat::ExecStatSnapshot;
use crate::stream_handler::{run_listener, ClientState};

/// `fstat`'s view of a file.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub stripe_width: u32,
    pub chunks: Vec<(u32, u64, u64)>,
}

fn token_kind_to_proto(kind: TokenKind) -> pfs_proto::v1::TokenKind {
    match kind {
        TokenKind::Read => pfs_proto::v1::TokenKind::Read,
        TokenKind::Write => pfs_proto::v1::TokenKind::Write,
    }
}

fn mode_to_proto(mode: Mode) -> pfs_proto::v1::FileMode {
    match mode {
        Mode::Read => pfs_proto::v1::FileMode::Read,
        Mode::Write => pfs_proto::v1::FileMode::Write,
    }
}

/// The part of a filename before its first `.`, matching the chunk-naming
/// stem convention.
fn stem(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn chunk_filename(server_index: u32, stem: &str, chunk_index: u64) -> String {
    format!("{server_index}_{stem}_{chunk_index}")
}

fn check_wire_error(error: &str) -> Result<(), PfsError> {
    if error.is_empty() {
        Ok(())
    } else {
        Err(PfsError::from_wire(error))
    }
}

struct OpenFileEntry {
    name: String,
    mode: Mode,
}

/// A connected PFS client session: one metadata connection, one connection
/// per file server, and the token stream listener task.
pub struct PfsClient {
    client_id: u64,
    config: PfsConfig,
    meta: MetadataServiceClient<Channel>,
    fileservers: Vec<FileServiceClient<Channel>>,
    state: Arc<ClientState>,
    token_tx: tokio::sync::mpsc::UnboundedSender<TokenRequest>,
    listener: JoinHandle<()>,
    open_files: Mutex<HashMap<u64, OpenFileEntry>>,
}

impl PfsClient {
    /// Connects to the metadata service and every file service named in
    /// `servers`, initializes a client session, and opens the token
    /// stream.
    pub async fn connect(servers: &ServerList, config: PfsConfig) -> Result<Self, PfsError> {
        let meta = MetadataServiceClient::connect(servers.metaserver().to_string()).await?;

        let mut fileservers = Vec::with_capacity(servers.fileservers().len());
        for addr in servers.fileservers() {
            fileservers.push(FileServiceClient::connect(addr.clone()).await?);
        }

        Self::connect_clients(meta, fileservers, config).await
    }

    /// Like [`Self::connect`], but takes already-constructed service
    /// clients instead of dialing a [`ServerList`]. Integration tests use
    /// this seam to wire the client to an in-process server pair over an
    /// in-memory transport instead of a real socket.
    pub async fn connect_clients(
        mut meta: MetadataServiceClient<Channel>,
        fileservers: Vec<FileServiceClient<Channel>>,
        config: PfsConfig,
    ) -> Result<Self, PfsError> {
        let init = meta
            .initialize(Request::new(InitializeRequest {}))
            .await?
            .into_inner();
        check_wire_error(&init.error)?;
        let client_id = init.client_id;

        let (token_tx, token_rx) = tokio::sync::mpsc::unbounded_channel::<TokenRequest>();
        let outbound = UnboundedReceiverStream::new(token_rx);
        let inbound = meta
            .token_stream(Request::new(outbound))
            .await?
            .into_inner();

        let state = Arc::new(ClientState::new(config.client_cache_blocks));
        let listener = tokio::spawn(run_listener(state.clone(), inbound));

        Ok(Self {
            client_id,
            config,
            meta,
            fileservers,
            state,
            token_tx,
            listener,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn execstat(&self) -> ExecStatSnapshot {
        self.state.stats.snapshot()
    }

    /// Ends the session: tells the metadata service to release every
    /// descriptor and token this client holds, then stops the listener.
    pub async fn finish(mut self) -> Result<(), PfsError> {
        let resp = self
            .meta
            .finish(Request::new(FinishRequest {
                client_id: self.client_id,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;
        self.listener.abort();
        Ok(())
    }

    pub async fn create(&mut self, name: &str, stripe_width: u32) -> Result<(), PfsError> {
        let resp = self
            .meta
            .create_file(Request::new(CreateFileRequest {
                name: name.to_string(),
                stripe_width,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)
    }

    pub async fn open(&mut self, name: &str, mode: Mode) -> Result<u64, PfsError> {
        let resp = self
            .meta
            .open_file(Request::new(OpenFileRequest {
                name: name.to_string(),
                mode: mode_to_proto(mode) as i32,
                client_id: self.client_id,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;
        self.open_files.lock().insert(
            resp.descriptor,
            OpenFileEntry {
                name: name.to_string(),
                mode,
            },
        );
        Ok(resp.descriptor)
    }

    pub async fn close(&mut self, descriptor: u64) -> Result<(), PfsError> {
        let resp = self
            .meta
            .close_file(Request::new(CloseFileRequest {
                descriptor,
                client_id: self.client_id,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;
        if let Some(entry) = self.open_files.lock().remove(&descriptor) {
            self.state.release_all(&entry.name);
        }
        Ok(())
    }

    pub async fn delete(&mut self, name: &str) -> Result<(), PfsError> {
        let resp = self
            .meta
            .delete_file(Request::new(DeleteFileRequest {
                name: name.to_string(),
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)
    }

    pub async fn fstat(&mut self, descriptor: u64) -> Result<FileStat, PfsError> {
        let resp = self
            .meta
            .file_metadata(Request::new(FileMetadataRequest { descriptor }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;
        let metadata = resp
            .metadata
            .ok_or_else(|| PfsError::TransportFailed("missing metadata in response".into()))?;
        let recipe = metadata.recipe.unwrap_or_default();
        Ok(FileStat {
            name: metadata.name,
            size: metadata.size,
            ctime: metadata.ctime,
            mtime: metadata.mtime,
            stripe_width: recipe.stripe_width,
            chunks: recipe
                .chunks
                .into_iter()
                .map(|c| (c.server_index, c.start_byte, c.end_byte))
                .collect(),
        })
    }

    fn open_entry(&self, descriptor: u64) -> Result<(String, Mode), PfsError> {
        self.open_files
            .lock()
            .get(&descriptor)
            .map(|e| (e.name.clone(), e.mode))
            .ok_or_else(|| PfsError::NotFound(format!("descriptor {descriptor} not open")))
    }

    async fn request_token(
        &self,
        filename: &str,
        descriptor: u64,
        start: u64,
        end: u64,
        kind: TokenKind,
    ) -> Result<(), PfsError> {
        let notify = self.state.waiter(filename, kind);
        let notified = notify.notified();

        debug!(filename, start, end, ?kind, "requesting token");
        self.token_tx
            .send(TokenRequest {
                descriptor,
                client_id: self.client_id,
                start,
                end,
                kind: token_kind_to_proto(kind) as i32,
            })
            .map_err(|_| PfsError::TransportFailed("token stream closed".into()))?;

        notified.await;
        if self.state.is_poisoned() {
            return Err(PfsError::TransportFailed("token stream closed".into()));
        }
        Ok(())
    }

    fn check_session(&self) -> Result<(), PfsError> {
        if self.state.is_poisoned() {
            warn!("operation on a session whose token stream has failed");
            return Err(PfsError::TransportFailed(
                "token stream closed; reinitialize the session".into(),
            ));
        }
        Ok(())
    }

    /// Reads up to `num_bytes` bytes at `offset`, returning fewer only at
    /// end of file.
    pub async fn read(&mut self, descriptor: u64, num_bytes: u64, offset: u64) -> Result<Vec<u8>, PfsError> {
        if num_bytes == 0 {
            return Ok(Vec::new());
        }
        self.check_session()?;
        let (filename, _) = self.open_entry(descriptor)?;
        let end = offset + num_bytes - 1;

        if let Some(cached) = self.state.cache.lock().read(&filename, offset, end) {
            self.state.stats.record_read_hit();
            return Ok(cached);
        }

        let covered = self
            .state
            .tokens
            .lock()
            .covers(&filename, offset, end, TokenKind::Read);
        if !covered {
            self.request_token(&filename, descriptor, offset, end, TokenKind::Read)
                .await?;
        }

        let resp = self
            .meta
            .read_file(Request::new(ReadFileRequest {
                descriptor,
                offset,
                num_bytes,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;
        if resp.instructions.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for instr in &resp.instructions {
            let bytes = self.read_chunk(&resp.filename, instr).await?;
            out.extend_from_slice(&bytes);
        }

        if !out.is_empty() {
            let result_end = offset + out.len() as u64 - 1;
            self.state.cache_update(&filename, offset, result_end, out.clone());
        }
        Ok(out)
    }

    async fn read_chunk(&mut self, filename: &str, instr: &ReadInstruction) -> Result<Vec<u8>, PfsError> {
        let name = chunk_filename(instr.server_index, stem(filename), instr.chunk_index);
        let local_offset = instr.start - instr.chunk_index * self.config.chunk_size();
        let length = instr.end - instr.start + 1;

        let client = self
            .fileservers
            .get_mut(instr.server_index as usize)
            .ok_or_else(|| PfsError::TransportFailed(format!("no file server {}", instr.server_index)))?;

        let resp = client
            .read_file(Request::new(ReadChunkRequest {
                chunk_filename: name,
                chunk_index: instr.chunk_index,
                offset: local_offset,
                length,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;
        Ok(resp.content)
    }

    /// Writes `data` at `offset`. The write token round trip happens
    /// first, so overlapping readers are revoked before any byte lands.
    pub async fn write(&mut self, descriptor: u64, data: &[u8], offset: u64) -> Result<u64, PfsError> {
        if data.is_empty() {
            return Ok(0);
        }
        self.check_session()?;
        let (filename, mode) = self.open_entry(descriptor)?;
        if mode != Mode::Write {
            return Err(PfsError::InvalidArgument(format!(
                "descriptor {descriptor} was not opened for write"
            )));
        }
        let end = offset + data.len() as u64 - 1;

        let covered = self
            .state
            .tokens
            .lock()
            .covers(&filename, offset, end, TokenKind::Write);
        if covered {
            self.state.stats.record_write_hit();
        } else {
            self.request_token(&filename, descriptor, offset, end, TokenKind::Write)
                .await?;
        }

        let resp = self
            .meta
            .write_to_file(Request::new(WriteToFileRequest {
                descriptor,
                offset,
                num_bytes: data.len() as u64,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)?;

        for instr in &resp.instructions {
            self.write_chunk(&resp.filename, instr, data, offset).await?;
        }

        self.state.stats.record_writeback();
        Ok(data.len() as u64)
    }

    async fn write_chunk(
        &mut self,
        filename: &str,
        instr: &WriteInstruction,
        data: &[u8],
        request_offset: u64,
    ) -> Result<(), PfsError> {
        let name = chunk_filename(instr.server_index, stem(filename), instr.chunk_index);
        let local_offset = instr.start - instr.chunk_index * self.config.chunk_size();
        let lo = (instr.start - request_offset) as usize;
        let hi = (instr.end - request_offset) as usize;
        let slice = data[lo..=hi].to_vec();

        let client = self
            .fileservers
            .get_mut(instr.server_index as usize)
            .ok_or_else(|| PfsError::TransportFailed(format!("no file server {}", instr.server_index)))?;

        let resp = client
            .write_file(Request::new(WriteChunkRequest {
                chunk_filename: name,
                chunk_index: instr.chunk_index,
                offset: local_offset,
                buf: slice,
            }))
            .await?
            .into_inner();
        check_wire_error(&resp.error)
    }

    /// Deletes `name` at the metadata service, then every chunk file for it
    /// on every file server.
    pub async fn delete_with_chunks(&mut self, name: &str) -> Result<(), PfsError> {
        self.delete(name).await?;
        let stem = stem(name).to_string();
        for (index, client) in self.fileservers.iter_mut().enumerate() {
            let resp = client
                .delete_file(Request::new(DeleteChunkRequest {
                    filename_stem: stem.clone(),
                    fileserver_number: index as u32,
                }))
                .await?
                .into_inner();
            if !resp.error.is_empty() {
                warn!(server = index, error = %resp.error, "chunk delete failed");
            }
        }
        Ok(())
    }
}
