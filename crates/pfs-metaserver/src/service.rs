//! gRPC wiring for the metadata service: translates `pfs_proto` messages
//! into calls on [`FileRegistry`] and [`TokenDirectory`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use pfs_config::{Mode, PfsConfig, PfsError, TokenKind};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use pfs_proto::v1::metadata_service_server::MetadataService;
use pfs_proto::v1::{
    server_notification::Kind as NotificationKind, ChunkInfo, CloseFileRequest,
    CloseFileResponse, CreateFileRequest, CreateFileResponse, DeleteFileRequest,
    DeleteFileResponse, FileMetadata, FileMetadataRequest, FileMetadataResponse, FileMode,
    FileRecipe, FinishRequest, FinishResponse, Grant as ProtoGrant, InitializeRequest,
    InitializeResponse, OpenFileRequest, OpenFileResponse, PingRequest, PingResponse,
    ReadFileRequest, ReadFileResponse, ReadInstruction, Revocation as ProtoRevocation,
    ServerNotification, TokenKind as ProtoTokenKind, TokenRequest, WriteInstruction,
    WriteToFileRequest, WriteToFileResponse,
};

use crate::registry::FileRegistry;
use crate::tokens::{FileToken, Notification, NotificationSink, TokenDirectory};

fn mode_from_proto(mode: i32) -> Result<Mode, PfsError> {
    match FileMode::try_from(mode) {
        Ok(FileMode::Read) => Ok(Mode::Read),
        Ok(FileMode::Write) => Ok(Mode::Write),
        _ => Err(PfsError::InvalidArgument(format!("unrecognized mode {mode}"))),
    }
}

fn token_kind_from_proto(kind: i32) -> TokenKind {
    match ProtoTokenKind::try_from(kind) {
        Ok(ProtoTokenKind::Write) => TokenKind::Write,
        _ => TokenKind::Read,
    }
}

fn token_kind_to_proto(kind: TokenKind) -> ProtoTokenKind {
    match kind {
        TokenKind::Read => ProtoTokenKind::Read,
        TokenKind::Write => ProtoTokenKind::Write,
    }
}

fn file_token_to_proto(t: FileToken) -> pfs_proto::v1::FileToken {
    pfs_proto::v1::FileToken {
        start: t.start,
        end: t.end,
        kind: token_kind_to_proto(t.kind) as i32,
        client_id: t.client_id,
    }
}

fn notification_to_proto(n: Notification) -> ServerNotification {
    let kind = match n {
        Notification::Grant {
            filename,
            start,
            end,
            kind,
            client_id,
        } => NotificationKind::Grant(ProtoGrant {
            filename,
            start,
            end,
            kind: token_kind_to_proto(kind) as i32,
            client_id,
        }),
        Notification::Revocation {
            filename,
            revoked,
            remainders,
        } => {
            let mut new_tokens = Vec::with_capacity(1 + remainders.len());
            new_tokens.push(file_token_to_proto(revoked));
            new_tokens.extend(remainders.into_iter().map(file_token_to_proto));
            NotificationKind::Revocation(ProtoRevocation {
                filename,
                new_tokens,
            })
        }
    };
    ServerNotification { kind: Some(kind) }
}

type OutgoingSender = mpsc::UnboundedSender<Result<ServerNotification, Status>>;

/// Registry of live token-stream senders, one per connected client. This is
/// the [`NotificationSink`] the token directory writes through; sending
/// here is a plain channel push, never an `.await`, so it is safe to call
/// while holding the token directory's per-file lock.
#[derive(Default)]
struct ClientStreams {
    senders: SyncMutex<HashMap<u64, OutgoingSender>>,
}

impl ClientStreams {
    fn register(&self, client_id: u64, tx: OutgoingSender) {
        self.senders.lock().insert(client_id, tx);
    }

    fn remove(&self, client_id: u64) {
        self.senders.lock().remove(&client_id);
    }
}

impl NotificationSink for Arc<ClientStreams> {
    fn notify(&self, client_id: u64, notification: Notification) {
        let proto = notification_to_proto(notification);
        let mut senders = self.senders.lock();
        let dead = match senders.get(&client_id) {
            Some(tx) => tx.send(Ok(proto)).is_err(),
            None => {
                warn!(client_id, "dropping notification for unknown stream");
                false
            }
        };
        if dead {
            senders.remove(&client_id);
        }
    }
}

struct MetaShared {
    registry: FileRegistry,
    directory: TokenDirectory<Arc<ClientStreams>>,
    streams: Arc<ClientStreams>,
}

impl MetaShared {
    /// Emulates a hard Close of every descriptor the client still holds:
    /// used both by the explicit `Finish` RPC and by token-stream
    /// disconnect, so a dropped connection cannot strand tokens.
    fn cleanup_client(&self, client_id: u64) {
        for descriptor in self.registry.descriptors_for_client(client_id) {
            if let Ok((filename, owner)) = self.registry.close(descriptor) {
                self.directory.release_all(&filename, owner);
            }
        }
        self.streams.remove(client_id);
    }
}

pub struct MetaService {
    shared: Arc<MetaShared>,
    config: PfsConfig,
    num_file_servers: u32,
}

impl MetaService {
    pub fn new(config: PfsConfig, num_file_servers: u32) -> Self {
        let streams = Arc::new(ClientStreams::default());
        Self {
            shared: Arc::new(MetaShared {
                registry: FileRegistry::new(),
                directory: TokenDirectory::new(streams.clone()),
                streams,
            }),
            config,
            num_file_servers,
        }
    }
}

fn err_response<T: Default>(field_setter: impl FnOnce(&mut T, String), err: PfsError) -> T {
    let mut resp = T::default();
    field_setter(&mut resp, err.to_wire());
    resp
}

#[tonic::async_trait]
impl MetadataService for MetaService {
    async fn ping(&self, _req: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse { ok: true }))
    }

    async fn initialize(
        &self,
        _req: Request<InitializeRequest>,
    ) -> Result<Response<InitializeResponse>, Status> {
        let client_id = self.shared.registry.initialize_client();
        info!(client_id, "client initialized");
        Ok(Response::new(InitializeResponse {
            client_id,
            error: String::new(),
        }))
    }

    async fn finish(
        &self,
        req: Request<FinishRequest>,
    ) -> Result<Response<FinishResponse>, Status> {
        let client_id = req.into_inner().client_id;
        self.shared.cleanup_client(client_id);
        info!(client_id, "client finished");
        Ok(Response::new(FinishResponse {
            error: String::new(),
        }))
    }

    async fn create_file(
        &self,
        req: Request<CreateFileRequest>,
    ) -> Result<Response<CreateFileResponse>, Status> {
        let req = req.into_inner();
        let resp = match self
            .shared
            .registry
            .create(&req.name, req.stripe_width, self.num_file_servers)
        {
            Ok(()) => CreateFileResponse {
                error: String::new(),
            },
            Err(e) => {
                warn!(name = %req.name, error = %e, "create_file failed");
                err_response(|r: &mut CreateFileResponse, s| r.error = s, e)
            }
        };
        Ok(Response::new(resp))
    }

    async fn open_file(
        &self,
        req: Request<OpenFileRequest>,
    ) -> Result<Response<OpenFileResponse>, Status> {
        let req = req.into_inner();
        let resp = match mode_from_proto(req.mode).and_then(|mode| {
            self.shared.registry.open(&req.name, mode, req.client_id)
        }) {
            Ok(descriptor) => OpenFileResponse {
                descriptor,
                error: String::new(),
            },
            Err(e) => err_response(|r: &mut OpenFileResponse, s| r.error = s, e),
        };
        Ok(Response::new(resp))
    }

    async fn close_file(
        &self,
        req: Request<CloseFileRequest>,
    ) -> Result<Response<CloseFileResponse>, Status> {
        let descriptor = req.into_inner().descriptor;
        let resp = match self.shared.registry.close(descriptor) {
            Ok((filename, owner)) => {
                self.shared.directory.release_all(&filename, owner);
                debug!(descriptor, %filename, "closed");
                CloseFileResponse {
                    error: String::new(),
                }
            }
            Err(e) => err_response(|r: &mut CloseFileResponse, s| r.error = s, e),
        };
        Ok(Response::new(resp))
    }

    async fn delete_file(
        &self,
        req: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let name = req.into_inner().name;
        let resp = match self.shared.registry.delete(&name) {
            Ok(()) => DeleteFileResponse {
                error: String::new(),
            },
            Err(e) => err_response(|r: &mut DeleteFileResponse, s| r.error = s, e),
        };
        Ok(Response::new(resp))
    }

    async fn file_metadata(
        &self,
        req: Request<FileMetadataRequest>,
    ) -> Result<Response<FileMetadataResponse>, Status> {
        let descriptor = req.into_inner().descriptor;
        let resp = match self.shared.registry.stat(descriptor) {
            Ok(stat) => {
                let chunks = stat
                    .chunks
                    .into_iter()
                    .map(|(index, extent)| ChunkInfo {
                        index,
                        server_index: pfs_striping::server_for_chunk(index, stat.stripe_width),
                        start_byte: extent.start_byte,
                        end_byte: extent.end_byte,
                    })
                    .collect();
                FileMetadataResponse {
                    metadata: Some(FileMetadata {
                        name: stat.name,
                        size: stat.size,
                        ctime: stat.ctime,
                        mtime: stat.mtime,
                        recipe: Some(FileRecipe {
                            stripe_width: stat.stripe_width,
                            chunks,
                        }),
                    }),
                    error: String::new(),
                }
            }
            Err(e) => err_response(|r: &mut FileMetadataResponse, s| r.error = s, e),
        };
        Ok(Response::new(resp))
    }

    async fn read_file(
        &self,
        req: Request<ReadFileRequest>,
    ) -> Result<Response<ReadFileResponse>, Status> {
        let req = req.into_inner();
        let resp = match self
            .shared
            .registry
            .read_plan(req.descriptor, req.offset, req.num_bytes, &self.config)
        {
            Ok((filename, plan)) => ReadFileResponse {
                filename,
                instructions: plan
                    .into_iter()
                    .map(|p| ReadInstruction {
                        chunk_index: p.chunk_index,
                        server_index: p.server_index,
                        start: p.start,
                        end: p.end,
                    })
                    .collect(),
                error: String::new(),
            },
            Err(e) => err_response(|r: &mut ReadFileResponse, s| r.error = s, e),
        };
        Ok(Response::new(resp))
    }

    async fn write_to_file(
        &self,
        req: Request<WriteToFileRequest>,
    ) -> Result<Response<WriteToFileResponse>, Status> {
        let req = req.into_inner();
        let resp = match self
            .shared
            .registry
            .write_plan(req.descriptor, req.offset, req.num_bytes, &self.config)
        {
            Ok((filename, plan)) => WriteToFileResponse {
                filename,
                instructions: plan
                    .into_iter()
                    .map(|p| WriteInstruction {
                        chunk_index: p.chunk_index,
                        server_index: p.server_index,
                        start: p.start,
                        end: p.end,
                    })
                    .collect(),
                error: String::new(),
            },
            Err(e) => err_response(|r: &mut WriteToFileResponse, s| r.error = s, e),
        };
        Ok(Response::new(resp))
    }

    type TokenStreamStream =
        Pin<Box<dyn Stream<Item = Result<ServerNotification, Status>> + Send + 'static>>;

    async fn token_stream(
        &self,
        req: Request<Streaming<TokenRequest>>,
    ) -> Result<Response<Self::TokenStreamStream>, Status> {
        let mut incoming = req.into_inner();
        let (tx, rx) = mpsc::unbounded_channel();

        // The response stream must be handed back before any request
        // arrives, so a dedicated task drains the incoming side for the
        // life of the connection.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut registered_client: Option<u64> = None;

            while let Some(item) = incoming.next().await {
                let req = match item {
                    Ok(r) => r,
                    Err(status) => {
                        warn!(error = %status, "token stream read error");
                        break;
                    }
                };

                if registered_client != Some(req.client_id) {
                    shared.streams.register(req.client_id, tx.clone());
                    registered_client = Some(req.client_id);
                }

                match shared.registry.descriptor_owner(req.descriptor) {
                    Some((filename, owner)) if owner == req.client_id => {
                        let kind = token_kind_from_proto(req.kind);
                        debug!(
                            client_id = req.client_id,
                            %filename,
                            start = req.start,
                            end = req.end,
                            ?kind,
                            "token request"
                        );
                        shared
                            .directory
                            .request(&filename, req.start, req.end, kind, req.client_id);
                    }
                    Some((filename, owner)) => {
                        warn!(
                            client_id = req.client_id,
                            owner, %filename, "token request for descriptor owned by another client"
                        );
                    }
                    None => {
                        warn!(descriptor = req.descriptor, "token request for unknown descriptor");
                    }
                }
            }

            if let Some(client_id) = registered_client {
                shared.cleanup_client(client_id);
            }
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }
}
