//! The byte-range token directory and revocation protocol.
//!
//! This module is transport-agnostic: it knows about token conflicts,
//! remainders, grants and revocations, but nothing about gRPC. The service
//! layer wires it to per-client notification channels.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pfs_config::TokenKind;

/// A capability over `[start, end]` (inclusive) held by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileToken {
    pub start: u64,
    pub end: u64,
    pub kind: TokenKind,
    pub client_id: u64,
}

impl FileToken {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }

    /// The parts of this token disjoint from `[start, end]`: zero, one, or
    /// two sub-ranges.
    fn remainders(&self, start: u64, end: u64) -> Vec<FileToken> {
        let mut out = Vec::with_capacity(2);
        if self.start < start {
            out.push(FileToken {
                start: self.start,
                end: start - 1,
                kind: self.kind,
                client_id: self.client_id,
            });
        }
        if self.end > end {
            out.push(FileToken {
                start: end + 1,
                end: self.end,
                kind: self.kind,
                client_id: self.client_id,
            });
        }
        out
    }
}

/// A message the server sends down a client's stream.
#[derive(Debug, Clone)]
pub enum Notification {
    Grant {
        filename: String,
        start: u64,
        end: u64,
        kind: TokenKind,
        client_id: u64,
    },
    /// `revoked` is the token taken away; `remainders` are the disjoint
    /// sub-ranges the client may keep, in the revoked token's type, still
    /// held by the same client.
    Revocation {
        filename: String,
        revoked: FileToken,
        remainders: Vec<FileToken>,
    },
}

/// Where to deliver a [`Notification`] for a given client. The metaserver's
/// gRPC layer implements this over a `tokio::sync::mpsc` channel; tests can
/// use a simpler in-memory sink.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, client_id: u64, notification: Notification);
}

/// Per-file token state, each guarded by its own lock.
#[derive(Default)]
struct FileTokens {
    tokens: Vec<FileToken>,
}

/// The metadata service's authoritative token directory across all files.
pub struct TokenDirectory<S: NotificationSink> {
    files: Mutex<HashMap<String, Arc<Mutex<FileTokens>>>>,
    sink: S,
}

impl<S: NotificationSink> TokenDirectory<S> {
    pub fn new(sink: S) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            sink,
        }
    }

    fn file_lock(&self, filename: &str) -> Arc<Mutex<FileTokens>> {
        let mut files = self.files.lock();
        files
            .entry(filename.to_string())
            .or_default()
            .clone()
    }

    /// Request a token. Revokes every conflicting token held by another
    /// client, then grants the full requested range to `client_id`. The
    /// grant is not dispatched until every revocation has been.
    pub fn request(&self, filename: &str, start: u64, end: u64, kind: TokenKind, client_id: u64) {
        let file_lock = self.file_lock(filename);
        let mut file = file_lock.lock();

        let is_write = matches!(kind, TokenKind::Write);
        let mut remaining = Vec::with_capacity(file.tokens.len());
        for existing in file.tokens.drain(..) {
            let conflicts = existing.client_id != client_id
                && existing.overlaps(start, end)
                && (is_write || matches!(existing.kind, TokenKind::Write));

            if !conflicts {
                remaining.push(existing);
                continue;
            }

            let remainders = existing.remainders(start, end);
            self.sink.notify(
                existing.client_id,
                Notification::Revocation {
                    filename: filename.to_string(),
                    revoked: existing,
                    remainders,
                },
            );
        }
        file.tokens = remaining;

        file.tokens.push(FileToken {
            start,
            end,
            kind,
            client_id,
        });

        self.sink.notify(
            client_id,
            Notification::Grant {
                filename: filename.to_string(),
                start,
                end,
                kind,
                client_id,
            },
        );
    }

    /// Drop every token `client_id` holds on `filename`, with no
    /// notification to the holder.
    pub fn release_all(&self, filename: &str, client_id: u64) {
        let file_lock = self.file_lock(filename);
        let mut file = file_lock.lock();
        file.tokens.retain(|t| t.client_id != client_id);
    }

    /// Current tokens for a file, for introspection/tests.
    pub fn tokens_for(&self, filename: &str) -> Vec<FileToken> {
        let file_lock = self.file_lock(filename);
        let tokens = file_lock.lock().tokens.clone();
        tokens
    }
}
