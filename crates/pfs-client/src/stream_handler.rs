//! The token-stream listener task and the shared client-side state it
//! updates: one task per client session drains the bidirectional stream
//! and applies grants and revocations as they arrive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pfs_config::TokenKind;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tonic::Streaming;
use tracing::{debug, warn};

use pfs_proto::v1::{server_notification::Kind, FileToken as ProtoFileToken, ServerNotification};

use crate::data_cache::DataCache;
use crate::execstat::ExecStats;
use crate::token_cache::{ClientToken, TokenCache};

fn token_kind_from_proto(kind: i32) -> TokenKind {
    match pfs_proto::v1::TokenKind::try_from(kind) {
        Ok(pfs_proto::v1::TokenKind::Write) => TokenKind::Write,
        _ => TokenKind::Read,
    }
}

fn client_token_from_proto(t: &ProtoFileToken) -> ClientToken {
    ClientToken {
        start: t.start,
        end: t.end,
        kind: token_kind_from_proto(t.kind),
    }
}

/// Reconstructs the conflicting request's range from a revoked token and
/// its remainders: a remainder starting at `revoked.start` is the left
/// half, one ending at `revoked.end` is the right half, so whatever lies
/// between them (or all of `revoked` if there are none) is what actually
/// conflicted and must be dropped from the data cache.
fn invalidated_range(revoked: ClientToken, remainders: &[ClientToken]) -> (u64, u64) {
    let mut start = revoked.start;
    let mut end = revoked.end;
    for r in remainders {
        if r.start == revoked.start {
            start = r.end + 1;
        } else if r.end == revoked.end {
            end = r.start - 1;
        }
    }
    (start, end)
}

/// Shared client-side state: the token cache, data cache, execstat
/// counters, and the per-`(filename, type)` wait registry a user task
/// parks on while a `TokenRequest` is outstanding. Keying waiters by
/// `(filename, type)` relies on a client never having two outstanding
/// requests of the same type for the same file.
pub struct ClientState {
    pub tokens: Mutex<TokenCache>,
    pub cache: Mutex<DataCache>,
    pub stats: ExecStats,
    waiters: Mutex<HashMap<(String, TokenKind), Arc<Notify>>>,
    poisoned: AtomicBool,
}

impl ClientState {
    pub fn new(cache_blocks: usize) -> Self {
        Self {
            tokens: Mutex::new(TokenCache::new()),
            cache: Mutex::new(DataCache::new(cache_blocks)),
            stats: ExecStats::default(),
            waiters: Mutex::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
        }
    }

    /// True once the token stream has failed. Held tokens and cached data
    /// are gone and the session can no longer serve reads or writes.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Fails the session: discards every token and cached block, and wakes
    /// any waiter parked on an outstanding request so it observes the
    /// failure instead of blocking forever.
    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        *self.tokens.lock() = TokenCache::new();
        self.cache.lock().clear();
        for notify in self.waiters.lock().values() {
            notify.notify_waiters();
        }
    }

    /// The `Notify` for `(filename, kind)`, created on first use. Callers
    /// must obtain this and create `.notified()` before sending the
    /// `TokenRequest` that might race a grant in, since `notify_one` only
    /// stores a wakeup permit for the next waiter if none is parked yet.
    pub fn waiter(&self, filename: &str, kind: TokenKind) -> Arc<Notify> {
        self.waiters
            .lock()
            .entry((filename.to_string(), kind))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn apply_grant(&self, filename: &str, start: u64, end: u64, kind: TokenKind) {
        self.tokens.lock().grant(filename, start, end, kind);
        self.waiter(filename, kind).notify_one();
    }

    fn apply_revocation(&self, filename: &str, revoked: ClientToken, remainders: &[ClientToken]) {
        // The wire message carries the whole revoked token plus the parts
        // of it disjoint from the conflicting request; only the conflicting
        // middle leaves the data cache, the remainder ranges stay cached.
        let (start, end) = invalidated_range(revoked, remainders);
        let result = self.cache.lock().invalidate(filename, start, end);
        if result.touched {
            self.stats.record_invalidation();
        }
        self.tokens.lock().revoke(filename, revoked, remainders);
    }

    pub fn release_all(&self, filename: &str) {
        self.tokens.lock().release_all(filename);
        let dropped = self.cache.lock().close(filename);
        self.stats.record_close_evictions(dropped);
    }

    /// Inserts a freshly-fetched block into the data cache, recording any
    /// LRU eviction it causes against the `evictions` execstat counter.
    pub fn cache_update(&self, filename: &str, start: u64, end: u64, data: Vec<u8>) {
        let mut cache = self.cache.lock();
        let before = cache.evictions();
        cache.update(filename, start, end, data);
        let after = cache.evictions();
        drop(cache);
        if after > before {
            self.stats.record_evictions(after - before);
        }
    }
}

/// Drains `inbound`, applying every `Grant`/`Revocation` to `state`, until
/// the stream ends or errors. Either way the stream's death poisons the
/// session: the client cannot know which of its tokens the server still
/// honors, so it keeps none of them.
pub async fn run_listener(state: Arc<ClientState>, mut inbound: Streaming<ServerNotification>) {
    loop {
        let item = match inbound.next().await {
            Some(item) => item,
            None => break,
        };
        let notification = match item {
            Ok(n) => n,
            Err(status) => {
                warn!(error = %status, "token stream closed with error");
                break;
            }
        };
        match notification.kind {
            Some(Kind::Grant(g)) => {
                debug!(filename = %g.filename, start = g.start, end = g.end, "grant");
                state.apply_grant(&g.filename, g.start, g.end, token_kind_from_proto(g.kind));
            }
            Some(Kind::Revocation(r)) => {
                if r.new_tokens.is_empty() {
                    warn!(filename = %r.filename, "revocation with no revoked token");
                    continue;
                }
                let revoked = client_token_from_proto(&r.new_tokens[0]);
                let remainders: Vec<ClientToken> =
                    r.new_tokens[1..].iter().map(client_token_from_proto).collect();
                debug!(
                    filename = %r.filename,
                    start = revoked.start,
                    end = revoked.end,
                    remainders = remainders.len(),
                    "revocation"
                );
                state.apply_revocation(&r.filename, revoked, &remainders);
            }
            None => {}
        }
    }
    state.poison();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidated_range_is_the_gap_between_remainders() {
        let revoked = ClientToken {
            start: 0,
            end: 1023,
            kind: TokenKind::Read,
        };
        let remainders = [
            ClientToken { start: 0, end: 255, kind: TokenKind::Read },
            ClientToken { start: 768, end: 1023, kind: TokenKind::Read },
        ];
        assert_eq!(invalidated_range(revoked, &remainders), (256, 767));
        assert_eq!(invalidated_range(revoked, &[]), (0, 1023));
        assert_eq!(
            invalidated_range(revoked, &remainders[..1]),
            (256, 1023)
        );
    }

    #[test]
    fn poison_discards_tokens_and_cached_data() {
        let state = ClientState::new(4);
        state.tokens.lock().grant("f", 0, 9, TokenKind::Read);
        state.cache.lock().update("f", 0, 9, vec![0; 10]);

        state.poison();

        assert!(state.is_poisoned());
        assert!(state.tokens.lock().tokens_for("f").is_empty());
        assert!(state.cache.lock().is_empty());
    }
}
