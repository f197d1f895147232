//! A client's local view of the tokens it holds, and the coverage check
//! that decides whether a request needs a round trip to the metadata
//! service.

use std::collections::HashMap;

use pfs_config::TokenKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientToken {
    pub start: u64,
    pub end: u64,
    pub kind: TokenKind,
}

#[derive(Default)]
pub struct TokenCache {
    files: HashMap<String, Vec<ClientToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort this file's tokens by start and greedily extend a cursor from
    /// `start`; READ requests accept any token, WRITE requests only WRITE
    /// tokens. Covered when the cursor passes `end`.
    pub fn covers(&self, filename: &str, start: u64, end: u64, kind: TokenKind) -> bool {
        let Some(tokens) = self.files.get(filename) else {
            return false;
        };
        let mut sorted: Vec<&ClientToken> = tokens.iter().collect();
        sorted.sort_by_key(|t| t.start);

        let mut cursor = start;
        for t in sorted {
            if t.start > cursor {
                break;
            }
            if t.end < cursor {
                continue;
            }
            let satisfies = match kind {
                TokenKind::Read => true,
                TokenKind::Write => matches!(t.kind, TokenKind::Write),
            };
            if !satisfies {
                continue;
            }
            cursor = t.end + 1;
            if cursor > end {
                return true;
            }
        }
        false
    }

    pub fn grant(&mut self, filename: &str, start: u64, end: u64, kind: TokenKind) {
        self.files
            .entry(filename.to_string())
            .or_default()
            .push(ClientToken { start, end, kind });
    }

    /// Apply a revocation: drop the revoked token, keep the remainders
    /// (same type, still held by this client) that are non-empty.
    pub fn revoke(&mut self, filename: &str, revoked: ClientToken, remainders: &[ClientToken]) {
        if let Some(tokens) = self.files.get_mut(filename) {
            tokens.retain(|t| *t != revoked);
        }
        for r in remainders.iter().filter(|r| r.start <= r.end) {
            self.files.entry(filename.to_string()).or_default().push(*r);
        }
    }

    pub fn release_all(&mut self, filename: &str) {
        self.files.remove(filename);
    }

    pub fn tokens_for(&self, filename: &str) -> Vec<ClientToken> {
        self.files.get(filename).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_covered_by_mixed_tokens() {
        let mut cache = TokenCache::new();
        cache.grant("f", 0, 99, TokenKind::Read);
        cache.grant("f", 100, 199, TokenKind::Write);
        assert!(cache.covers("f", 0, 199, TokenKind::Read));
    }

    #[test]
    fn write_not_covered_by_read_token() {
        let mut cache = TokenCache::new();
        cache.grant("f", 0, 99, TokenKind::Read);
        assert!(!cache.covers("f", 0, 99, TokenKind::Write));
    }

    #[test]
    fn gap_between_tokens_is_not_covered() {
        let mut cache = TokenCache::new();
        cache.grant("f", 0, 49, TokenKind::Read);
        cache.grant("f", 60, 99, TokenKind::Read);
        assert!(!cache.covers("f", 0, 99, TokenKind::Read));
        assert!(cache.covers("f", 0, 49, TokenKind::Read));
    }

    #[test]
    fn revoke_removes_token_and_keeps_remainders() {
        let mut cache = TokenCache::new();
        cache.grant("f", 0, 1023, TokenKind::Read);
        let revoked = ClientToken {
            start: 0,
            end: 1023,
            kind: TokenKind::Read,
        };
        let remainders = [
            ClientToken { start: 0, end: 255, kind: TokenKind::Read },
            ClientToken { start: 768, end: 1023, kind: TokenKind::Read },
        ];
        cache.revoke("f", revoked, &remainders);

        let tokens = cache.tokens_for("f");
        assert_eq!(tokens.len(), 2);
        assert!(!cache.covers("f", 0, 1023, TokenKind::Read));
        assert!(cache.covers("f", 0, 255, TokenKind::Read));
    }

    #[test]
    fn release_all_clears_file() {
        let mut cache = TokenCache::new();
        cache.grant("f", 0, 10, TokenKind::Write);
        cache.release_all("f");
        assert!(cache.tokens_for("f").is_empty());
    }
}
