//! Constants, address-list configuration, and the shared error type for the
//! parallel file system.

mod error;
mod servers;

pub use error::PfsError;
pub use servers::{bind_addr, ServerList};

/// Bytes per block. Combined with [`STRIPE_BLOCKS`] this gives the chunk
/// size `S` that chunk boundaries and the striping plan are defined over.
pub const BLOCK_SIZE: u64 = 4096;

/// Blocks per chunk.
pub const STRIPE_BLOCKS: u64 = 1;

/// Default cap on the number of blocks held in a client's data cache.
pub const CLIENT_CACHE_BLOCKS: usize = 64;

/// Runtime-overridable knobs, mostly useful for tests that need a small
/// cache cap or an unusual chunk size.
#[derive(Debug, Clone, Copy)]
pub struct PfsConfig {
    pub block_size: u64,
    pub stripe_blocks: u64,
    pub client_cache_blocks: usize,
}

impl PfsConfig {
    /// The chunk size `S = BLOCK_SIZE * STRIPE_BLOCKS`.
    pub fn chunk_size(&self) -> u64 {
        self.block_size * self.stripe_blocks
    }
}

impl Default for PfsConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            stripe_blocks: STRIPE_BLOCKS,
            client_cache_blocks: CLIENT_CACHE_BLOCKS,
        }
    }
}

/// File open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
}

/// Token kind, READ or WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Read,
    Write,
}
