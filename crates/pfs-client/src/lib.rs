//! Client runtime for the parallel file system: token cache, data cache,
//! execstat counters, the token-stream listener, and the [`PfsClient`] API.

pub mod client;
pub mod data_cache;
pub mod execstat;
pub mod stream_handler;
pub mod token_cache;

pub use client::{FileStat, PfsClient};
pub use execstat::ExecStatSnapshot;
