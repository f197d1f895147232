//! The file service: durable storage for striped chunks, addressed by the
//! filenames the metadata service hands out in striping plans.

pub mod service;
pub mod storage;

pub use service::FileServerService;
pub use storage::{chunk_filename, ChunkStore};
