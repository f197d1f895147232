//! The metadata service: file registry, descriptor table, and the
//! byte-range token directory with its revocation protocol.

pub mod registry;
pub mod service;
pub mod tokens;

pub use registry::{FileRegistry, FileStat};
pub use service::MetaService;
pub use tokens::{Notification, TokenDirectory};
