//! Local storage backend
//!
//! The authoritative store the proxy caches into: a [`StorageDriver`] for raw
//! bytes, a [`LocalRegistry`] implementing the distribution traits on top of
//! it, and the [`Vacuum`] for removing blob data outright.

pub mod driver;
pub mod paths;
pub mod registry;
pub mod vacuum;

pub use driver::{FileInfo, FileWriter, FilesystemDriver, InMemoryDriver, READ_CHUNK_SIZE, StorageDriver};
pub use registry::LocalRegistry;
pub use vacuum::Vacuum;
