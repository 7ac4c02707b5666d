//! Address management shared by the CNI plugin and the node daemon.

mod allocator;
mod error;
mod storage;

pub use allocator::Allocator;
pub use error::{IpamError, StorageError};
pub use storage::{FamilyState, PlugState, Storage, StoragePaths, DEFAULT_DATA_DIR};
