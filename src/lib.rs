pub mod btrfs;
pub mod cache;
pub mod device;
pub mod error;
pub mod ext2;
pub mod fs;
pub mod ops;

pub use device::{BlockDevice, MemBlockDevice};
pub use error::{BlockFsError, Result};
pub use fs::Filesystem;
pub use ops::{BackendFile, BackendNode, FileOps, GetLinkResult, NodeOps};
