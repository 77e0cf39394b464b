//! ext2 backend: the second, simpler `Filesystem` implementation.
//! Classic block-group layout, fixed-size inodes, and direct/indirect
//! block pointers in place of Btrfs's copy-on-write B-trees.

pub mod dir;
pub mod fs;
pub mod inode;
pub mod structs;
pub mod superblock;

#[cfg(feature = "ext2-write")]
pub mod write;

pub use fs::Ext2Filesystem;
