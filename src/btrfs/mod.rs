//! Btrfs backend: superblock, chunk map, generic B-tree engine, extent
//! and directory-entry decode, and the `Filesystem` implementation tying
//! them together.

pub mod btree;
pub mod chunk;
pub mod dirent;
pub mod extent;
pub mod fs;
pub mod key;
pub mod structs;
pub mod superblock;

pub use fs::BtrfsFilesystem;
