//! On-disk Btrfs layout: superblock, B-tree node/item/key records, and
//! the item payload shapes the read path decodes. Parsed with zerocopy
//! `derive`s over `#[repr(C)]` structs using little-endian byte-order
//! wrappers, since Btrfs is little-endian on disk.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_LABEL_SIZE: usize = 256;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;

/// Byte offset of the primary superblock.
pub const BTRFS_SUPERBLOCK_OFFSET: u64 = 0x10_000;
pub const BTRFS_SUPERBLOCK_SIZE: usize = 4096;
pub const BTRFS_SUPERBLOCK_MAGIC: [u8; 8] = *b"_BHRfS_M";

/// Key.objectid of the tree-of-tree-roots' special "top level" directory.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

/// Item types that matter to a read-only Btrfs implementation.
/// Checksum verification, xattrs, and free-space trees are out of scope
/// and don't need their own constant even though the on-disk format
/// defines them.
pub mod item_type {
    pub const INODE_ITEM: u8 = 0x01;
    pub const INODE_REF: u8 = 0x0C;
    pub const DIR_ITEM: u8 = 0x54;
    pub const DIR_INDEX: u8 = 0x60;
    pub const EXTENT_DATA: u8 = 0x6C;
    pub const ROOT_ITEM: u8 = 0x84;
    pub const CHUNK_ITEM: u8 = 0xE4;
}

/// `ROOT_ITEM` keyed by `(objectid, ROOT_ITEM, -1)`; `-1` as unsigned.
pub const BTRFS_ROOT_ITEM_LATEST_OFFSET: u64 = u64::MAX;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsKeyRaw {
    pub objectid: U64,
    pub ty: u8,
    pub offset: U64,
}

pub const KEY_SIZE: usize = 17;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKeyRaw,
    pub block_ptr: U64,
    pub generation: U64,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsItem {
    pub key: BtrfsKeyRaw,
    pub data_offset: U32,
    pub data_size: U32,
}

pub const ITEM_SIZE: usize = 25;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsHeader {
    pub csum: [u8; BTRFS_CSUM_SIZE],
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub bytenr: U64,
    pub flags: U64,
    pub chunk_tree_uuid: [u8; BTRFS_UUID_SIZE],
    pub generation: U64,
    pub owner: U64,
    pub nritems: U32,
    pub level: u8,
}

pub const HEADER_SIZE: usize = 101;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsStripe {
    pub device_id: U64,
    pub physical_offset: U64,
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

pub const STRIPE_SIZE: usize = 32;

/// Fixed-size prefix of a `chunk_item`; stripes follow, `stripe_count` of
/// them.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsChunkItem {
    pub chunk_size: U64,
    pub owner: U64,
    pub stripe_len: U64,
    pub ty: U64,
    pub io_align: U32,
    pub io_width: U32,
    pub sector_size: U32,
    pub stripe_count: U16,
    pub sub_stripes: U16,
    // `stripe_count` `BtrfsStripe` records follow.
}

pub const CHUNK_ITEM_SIZE: usize = 48;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsTimespec {
    pub sec: U64,
    pub nsec: U32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsInodeItem {
    pub generation: U64,
    pub transid: U64,
    pub size: U64,
    pub nbytes: U64,
    pub block_group: U64,
    pub nlink: U32,
    pub uid: U32,
    pub gid: U32,
    pub mode: U32,
    pub rdev: U64,
    pub flags: U64,
    pub sequence: U64,
    pub reserved: [U64; 4],
    pub atime: BtrfsTimespec,
    pub ctime: BtrfsTimespec,
    pub mtime: BtrfsTimespec,
    pub otime: BtrfsTimespec,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsRootItemRaw {
    pub inode: BtrfsInodeItem,
    pub generation: U64,
    pub root_dirid: U64,
    pub bytenr: U64,
    pub byte_limit: U64,
    pub bytes_used: U64,
    pub last_snapshot: U64,
    pub flags: U64,
    pub refs: U32,
    pub drop_progress: BtrfsKeyRaw,
    pub drop_level: u8,
    pub level: u8,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsDirItemRaw {
    pub location: BtrfsKeyRaw,
    pub transid: U64,
    pub data_len: U16,
    pub name_len: U16,
    pub ty: u8,
}

pub const DIR_ITEM_HEADER_SIZE: usize = 30;

/// Common header shared by inline and regular `EXTENT_DATA` item
/// payloads.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsExtentDataHeader {
    pub generation: U64,
    pub decoded_size: U64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: U16,
    pub ty: u8,
}

pub const EXTENT_DATA_HEADER_SIZE: usize = 21;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct BtrfsExtentDataRegular {
    pub extent_addr: U64,
    pub extent_size: U64,
    pub extent_offset: U64,
    pub num_bytes: U64,
}

pub const EXTENT_DATA_REGULAR_SIZE: usize = 32;

/// The Btrfs on-disk superblock. Only the fields the read path needs are
/// given exact types; trailing padding between fields matches the real
/// 4096-byte on-disk layout via explicit reserved arrays.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BtrfsSuperblockRaw {
    pub csum: [u8; BTRFS_CSUM_SIZE],
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub bytenr: U64,
    pub flags: U64,
    pub magic: [u8; 8],
    pub generation: U64,
    pub root: U64,
    pub chunk_root: U64,
    pub log_root: U64,
    pub log_root_transid: U64,
    pub total_bytes: U64,
    pub bytes_used: U64,
    pub root_dir_objectid: U64,
    pub num_devices: U64,
    pub sector_size: U32,
    pub node_size: U32,
    pub leafsize: U32,
    pub stripesize: U32,
    pub sys_chunk_array_size: U32,
    pub chunk_root_generation: U64,
    pub compat_flags: U64,
    pub compat_ro_flags: U64,
    pub incompat_flags: U64,
    pub csum_type: U16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item_bytes: [u8; 98],
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: U64,
    pub uuid_tree_generation: U64,
    pub metadata_uuid: [u8; BTRFS_FSID_SIZE],
    pub _reserved: [u8; 224],
    pub sys_chunk_array: [u8; BTRFS_SYSTEM_CHUNK_ARRAY_SIZE],
    pub _root_backups: [u8; 672],
    pub _padding: [u8; 565],
}
