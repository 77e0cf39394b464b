//! On-disk ext2 layout: superblock, block-group descriptor, inode, and
//! directory-entry records. Parsed with zerocopy `derive`s the same way
//! the Btrfs structs are, since ext2 is little-endian on disk too.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const EXT2_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_MAGIC: u16 = 0xEF53;

pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT2_GOOD_OLD_REV: u32 = 0;

pub const EXT2_ROOT_INO: u32 = 2;

pub const EXT2_N_BLOCKS: usize = 15;
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = 12;
pub const EXT2_DIND_BLOCK: usize = 13;
pub const EXT2_TIND_BLOCK: usize = 14;

pub mod file_type {
    pub const UNKNOWN: u8 = 0;
    pub const REGULAR: u8 = 1;
    pub const DIRECTORY: u8 = 2;
    pub const CHARDEV: u8 = 3;
    pub const BLOCKDEV: u8 = 4;
    pub const FIFO: u8 = 5;
    pub const SOCKET: u8 = 6;
    pub const SYMLINK: u8 = 7;
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct Ext2SuperblockRaw {
    pub inodes_count: U32,
    pub blocks_count: U32,
    pub r_blocks_count: U32,
    pub free_blocks_count: U32,
    pub free_inodes_count: U32,
    pub first_data_block: U32,
    pub log_block_size: U32,
    pub log_frag_size: U32,
    pub blocks_per_group: U32,
    pub frags_per_group: U32,
    pub inodes_per_group: U32,
    pub mtime: U32,
    pub wtime: U32,
    pub mnt_count: U16,
    pub max_mnt_count: U16,
    pub magic: U16,
    pub state: U16,
    pub errors: U16,
    pub minor_rev_level: U16,
    pub lastcheck: U32,
    pub checkinterval: U32,
    pub creator_os: U32,
    pub rev_level: U32,
    pub def_resuid: U16,
    pub def_resgid: U16,
    // Rev1 fields; all zero/ignored on a rev0 (good old) filesystem.
    pub first_ino: U32,
    pub inode_size: U16,
    pub block_group_nr: U16,
    pub feature_compat: U32,
    pub feature_incompat: U32,
    pub feature_ro_compat: U32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
}

pub const EXT2_SUPERBLOCK_RAW_SIZE: usize = 136;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct Ext2GroupDescRaw {
    pub block_bitmap: U32,
    pub inode_bitmap: U32,
    pub inode_table: U32,
    pub free_blocks_count: U16,
    pub free_inodes_count: U16,
    pub used_dirs_count: U16,
    pub pad: U16,
    pub reserved: [u8; 12],
}

pub const EXT2_GROUP_DESC_SIZE: usize = 32;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct Ext2InodeRaw {
    pub mode: U16,
    pub uid: U16,
    pub size_lo: U32,
    pub atime: U32,
    pub ctime: U32,
    pub mtime: U32,
    pub dtime: U32,
    pub gid: U16,
    pub links_count: U16,
    pub blocks: U32,
    pub flags: U32,
    pub osd1: U32,
    pub block: [U32; EXT2_N_BLOCKS],
    pub generation: U32,
    pub file_acl: U32,
    pub size_high_or_dir_acl: U32,
    pub faddr: U32,
    pub osd2: [u8; 12],
}

pub const EXT2_GOOD_OLD_INODE_RAW_SIZE: usize = 128;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct Ext2DirEntryHeaderRaw {
    pub inode: U32,
    pub rec_len: U16,
    pub name_len: u8,
    pub file_type: u8,
}

pub const EXT2_DIR_ENTRY_HEADER_SIZE: usize = 8;
