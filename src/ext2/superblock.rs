//! Superblock and block-group descriptor table parse.

use zerocopy::FromBytes;

use super::structs::{
    EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_REV, EXT2_GROUP_DESC_SIZE, EXT2_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_RAW_SIZE, Ext2GroupDescRaw, Ext2SuperblockRaw,
};
use crate::device::{BlockDevice, read_bytes};
use crate::error::{BlockFsError, Result};

/// The handful of superblock fields the read path needs, plus the
/// block-group descriptor table (small enough to keep resident for the
/// life of the mount).
#[derive(Debug, Clone)]
pub struct Superblock {
    pub block_size: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub groups: Vec<GroupDesc>,
    pub uuid: [u8; 16],
}

#[derive(Debug, Clone, Copy)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table_block: u32,
}

impl GroupDesc {
    pub fn block_bitmap_block(&self) -> u64 {
        self.block_bitmap as u64
    }

    pub fn inode_bitmap_block(&self) -> u64 {
        self.inode_bitmap as u64
    }
}

impl Superblock {
    pub fn group_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    /// Absolute block number of the first block belonging to `group`.
    pub fn first_data_block_of(&self, group: usize) -> u32 {
        self.first_data_block + group as u32 * self.blocks_per_group
    }
}

pub async fn read_superblock<D: BlockDevice>(device: &D) -> Result<Superblock> {
    let raw_bytes = read_bytes(device, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_RAW_SIZE).await?;
    let sb = Ext2SuperblockRaw::ref_from_bytes(&raw_bytes)
        .map_err(|_| BlockFsError::Malformed("ext2 superblock is the wrong size"))?;

    if sb.magic.get() != EXT2_MAGIC {
        return Err(BlockFsError::BadMagic("ext2 superblock"));
    }

    let block_size = 1024u32 << sb.log_block_size.get();
    let inode_size = if sb.rev_level.get() == EXT2_GOOD_OLD_REV {
        EXT2_GOOD_OLD_INODE_SIZE
    } else {
        sb.inode_size.get()
    };

    let blocks_count = sb.blocks_count.get();
    let blocks_per_group = sb.blocks_per_group.get();
    let group_count = blocks_count.div_ceil(blocks_per_group);

    // The group descriptor table starts in the block right after the
    // superblock's own block (block 1 for a 1KiB filesystem, block 0
    // otherwise, since a 1KiB superblock shares no block with anything
    // when block_size > 1024).
    let gdt_block = if block_size == 1024 { 2 } else { 1 };
    let gdt_bytes_needed = group_count as usize * EXT2_GROUP_DESC_SIZE;
    let gdt_raw = read_bytes(
        device,
        gdt_block as u64 * block_size as u64,
        gdt_bytes_needed,
    )
    .await?;

    let mut groups = Vec::with_capacity(group_count as usize);
    for i in 0..group_count as usize {
        let start = i * EXT2_GROUP_DESC_SIZE;
        let desc = Ext2GroupDescRaw::ref_from_prefix(&gdt_raw[start..])
            .map(|(d, _)| *d)
            .map_err(|_| BlockFsError::Malformed("truncated block group descriptor"))?;
        groups.push(GroupDesc {
            block_bitmap: desc.block_bitmap.get(),
            inode_bitmap: desc.inode_bitmap.get(),
            inode_table_block: desc.inode_table.get(),
        });
    }

    Ok(Superblock {
        block_size,
        blocks_count,
        free_blocks_count: sb.free_blocks_count.get(),
        inodes_count: sb.inodes_count.get(),
        free_inodes_count: sb.free_inodes_count.get(),
        first_data_block: sb.first_data_block.get(),
        blocks_per_group,
        inodes_per_group: sb.inodes_per_group.get(),
        inode_size,
        groups,
        uuid: sb.uuid,
    })
}
