//! Superblock parse and `sys_chunk_array` bootstrap.
//!
//! Reads one fixed-size block at a known offset, verifies the magic, and
//! exposes the handful of fields later stages need as plain Rust types
//! instead of the raw zerocopy wrappers.

use zerocopy::FromBytes;

use super::chunk::ChunkMap;
use super::key::Key;
use super::structs::{
    BTRFS_SUPERBLOCK_MAGIC, BTRFS_SUPERBLOCK_OFFSET, BTRFS_SUPERBLOCK_SIZE, BtrfsChunkItem,
    BtrfsKeyRaw, BtrfsSuperblockRaw, CHUNK_ITEM_SIZE, KEY_SIZE, STRIPE_SIZE,
};
use crate::device::{BlockDevice, read_bytes};
use crate::error::{BlockFsError, Result};

/// The handful of superblock fields the read path actually needs.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub sector_size: u32,
    pub node_size: u32,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub root_tree_root: u64,
    pub chunk_tree_root: u64,
    pub chunk_root_level: u8,
    pub root_level: u8,
    pub fs_uuid: [u8; 16],
}

fn chunk_item_stride(chunk: &BtrfsChunkItem) -> usize {
    CHUNK_ITEM_SIZE + chunk.stripe_count.get() as usize * STRIPE_SIZE
}

/// Read and validate the primary superblock, then bootstrap a
/// [`ChunkMap`] from its embedded `sys_chunk_array`.
pub async fn read_superblock<D: BlockDevice>(device: &D) -> Result<(Superblock, ChunkMap)> {
    let raw = read_bytes(device, BTRFS_SUPERBLOCK_OFFSET, BTRFS_SUPERBLOCK_SIZE).await?;
    let sb = BtrfsSuperblockRaw::ref_from_bytes(&raw)
        .map_err(|_| BlockFsError::Malformed("superblock is the wrong size"))?;

    if sb.magic != BTRFS_SUPERBLOCK_MAGIC {
        return Err(BlockFsError::BadMagic("btrfs superblock"));
    }

    let mut chunk_map = ChunkMap::new();
    let array_len = sb.sys_chunk_array_size.get() as usize;
    let array = sb
        .sys_chunk_array
        .get(..array_len)
        .ok_or(BlockFsError::Malformed("sys_chunk_array_size out of range"))?;

    let mut pos = 0usize;
    while pos < array.len() {
        let key_bytes = array
            .get(pos..pos + KEY_SIZE)
            .ok_or(BlockFsError::Malformed("truncated sys_chunk_array key"))?;
        let key_raw = BtrfsKeyRaw::ref_from_bytes(key_bytes)
            .map_err(|_| BlockFsError::Malformed("truncated sys_chunk_array key"))?;
        let key: Key = (*key_raw).into();
        if key.ty != super::structs::item_type::CHUNK_ITEM {
            return Err(BlockFsError::Malformed(
                "sys_chunk_array entry is not a CHUNK_ITEM",
            ));
        }
        pos += KEY_SIZE;

        let item_bytes = array
            .get(pos..pos + CHUNK_ITEM_SIZE)
            .ok_or(BlockFsError::Malformed("truncated sys_chunk_array item"))?;
        let chunk = BtrfsChunkItem::ref_from_bytes(item_bytes)
            .map_err(|_| BlockFsError::Malformed("truncated sys_chunk_array item"))?;

        if chunk.stripe_count.get() == 0 {
            return Err(BlockFsError::Malformed("chunk item has zero stripes"));
        }
        // No multi-device/RAID striping support: use the first stripe's
        // physical offset as this chunk's sole mapping.
        let stripe_start = pos + CHUNK_ITEM_SIZE;
        let stripe_bytes = array
            .get(stripe_start..stripe_start + STRIPE_SIZE)
            .ok_or(BlockFsError::Malformed("truncated chunk stripe"))?;
        let stripe = super::structs::BtrfsStripe::ref_from_bytes(stripe_bytes)
            .map_err(|_| BlockFsError::Malformed("truncated chunk stripe"))?;
        if stripe.device_id.get() != 1 {
            return Err(BlockFsError::Unsupported(
                "chunk stripe targets a device other than the sole device",
            ));
        }

        chunk_map.insert(
            key.offset,
            chunk.chunk_size.get(),
            stripe.physical_offset.get(),
        )?;

        pos += chunk_item_stride(chunk);
    }

    let superblock = Superblock {
        sector_size: sb.sector_size.get(),
        node_size: sb.node_size.get(),
        total_bytes: sb.total_bytes.get(),
        bytes_used: sb.bytes_used.get(),
        root_dir_objectid: sb.root_dir_objectid.get(),
        root_tree_root: sb.root.get(),
        chunk_tree_root: sb.chunk_root.get(),
        chunk_root_level: sb.chunk_root_level,
        root_level: sb.root_level,
        fs_uuid: sb.fsid,
    };

    Ok((superblock, chunk_map))
}
