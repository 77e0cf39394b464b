//! Minimal ext2 write surface: bitmap-backed block/inode allocation and
//! `mkdir`. Btrfs has no equivalent of this module; it stays strictly
//! read-only. Existing but unsupported by default, this lives behind the
//! `ext2-write` feature rather than being omitted outright.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use super::dir::FileType;
use super::fs::Ext2Filesystem;
use super::inode;
use super::structs::{EXT2_DIR_ENTRY_HEADER_SIZE, Ext2DirEntryHeaderRaw, file_type};
use crate::device::BlockDevice;
use crate::error::{BlockFsError, Result};

/// Scan one bitmap block for a clear bit, set it, and write the block
/// back. Returns the bit index (0-based within this group) that was
/// allocated.
async fn allocate_from_bitmap<D: BlockDevice>(
    device: &D,
    bitmap_block: u64,
    block_size: u32,
    limit: u32,
) -> Result<u32> {
    let offset = bitmap_block * block_size as u64;
    let mut bitmap = crate::device::read_bytes(device, offset, block_size as usize).await?;

    for bit in 0..limit {
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        if bitmap[byte] & mask == 0 {
            bitmap[byte] |= mask;
            device
                .write_sectors(
                    offset / device.sector_size() as u64,
                    block_size as usize / device.sector_size(),
                    &bitmap,
                )
                .await?;
            return Ok(bit);
        }
    }
    Err(BlockFsError::Unsupported("block group exhausted"))
}

impl<D: BlockDevice + 'static> Ext2Filesystem<D> {
    /// Allocate one free block from `group`'s bitmap, returning its
    /// absolute block number.
    pub async fn allocate_block(&self, group: usize) -> Result<u32> {
        let sb = self.superblock();
        let desc = sb
            .groups
            .get(group)
            .ok_or(BlockFsError::Malformed("block group index out of range"))?;
        let bit = allocate_from_bitmap(
            self.device_ref(),
            desc.block_bitmap_block(),
            sb.block_size,
            sb.blocks_per_group,
        )
        .await?;
        Ok(sb.first_data_block_of(group) + bit)
    }

    /// Allocate one free inode from `group`'s bitmap, returning its
    /// 1-based inode number.
    pub async fn allocate_inode(&self, group: usize) -> Result<u32> {
        let sb = self.superblock();
        let desc = sb
            .groups
            .get(group)
            .ok_or(BlockFsError::Malformed("block group index out of range"))?;
        let bit = allocate_from_bitmap(
            self.device_ref(),
            desc.inode_bitmap_block(),
            sb.block_size,
            sb.inodes_per_group,
        )
        .await?;
        Ok(group as u32 * sb.inodes_per_group + bit + 1)
    }

    /// Write a fixed directory block containing `.` and `..` only.
    async fn write_fresh_directory_block(&self, block: u32, self_ino: u32, parent_ino: u32) -> Result<()> {
        let block_size = self.superblock().block_size;
        let mut data = vec![0u8; block_size as usize];

        let dot = Ext2DirEntryHeaderRaw {
            inode: U32::new(self_ino),
            rec_len: U16::new(12),
            name_len: 1,
            file_type: file_type::DIRECTORY,
        };
        data[0..EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(dot.as_bytes());
        data[EXT2_DIR_ENTRY_HEADER_SIZE] = b'.';

        let dotdot_rec_len = block_size as u16 - 12;
        let dotdot = Ext2DirEntryHeaderRaw {
            inode: U32::new(parent_ino),
            rec_len: U16::new(dotdot_rec_len),
            name_len: 2,
            file_type: file_type::DIRECTORY,
        };
        data[12..12 + EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(dotdot.as_bytes());
        data[12 + EXT2_DIR_ENTRY_HEADER_SIZE] = b'.';
        data[13 + EXT2_DIR_ENTRY_HEADER_SIZE] = b'.';

        let offset = block as u64 * block_size as u64;
        self.device_ref()
            .write_sectors(
                offset / self.device_ref().sector_size() as u64,
                block_size as usize / self.device_ref().sector_size(),
                &data,
            )
            .await
    }

    /// Create a directory named `name` under `parent_ino`. Only succeeds
    /// if an existing directory block of the parent has room for one
    /// more record; this surface never grows a directory's block count.
    pub async fn mkdir(&self, parent_ino: u32, name: &[u8]) -> Result<u32> {
        let sb = self.superblock();
        let new_inode = self.allocate_inode(0).await?;
        let new_block = self.allocate_block(0).await?;
        self.write_fresh_directory_block(new_block, new_inode, parent_ino)
            .await?;

        let parent_data = inode::read_inode(self.device_ref(), sb, parent_ino).await?;
        let block_size = sb.block_size as u64;
        let mut block_index = 0u64;
        loop {
            let phys = inode::resolve_block(self.device_ref(), sb, &parent_data, block_index)
                .await?
                .ok_or(BlockFsError::Unsupported(
                    "sparse directory block in parent; cannot append entry",
                ))?;
            let offset = phys as u64 * block_size;
            let mut block_data =
                crate::device::read_bytes(self.device_ref(), offset, sb.block_size as usize).await?;

            if let Some(pos) = find_room_for_entry(&block_data, name.len())? {
                write_entry_in_place(&mut block_data, pos, new_inode, name, FileType::Directory);
                self.device_ref()
                    .write_sectors(
                        offset / self.device_ref().sector_size() as u64,
                        sb.block_size as usize / self.device_ref().sector_size(),
                        &block_data,
                    )
                    .await?;
                return Ok(new_inode);
            }

            block_index += 1;
            if block_index * block_size >= parent_data.size {
                return Err(BlockFsError::Unsupported(
                    "parent directory has no room in any existing block",
                ));
            }
        }
    }
}

/// Find a byte position within `block_data` where a new record of
/// `name_len` bytes fits, either in an unused (`inode == 0`) slot or by
/// splitting the trailing slack off the last live entry's `rec_len`.
fn find_room_for_entry(block_data: &[u8], name_len: usize) -> Result<Option<usize>> {
    let needed = round_up_4(EXT2_DIR_ENTRY_HEADER_SIZE + name_len);
    let mut pos = 0usize;
    while pos < block_data.len() {
        let header = Ext2DirEntryHeaderRaw::ref_from_prefix(&block_data[pos..])
            .map(|(h, _)| *h)
            .map_err(|_| BlockFsError::Malformed("truncated ext2 dir entry header"))?;
        let rec_len = header.rec_len.get() as usize;

        if header.inode.get() == 0 && rec_len >= needed {
            return Ok(Some(pos));
        }
        if header.inode.get() != 0 {
            let used = round_up_4(EXT2_DIR_ENTRY_HEADER_SIZE + header.name_len as usize);
            if rec_len - used >= needed {
                return Ok(Some(pos));
            }
        }
        pos += rec_len;
    }
    Ok(None)
}

fn write_entry_in_place(
    block_data: &mut [u8],
    pos: usize,
    child_inode: u32,
    name: &[u8],
    file_type: FileType,
) {
    let header = Ext2DirEntryHeaderRaw::ref_from_prefix(&block_data[pos..])
        .map(|(h, _)| *h)
        .unwrap();
    let existing_rec_len = header.rec_len.get() as usize;

    if header.inode.get() == 0 {
        let new_header = Ext2DirEntryHeaderRaw {
            inode: U32::new(child_inode),
            rec_len: U16::new(existing_rec_len as u16),
            name_len: name.len() as u8,
            file_type: file_type_tag(file_type),
        };
        block_data[pos..pos + EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(new_header.as_bytes());
        block_data[pos + EXT2_DIR_ENTRY_HEADER_SIZE..pos + EXT2_DIR_ENTRY_HEADER_SIZE + name.len()]
            .copy_from_slice(name);
        return;
    }

    let used = round_up_4(EXT2_DIR_ENTRY_HEADER_SIZE + header.name_len as usize);
    let shrunk = Ext2DirEntryHeaderRaw {
        inode: header.inode,
        rec_len: U16::new(used as u16),
        name_len: header.name_len,
        file_type: header.file_type,
    };
    block_data[pos..pos + EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(shrunk.as_bytes());

    let new_pos = pos + used;
    let new_rec_len = existing_rec_len - used;
    let new_header = Ext2DirEntryHeaderRaw {
        inode: U32::new(child_inode),
        rec_len: U16::new(new_rec_len as u16),
        name_len: name.len() as u8,
        file_type: file_type_tag(file_type),
    };
    block_data[new_pos..new_pos + EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(new_header.as_bytes());
    block_data[new_pos + EXT2_DIR_ENTRY_HEADER_SIZE..new_pos + EXT2_DIR_ENTRY_HEADER_SIZE + name.len()]
        .copy_from_slice(name);
}

fn file_type_tag(ft: FileType) -> u8 {
    match ft {
        FileType::Directory => file_type::DIRECTORY,
        FileType::RegularFile => file_type::REGULAR,
        FileType::Symlink => file_type::SYMLINK,
        _ => file_type::UNKNOWN,
    }
}

fn round_up_4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_room_in_unused_slot() {
        let mut block = vec![0u8; 64];
        let header = Ext2DirEntryHeaderRaw {
            inode: U32::new(0),
            rec_len: U16::new(64),
            name_len: 0,
            file_type: file_type::UNKNOWN,
        };
        block[..EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
        let pos = find_room_for_entry(&block, 4).unwrap();
        assert_eq!(pos, Some(0));
    }

    #[test]
    fn finds_room_by_splitting_trailing_slack() {
        let mut block = vec![0u8; 64];
        let header = Ext2DirEntryHeaderRaw {
            inode: U32::new(5),
            rec_len: U16::new(64),
            name_len: 1,
            file_type: file_type::REGULAR,
        };
        block[..EXT2_DIR_ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
        block[EXT2_DIR_ENTRY_HEADER_SIZE] = b'a';
        let pos = find_room_for_entry(&block, 4).unwrap().unwrap();
        assert!(pos > 0);
    }
}
