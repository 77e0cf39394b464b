//! Mount bootstrap and the `Filesystem`/`InodeSource` implementations for
//! ext2.
//!
//! Simpler than Btrfs by construction: no copy-on-write B-tree, just a
//! fixed block-group table, a flat inode table per group, and classic
//! direct/indirect/double-indirect block pointers. Directories are a
//! linked chain of variable-length records inside otherwise ordinary
//! file data blocks.

use std::sync::{Arc, Weak};

use super::dir;
use super::inode;
use super::structs::EXT2_ROOT_INO;
use super::superblock::{self, Superblock};
use crate::cache::{Inode as CacheInode, InodeRecord, InodeSource, InodeTable};
use crate::device::{BlockDevice, read_bytes};
use crate::error::{BlockFsError, Result};
use crate::fs::{DirEntryOut, Filesystem, FsStats, InodeAttr, InodeStats, LookupResult, NodeType};

pub struct Ext2Filesystem<D: BlockDevice> {
    device: Arc<D>,
    superblock: Superblock,
    inodes: Arc<InodeTable<D>>,
    self_ref: Weak<Ext2Filesystem<D>>,
}

impl<D: BlockDevice + 'static> Ext2Filesystem<D> {
    pub async fn mount(device: Arc<D>) -> Result<Arc<Self>> {
        let superblock = superblock::read_superblock(device.as_ref()).await?;
        Ok(Arc::new_cyclic(|weak| Self {
            device,
            superblock,
            inodes: Arc::new(InodeTable::new()),
            self_ref: weak.clone(),
        }))
    }

    fn self_arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or(BlockFsError::Malformed("filesystem handle already dropped"))
    }

    fn is_fast_symlink(data: &inode::InodeData) -> bool {
        data.blocks == 0
    }

    #[cfg_attr(not(feature = "ext2-write"), allow(dead_code))]
    pub(crate) fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[cfg_attr(not(feature = "ext2-write"), allow(dead_code))]
    pub(crate) fn device_ref(&self) -> &D {
        self.device.as_ref()
    }
}

impl<D: BlockDevice + 'static> InodeSource for Ext2Filesystem<D> {
    async fn load_record(&self, number: u32) -> Result<InodeRecord> {
        let data = inode::read_inode(self.device.as_ref(), &self.superblock, number).await?;
        Ok(InodeRecord {
            size: data.size,
            uid: data.uid as u32,
            gid: data.gid as u32,
            mode: data.mode as u32,
            nlink: data.links_count as u32,
            atime: (data.atime as u64, 0),
            mtime: (data.mtime as u64, 0),
            ctime: (data.ctime as u64, 0),
        })
    }

    async fn read_range(&self, number: u32, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let block_size = self.superblock.block_size as u64;
        let data = inode::read_inode(self.device.as_ref(), &self.superblock, number).await?;

        let mut written = 0u64;
        while written < out.len() as u64 {
            let pos = offset + written;
            let block_index = pos / block_size;
            let in_block_offset = pos % block_size;
            let chunk_len = (block_size - in_block_offset).min(out.len() as u64 - written);

            let phys =
                inode::resolve_block(self.device.as_ref(), &self.superblock, &data, block_index)
                    .await?;
            let dst = &mut out[written as usize..(written + chunk_len) as usize];
            match phys {
                Some(b) => {
                    let bytes = read_bytes(
                        self.device.as_ref(),
                        b as u64 * block_size + in_block_offset,
                        chunk_len as usize,
                    )
                    .await?;
                    dst.copy_from_slice(&bytes);
                }
                None => dst.fill(0),
            }
            written += chunk_len;
        }
        Ok(())
    }
}

impl<D: BlockDevice + 'static> Filesystem for Ext2Filesystem<D> {
    type Inode = CacheInode<D>;

    fn root_inode_number(&self) -> u32 {
        EXT2_ROOT_INO
    }

    async fn access_inode(&self, number: u32) -> Result<Arc<Self::Inode>> {
        let source = self.self_arc()?;
        let inode = self.inodes.access_inode(number, source);
        inode.wait_ready().await;
        Ok(inode)
    }

    fn node_type(&self, inode: &Self::Inode) -> NodeType {
        inode
            .record()
            .map(|r| r.node_type())
            .unwrap_or(NodeType::None)
    }

    fn attr(&self, inode: &Self::Inode) -> InodeAttr {
        let record = inode.record();
        let (size, uid, gid, mode, nlink, atime, mtime, ctime, node_type) = match record {
            Some(r) => (
                r.size,
                r.uid,
                r.gid,
                r.mode,
                r.nlink,
                r.atime,
                r.mtime,
                r.ctime,
                r.node_type(),
            ),
            None => (0, 0, 0, 0, 0, (0, 0), (0, 0), (0, 0), NodeType::None),
        };
        InodeAttr {
            inode: inode.number,
            node_type,
            size,
            uid,
            gid,
            mode,
            nlink,
            atime,
            mtime,
            ctime,
        }
    }

    async fn find_entry(&self, dir: &Self::Inode, name: &[u8]) -> Result<LookupResult> {
        let mut cookie = 0u64;
        loop {
            let Some(entry) = self.read_entries(dir, cookie).await? else {
                return Err(BlockFsError::NotFound);
            };
            if entry.name == name {
                return Ok(LookupResult {
                    inode: entry.inode,
                    node_type: entry.node_type,
                });
            }
            cookie = entry.cookie;
        }
    }

    async fn read_entries(&self, dir_inode: &Self::Inode, cookie: u64) -> Result<Option<DirEntryOut>> {
        let block_size = self.superblock.block_size as u64;
        let record = dir_inode
            .record()
            .ok_or(BlockFsError::Malformed("directory inode not ready"))?;
        let data = inode::read_inode(self.device.as_ref(), &self.superblock, dir_inode.number).await?;

        let mut pos = cookie;
        while pos < record.size {
            let block_index = pos / block_size;
            let offset_in_block = (pos % block_size) as usize;

            let phys =
                inode::resolve_block(self.device.as_ref(), &self.superblock, &data, block_index)
                    .await?;
            let Some(phys) = phys else {
                pos = (block_index + 1) * block_size;
                continue;
            };

            let block_data = read_bytes(
                self.device.as_ref(),
                phys as u64 * block_size,
                self.superblock.block_size as usize,
            )
            .await?;
            let (entry, rec_len) = dir::decode_one(&block_data[offset_in_block..])?;
            let next_pos = pos + rec_len as u64;

            if let Some(entry) = entry {
                let child_number = entry.inode;
                let child = self.access_inode(child_number).await?;
                return Ok(Some(DirEntryOut {
                    name: entry.name,
                    inode: child_number,
                    node_type: self.node_type(&child),
                    cookie: next_pos,
                }));
            }
            pos = next_pos;
        }
        Ok(None)
    }

    async fn read_symlink(&self, inode_handle: &Self::Inode) -> Result<Vec<u8>> {
        let record = inode_handle
            .record()
            .ok_or(BlockFsError::Malformed("symlink inode not ready"))?;
        if record.node_type() != NodeType::Symlink {
            return Err(BlockFsError::IllegalOperationTarget);
        }

        let data = inode::read_inode(self.device.as_ref(), &self.superblock, inode_handle.number)
            .await?;
        if Self::is_fast_symlink(&data) {
            let mut bytes = Vec::with_capacity(60);
            for word in data.block.iter() {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            bytes.truncate(record.size as usize);
            return Ok(bytes);
        }

        let mut buf = vec![0u8; record.size as usize];
        InodeSource::read_range(self, inode_handle.number, 0, &mut buf).await?;
        Ok(buf)
    }

    fn is_obstructed(&self, dir: &Self::Inode, name: &[u8]) -> bool {
        dir.is_obstructed(name)
    }

    fn fs_stats(&self) -> FsStats {
        FsStats {
            block_size: self.superblock.block_size as u64,
            num_blocks: self.superblock.blocks_count as u64,
            free_blocks: self.superblock.free_blocks_count as u64,
            max_name_length: 255,
            inode_stats: Some(InodeStats {
                total_inodes: self.superblock.inodes_count as u64,
                free_inodes: self.superblock.free_inodes_count as u64,
            }),
            fsid: crate::fs::derive_fsid(self.superblock.uuid, EXT2_ROOT_INO),
        }
    }
}
