//! Mount bootstrap and the `Filesystem`/`InodeSource` implementations for
//! Btrfs.
//!
//! Mounting proceeds in three stages once the superblock and its
//! bootstrap chunk map are in hand: walk the whole chunk tree to fill in
//! any chunks the bootstrap array didn't cover, locate the subvolume
//! ("FS") tree root by looking up the root directory's `DIR_ITEM` in the
//! root tree, then resolve that item's target `ROOT_ITEM` to get the FS
//! tree's own root address and root inode number.

use std::sync::{Arc, Weak};

use zerocopy::FromBytes;

use super::btree::{self, BtreeCursor};
use super::chunk::ChunkMap;
use super::dirent;
use super::extent;
use super::key::Key;
use super::structs::{
    BTRFS_ROOT_ITEM_LATEST_OFFSET, BtrfsChunkItem, BtrfsInodeItem, BtrfsRootItemRaw, BtrfsStripe,
    CHUNK_ITEM_SIZE, item_type,
};
use super::superblock::{self, Superblock};
use crate::cache::{Inode as CacheInode, InodeRecord, InodeSource, InodeTable};
use crate::device::BlockDevice;
use crate::error::{BlockFsError, Result};
use crate::fs::{DirEntryOut, Filesystem, FsStats, InodeAttr, LookupResult, NodeType};

/// First `DIR_INDEX` offset a subvolume's children occupy; `0` and `1`
/// are reserved for the synthesized `.`/`..` entries, never stored here.
const DIR_START_INDEX: u64 = 2;

/// A mounted Btrfs filesystem: superblock, chunk map, and the address of
/// the one subvolume's FS tree this crate reads from.
pub struct BtrfsFilesystem<D: BlockDevice> {
    device: Arc<D>,
    superblock: Superblock,
    chunk_map: ChunkMap,
    fs_tree_root: u64,
    root_inode: u32,
    inodes: Arc<InodeTable<D>>,
    self_ref: Weak<BtrfsFilesystem<D>>,
}

/// Walk the chunk tree leaf by leaf, inserting every `CHUNK_ITEM` found.
/// The bootstrap array from the superblock only covers enough chunks to
/// reach this tree's own root; this fills in the rest.
async fn walk_chunk_tree<D: BlockDevice>(
    device: &D,
    chunk_map: &mut ChunkMap,
    node_size: usize,
    chunk_tree_root: u64,
) -> Result<()> {
    let mut cursor = btree::first_key(device, chunk_map, node_size, chunk_tree_root).await?;
    loop {
        let Some(key) = cursor.current_key() else {
            break;
        };
        if key.ty == item_type::CHUNK_ITEM {
            let data = cursor
                .current_data()
                .ok_or(BlockFsError::Malformed("chunk tree cursor has no data"))?;
            let chunk = BtrfsChunkItem::ref_from_prefix(data)
                .map(|(c, _)| *c)
                .map_err(|_| BlockFsError::Malformed("truncated chunk item in chunk tree"))?;
            let stripe_bytes = data
                .get(CHUNK_ITEM_SIZE..)
                .ok_or(BlockFsError::Malformed("chunk item missing stripe"))?;
            let stripe = BtrfsStripe::ref_from_prefix(stripe_bytes)
                .map(|(s, _)| *s)
                .map_err(|_| BlockFsError::Malformed("truncated stripe in chunk tree"))?;
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
        }
        if !btree::next_key(device, chunk_map, node_size, &mut cursor).await? {
            break;
        }
    }
    Ok(())
}

/// Locate the FS tree root: look up the root directory's `DIR_ITEM` in
/// the root tree to find the target `ROOT_ITEM` key, then resolve that
/// key to the subvolume's root address and root inode number.
async fn locate_fs_tree<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    root_tree_root: u64,
    root_dir_objectid: u64,
) -> Result<(u64, u32)> {
    let search_key = Key::new(root_dir_objectid, item_type::DIR_ITEM, 0);
    let cursor: BtreeCursor =
        btree::lower_bound(device, chunk_map, node_size, root_tree_root, search_key).await?;

    cursor
        .current_key()
        .filter(|k| k.same_prefix(&search_key))
        .ok_or(BlockFsError::Malformed(
            "root tree has no DIR_ITEM for the root directory objectid",
        ))?;
    let dir_item_data = cursor
        .current_data()
        .ok_or(BlockFsError::Malformed("root tree cursor has no data"))?;
    let entry = dirent::decode_one(dir_item_data)?.0;

    let root_item_key = Key::new(
        entry.location.objectid,
        item_type::ROOT_ITEM,
        BTRFS_ROOT_ITEM_LATEST_OFFSET,
    );
    let root_item_data = btree::find(device, chunk_map, node_size, root_tree_root, root_item_key)
        .await?
        .ok_or(BlockFsError::Malformed("missing ROOT_ITEM for FS tree"))?;
    let root_item = BtrfsRootItemRaw::ref_from_prefix(&root_item_data)
        .map(|(r, _)| *r)
        .map_err(|_| BlockFsError::Malformed("truncated ROOT_ITEM"))?;

    Ok((root_item.bytenr.get(), root_item.root_dirid.get() as u32))
}

impl<D: BlockDevice + 'static> BtrfsFilesystem<D> {
    pub async fn mount(device: Arc<D>) -> Result<Arc<Self>> {
        let (superblock, mut chunk_map) = superblock::read_superblock(device.as_ref()).await?;
        let node_size = superblock.node_size as usize;

        walk_chunk_tree(
            device.as_ref(),
            &mut chunk_map,
            node_size,
            superblock.chunk_tree_root,
        )
        .await?;

        let (fs_tree_root, root_inode) = locate_fs_tree(
            device.as_ref(),
            &chunk_map,
            node_size,
            superblock.root_tree_root,
            superblock.root_dir_objectid,
        )
        .await?;

        Ok(Arc::new_cyclic(|weak| Self {
            device,
            superblock,
            chunk_map,
            fs_tree_root,
            root_inode,
            inodes: Arc::new(InodeTable::new()),
            self_ref: weak.clone(),
        }))
    }

    fn node_size(&self) -> usize {
        self.superblock.node_size as usize
    }

    fn self_arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or(BlockFsError::Malformed("filesystem handle already dropped"))
    }
}

impl<D: BlockDevice + 'static> InodeSource for BtrfsFilesystem<D> {
    async fn load_record(&self, number: u32) -> Result<InodeRecord> {
        let key = Key::new(number as u64, item_type::INODE_ITEM, 0);
        let data = btree::find(
            self.device.as_ref(),
            &self.chunk_map,
            self.node_size(),
            self.fs_tree_root,
            key,
        )
        .await?
        .ok_or(BlockFsError::NotFound)?;
        let item = BtrfsInodeItem::ref_from_prefix(&data)
            .map(|(i, _)| *i)
            .map_err(|_| BlockFsError::Malformed("truncated INODE_ITEM"))?;

        Ok(InodeRecord {
            size: item.size.get(),
            uid: item.uid.get(),
            gid: item.gid.get(),
            mode: item.mode.get(),
            nlink: item.nlink.get(),
            atime: (item.atime.sec.get(), item.atime.nsec.get()),
            mtime: (item.mtime.sec.get(), item.mtime.nsec.get()),
            ctime: (item.ctime.sec.get(), item.ctime.nsec.get()),
        })
    }

    async fn read_range(&self, number: u32, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let want_end = offset + out.len() as u64;
        let scan_prefix = Key::new(number as u64, item_type::EXTENT_DATA, 0);
        let mut cursor = btree::lower_bound(
            self.device.as_ref(),
            &self.chunk_map,
            self.node_size(),
            self.fs_tree_root,
            scan_prefix,
        )
        .await?;

        loop {
            let Some(key) = cursor.current_key() else {
                break;
            };
            if !key.same_prefix(&scan_prefix) {
                break;
            }
            let extent_start = key.offset;
            if extent_start >= want_end {
                break;
            }

            let data = cursor
                .current_data()
                .ok_or(BlockFsError::Malformed("extent cursor has no data"))?;
            let parsed = extent::decode(data)?;
            let extent_len = parsed.len();
            let extent_end = extent_start + extent_len;

            if extent_end > offset {
                let bytes = extent::read(self.device.as_ref(), &self.chunk_map, &parsed).await?;
                let skip = offset.saturating_sub(extent_start);
                let dest_start = extent_start.saturating_sub(offset);
                let copy_len = (extent_len - skip).min(out.len() as u64 - dest_start);
                let src = &bytes[skip as usize..(skip + copy_len) as usize];
                let dst = &mut out[dest_start as usize..(dest_start + copy_len) as usize];
                dst.copy_from_slice(src);
            }

            if !btree::next_key(
                self.device.as_ref(),
                &self.chunk_map,
                self.node_size(),
                &mut cursor,
            )
            .await?
            {
                break;
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice + 'static> Filesystem for BtrfsFilesystem<D> {
    type Inode = CacheInode<D>;

    fn root_inode_number(&self) -> u32 {
        self.root_inode
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
        let hash = dirent::name_hash(name);
        let key = Key::new(dir.number as u64, item_type::DIR_ITEM, hash);
        let data = btree::find(
            self.device.as_ref(),
            &self.chunk_map,
            self.node_size(),
            self.fs_tree_root,
            key,
        )
        .await?
        .ok_or(BlockFsError::NotFound)?;

        let entries = dirent::decode_all(&data)?;
        let entry = entries
            .into_iter()
            .find(|e| e.name == name)
            .ok_or(BlockFsError::NotFound)?;

        let child_number = entry.location.objectid as u32;
        let child = self.access_inode(child_number).await?;
        Ok(LookupResult {
            inode: child_number,
            node_type: self.node_type(&child),
        })
    }

    async fn read_entries(&self, dir: &Self::Inode, cookie: u64) -> Result<Option<DirEntryOut>> {
        let start_offset = cookie.max(DIR_START_INDEX);
        let scan_prefix = Key::new(dir.number as u64, item_type::DIR_INDEX, 0);
        let key = Key::new(dir.number as u64, item_type::DIR_INDEX, start_offset);
        let cursor = btree::lower_bound(
            self.device.as_ref(),
            &self.chunk_map,
            self.node_size(),
            self.fs_tree_root,
            key,
        )
        .await?;

        let Some(found_key) = cursor.current_key() else {
            return Ok(None);
        };
        if !found_key.same_prefix(&scan_prefix) {
            return Ok(None);
        }
        let data = cursor
            .current_data()
            .ok_or(BlockFsError::Malformed("dir index cursor has no data"))?;
        let entry = dirent::decode_one(data)?.0;

        let child_number = entry.location.objectid as u32;
        let child = self.access_inode(child_number).await?;
        Ok(Some(DirEntryOut {
            name: entry.name,
            inode: child_number,
            node_type: self.node_type(&child),
            cookie: found_key.offset + 1,
        }))
    }

    async fn read_symlink(&self, inode: &Self::Inode) -> Result<Vec<u8>> {
        let record = inode
            .record()
            .ok_or(BlockFsError::Malformed("symlink inode not ready"))?;
        if record.node_type() != NodeType::Symlink {
            return Err(BlockFsError::IllegalOperationTarget);
        }
        let mut buf = vec![0u8; record.size as usize];
        InodeSource::read_range(self, inode.number, 0, &mut buf).await?;
        Ok(buf)
    }

    fn is_obstructed(&self, dir: &Self::Inode, name: &[u8]) -> bool {
        dir.is_obstructed(name)
    }

    fn fs_stats(&self) -> FsStats {
        let sector_size = self.superblock.sector_size as u64;
        FsStats {
            block_size: sector_size,
            num_blocks: self.superblock.total_bytes / sector_size,
            free_blocks: (self.superblock.total_bytes - self.superblock.bytes_used) / sector_size,
            max_name_length: 255,
            inode_stats: None,
            fsid: crate::fs::derive_fsid(self.superblock.fs_uuid, self.root_inode),
        }
    }
}
