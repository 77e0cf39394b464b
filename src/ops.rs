//! `file_ops`/`node_ops` vtables facing the (out-of-scope) RPC transport.
//!
//! Everything below this layer is written generically over `T:
//! Filesystem` with zero virtual dispatch; this is the one place that
//! isolates the transport from backend identity, so it's the one place
//! that needs trait objects. `async_trait` boxes the futures to make
//! that object safety possible.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cache::{FrontalHandle, Inode as CacheInode};
use crate::device::BlockDevice;
use crate::error::{BlockFsError, Result};
use crate::fs::{self, DirEntryOut, Filesystem, InodeAttr, TraversalOutcome};

/// Result of resolving one name within a directory, as the transport
/// sees it.
#[derive(Debug, Clone, Copy)]
pub struct GetLinkResult {
    pub inode: u32,
    pub node_type: fs::NodeType,
}

#[async_trait]
pub trait NodeOps: Send + Sync {
    async fn get_stats(&self) -> Result<InodeAttr>;
    async fn get_link(&self, name: &[u8]) -> Result<GetLinkResult>;
    async fn open(self: Arc<Self>) -> Result<Arc<dyn FileOps>>;
    async fn read_symlink(&self) -> Result<Vec<u8>>;
    async fn traverse_links(&self, components: &[Vec<u8>]) -> Result<TraversalOutcome>;

    async fn mkdir(&self, _name: &[u8]) -> Result<()> {
        Err(BlockFsError::Unsupported("mkdir"))
    }
    async fn symlink(&self, _name: &[u8], _target: &[u8]) -> Result<()> {
        Err(BlockFsError::Unsupported("symlink"))
    }
    async fn chmod(&self, _mode: u32) -> Result<()> {
        Err(BlockFsError::Unsupported("chmod"))
    }
    async fn utimensat(&self, _atime: (u64, u32), _mtime: (u64, u32)) -> Result<()> {
        Err(BlockFsError::Unsupported("utimensat"))
    }
    async fn obstruct_link(&self, _name: &[u8]) -> Result<()> {
        Err(BlockFsError::Unsupported("obstruct_link"))
    }
    async fn get_link_or_create(&self, name: &[u8]) -> Result<GetLinkResult> {
        self.get_link(name).await
    }
}

#[async_trait]
pub trait FileOps: Send + Sync {
    async fn seek_abs(&self, offset: u64) -> Result<u64>;
    async fn seek_rel(&self, delta: i64) -> Result<u64>;
    async fn seek_eof(&self) -> Result<u64>;
    async fn read(&self, len: usize) -> Result<Vec<u8>>;
    async fn pread(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    async fn read_entries(&self) -> Result<Option<DirEntryOut>>;
    async fn access_memory(&self) -> Result<Arc<FrontalHandle>>;

    async fn flock(&self, _exclusive: bool) -> Result<()> {
        Err(BlockFsError::Unsupported("flock"))
    }
    async fn truncate(&self, _size: u64) -> Result<()> {
        Err(BlockFsError::Unsupported("truncate"))
    }
    async fn get_file_flags(&self) -> Result<u32> {
        Ok(0)
    }
    async fn set_file_flags(&self, _flags: u32) -> Result<()> {
        Err(BlockFsError::Unsupported("set_file_flags"))
    }
}

/// Generic `node_ops` adapter: one backend inode wrapped for the
/// transport. Construct via [`BackendNode::new`]; pass the result as a
/// `dyn NodeOps` past this module's boundary.
///
/// Bound to `Filesystem<Inode = CacheInode<D>>` rather than a fully
/// opaque `FS::Inode`: both backends hand out the same cache-module
/// inode handle, and this layer needs its page-cache mapping directly
/// to serve `access_memory`/`pread`.
pub struct BackendNode<D: BlockDevice + 'static, FS: Filesystem<Inode = CacheInode<D>> + 'static> {
    fs: Arc<FS>,
    inode: Arc<CacheInode<D>>,
}

impl<D: BlockDevice + 'static, FS: Filesystem<Inode = CacheInode<D>> + 'static> BackendNode<D, FS> {
    pub fn new(fs: Arc<FS>, inode: Arc<CacheInode<D>>) -> Self {
        Self { fs, inode }
    }
}

#[async_trait]
impl<D: BlockDevice + 'static, FS: Filesystem<Inode = CacheInode<D>> + 'static> NodeOps
    for BackendNode<D, FS>
{
    async fn get_stats(&self) -> Result<InodeAttr> {
        Ok(self.fs.attr(&self.inode))
    }

    async fn get_link(&self, name: &[u8]) -> Result<GetLinkResult> {
        let result = fs::find_entry(self.fs.as_ref(), &self.inode, name).await?;
        Ok(GetLinkResult {
            inode: result.inode,
            node_type: result.node_type,
        })
    }

    async fn open(self: Arc<Self>) -> Result<Arc<dyn FileOps>> {
        Ok(Arc::new(BackendFile {
            fs: self.fs.clone(),
            inode: self.inode.clone(),
            position: Mutex::new(0),
        }))
    }

    async fn read_symlink(&self) -> Result<Vec<u8>> {
        fs::read_symlink(self.fs.as_ref(), &self.inode).await
    }

    async fn obstruct_link(&self, name: &[u8]) -> Result<()> {
        self.inode.obstruct(name.to_vec());
        Ok(())
    }

    async fn traverse_links(&self, components: &[Vec<u8>]) -> Result<TraversalOutcome> {
        fs::traverse_links(self.fs.as_ref(), self.fs.attr(&self.inode).inode, components).await
    }
}

/// Generic `file_ops` adapter: an open file with its own seek cursor, a
/// backend-independent readdir cookie, and access to the page-cache
/// mapping once the inode's fault handler has made it ready.
pub struct BackendFile<D: BlockDevice + 'static, FS: Filesystem<Inode = CacheInode<D>> + 'static> {
    fs: Arc<FS>,
    inode: Arc<CacheInode<D>>,
    position: Mutex<u64>,
}

#[async_trait]
impl<D: BlockDevice + 'static, FS: Filesystem<Inode = CacheInode<D>> + 'static> FileOps
    for BackendFile<D, FS>
{
    async fn seek_abs(&self, offset: u64) -> Result<u64> {
        *self.position.lock().await = offset;
        Ok(offset)
    }

    async fn seek_rel(&self, delta: i64) -> Result<u64> {
        let mut pos = self.position.lock().await;
        *pos = pos.saturating_add_signed(delta);
        Ok(*pos)
    }

    async fn seek_eof(&self) -> Result<u64> {
        let size = self.fs.attr(&self.inode).size;
        *self.position.lock().await = size;
        Ok(size)
    }

    async fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut pos = self.position.lock().await;
        let data = self.pread(*pos, len).await?;
        *pos += data.len() as u64;
        Ok(data)
    }

    async fn pread(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let size = self.fs.attr(&self.inode).size;
        let available = size.saturating_sub(offset).min(len as u64) as usize;
        let frontal = self
            .inode_frontal()
            .ok_or(BlockFsError::Malformed("inode has no page-cache mapping"))?;
        Ok(frontal.read(offset, available))
    }

    async fn read_entries(&self) -> Result<Option<DirEntryOut>> {
        let mut pos = self.position.lock().await;
        let entry = self.fs.read_entries(&self.inode, *pos).await?;
        if let Some(entry) = &entry {
            *pos = entry.cookie;
        }
        Ok(entry)
    }

    async fn access_memory(&self) -> Result<Arc<FrontalHandle>> {
        self.inode_frontal()
            .ok_or(BlockFsError::Malformed("inode has no page-cache mapping"))
    }
}

impl<D: BlockDevice + 'static, FS: Filesystem<Inode = CacheInode<D>> + 'static> BackendFile<D, FS> {
    fn inode_frontal(&self) -> Option<Arc<FrontalHandle>> {
        self.inode.frontal()
    }
}
