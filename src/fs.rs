//! Backend-independent facade: the `Filesystem` trait each backend
//! implements, and the generic walks (path-component traversal, stat
//! aggregation) written once on top of it.
//!
//! Everything here is plain data and free functions generic over `T:
//! Filesystem`. The two backends (`btrfs`, `ext2`) each provide one
//! concrete `Filesystem` impl; nothing in this module knows which.

use std::sync::Arc;

use crate::error::{BlockFsError, Result};

/// What kind of node an inode number resolves to, as far as callers
/// outside the backend need to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Directory,
    RegularFile,
    Symlink,
    None,
}

/// Aggregate inode-count fields, present only for backends that track
/// them in their superblock (ext2 does; Btrfs doesn't).
#[derive(Debug, Clone, Copy)]
pub struct InodeStats {
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// `statfs`-equivalent aggregate numbers for a mounted filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub block_size: u64,
    pub num_blocks: u64,
    pub free_blocks: u64,
    pub max_name_length: u32,
    pub inode_stats: Option<InodeStats>,
    /// 64-bit identifier synthesized from the on-disk UUID and the root
    /// inode number; see [`derive_fsid`].
    pub fsid: u64,
}

/// Derive a `statfs`-style `fsid` from a 16-byte on-disk UUID and the
/// root inode number: split the UUID into two 8-byte halves, byte-swap
/// each 4-byte word, XOR the halves word-by-word, then fold the root
/// inode number into the low word.
pub fn derive_fsid(uuid: [u8; 16], root_inode: u32) -> u64 {
    let word = |i: usize| u32::from_be_bytes(uuid[i * 4..i * 4 + 4].try_into().unwrap());
    let high = word(0) ^ word(2);
    let low = (word(1) ^ word(3)) ^ root_inode;
    ((high as u64) << 32) | low as u64
}

/// Result of resolving one path component within a directory.
#[derive(Debug, Clone, Copy)]
pub struct LookupResult {
    pub inode: u32,
    pub node_type: NodeType,
}

/// One entry produced while enumerating a directory's contents.
#[derive(Debug, Clone)]
pub struct DirEntryOut {
    pub name: Vec<u8>,
    pub inode: u32,
    pub node_type: NodeType,
    /// Opaque readdir position; pass back into `read_entries` to resume
    /// after this entry.
    pub cookie: u64,
}

/// Per-inode attributes surfaced to callers (the RPC transport maps
/// this onto whatever `stat`-shaped reply it sends).
#[derive(Debug, Clone, Copy)]
pub struct InodeAttr {
    pub inode: u32,
    pub node_type: NodeType,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub atime: (u64, u32),
    pub mtime: (u64, u32),
    pub ctime: (u64, u32),
}

/// A mounted, read-oriented filesystem. Each backend (`btrfs::fs`,
/// `ext2::fs`) implements this once; everything above this trait is
/// written generically against it.
pub trait Filesystem: Send + Sync {
    /// The backend's open-inode handle type.
    type Inode: Send + Sync;

    fn root_inode_number(&self) -> u32;

    /// Fetch (or reuse, via the weak-cached table) the inode handle for
    /// `number`, waiting for its managed-memory mapping to be ready.
    fn access_inode(&self, number: u32) -> impl Future<Output = Result<Arc<Self::Inode>>> + Send;

    fn node_type(&self, inode: &Self::Inode) -> NodeType;

    fn attr(&self, inode: &Self::Inode) -> InodeAttr;

    /// Resolve one name within a directory inode.
    fn find_entry(
        &self,
        dir: &Self::Inode,
        name: &[u8],
    ) -> impl Future<Output = Result<LookupResult>> + Send;

    /// Return the next directory entry at or after `cookie` (`0` starts
    /// from the beginning), or `None` once exhausted.
    fn read_entries(
        &self,
        dir: &Self::Inode,
        cookie: u64,
    ) -> impl Future<Output = Result<Option<DirEntryOut>>> + Send;

    /// Read a symlink's target. Only valid when `node_type` is `Symlink`.
    fn read_symlink(&self, inode: &Self::Inode) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Whether `name` has been marked obstructed (hidden) on `dir` by the
    /// caller's overlay. Backends whose inode handle tracks an
    /// obstruction set (the cache module's `Inode`) override this;
    /// everything else leaves nothing ever obstructed.
    fn is_obstructed(&self, dir: &Self::Inode, name: &[u8]) -> bool {
        let _ = (dir, name);
        false
    }

    fn fs_stats(&self) -> FsStats;
}

/// The outcome of walking a sequence of path components from a starting
/// directory.
#[derive(Debug, Clone, Copy)]
pub enum TraversalOutcome {
    /// Every component resolved; this is the terminal inode.
    Resolved(LookupResult),
    /// A component resolved to a symlink. The caller re-splits the
    /// target path and continues resolution itself;
    /// `processed_components` is how many input components were
    /// consumed to reach it.
    Symlink {
        inode: u32,
        processed_components: usize,
    },
    /// A component resolved to a name obstructed (hidden) on its parent
    /// directory. `processed_components` is how many input components
    /// were consumed to reach it.
    Obstructed {
        result: LookupResult,
        processed_components: usize,
    },
}

/// Walk `components` starting from `start`, resolving one directory
/// entry per component.
///
/// `".."` steps back to the directory most recently descended into;
/// at the mount root (nothing descended into yet) it is a no-op
/// relative to the current view. Stops early and returns `Symlink` the
/// moment a component resolves to one, since following it requires
/// re-splitting the target path — a decision made above this layer, not
/// inside it — and likewise returns `Obstructed` the moment a component
/// resolves to a name the caller has hidden via `is_obstructed`.
pub async fn traverse_links<FS: Filesystem>(
    fs: &FS,
    start: u32,
    components: &[Vec<u8>],
) -> Result<TraversalOutcome> {
    let mut stack: Vec<u32> = vec![start];
    let mut processed_components = 0usize;

    for name in components {
        processed_components += 1;
        let current = *stack.last().expect("stack always has a root entry");

        if name.as_slice() == b".." {
            if stack.len() > 1 {
                stack.pop();
            }
            continue;
        }

        let dir = fs.access_inode(current).await?;
        if fs.node_type(&dir) != NodeType::Directory {
            return Err(BlockFsError::NotADirectory);
        }

        let found = fs.find_entry(&dir, name).await?;

        if fs.is_obstructed(&dir, name) {
            return Ok(TraversalOutcome::Obstructed {
                result: found,
                processed_components,
            });
        }
        if found.node_type == NodeType::Symlink {
            return Ok(TraversalOutcome::Symlink {
                inode: found.inode,
                processed_components,
            });
        }
        stack.push(found.inode);
    }

    let final_inode = *stack.last().expect("stack always has a root entry");
    let inode = fs.access_inode(final_inode).await?;
    Ok(TraversalOutcome::Resolved(LookupResult {
        inode: final_inode,
        node_type: fs.node_type(&inode),
    }))
}

/// Resolve one path component relative to `dir`, rejecting non-directory
/// starting points up front.
pub async fn find_entry<FS: Filesystem>(
    fs: &FS,
    dir: &FS::Inode,
    name: &[u8],
) -> Result<LookupResult> {
    if fs.node_type(dir) != NodeType::Directory {
        return Err(BlockFsError::NotADirectory);
    }
    fs.find_entry(dir, name).await
}

/// Enumerate every entry of `dir` from the beginning, collecting them
/// into a `Vec`. Intended for small directories and tests; callers that
/// need cursor-based resumption should drive `Filesystem::read_entries`
/// directly instead.
pub async fn read_entries<FS: Filesystem>(fs: &FS, dir: &FS::Inode) -> Result<Vec<DirEntryOut>> {
    if fs.node_type(dir) != NodeType::Directory {
        return Err(BlockFsError::NotADirectory);
    }
    let mut out = Vec::new();
    let mut cookie = 0u64;
    while let Some(entry) = fs.read_entries(dir, cookie).await? {
        cookie = entry.cookie;
        out.push(entry);
    }
    Ok(out)
}

/// Read a symlink's target, rejecting non-symlink inodes.
pub async fn read_symlink<FS: Filesystem>(fs: &FS, inode: &FS::Inode) -> Result<Vec<u8>> {
    if fs.node_type(inode) != NodeType::Symlink {
        return Err(BlockFsError::IllegalOperationTarget);
    }
    fs.read_symlink(inode).await
}

pub fn get_fs_stats<FS: Filesystem>(fs: &FS) -> FsStats {
    fs.fs_stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeInode {
        node_type: NodeType,
        entries: Vec<(Vec<u8>, u32)>,
        symlink_target: Vec<u8>,
    }

    struct FakeFs {
        inodes: Mutex<HashMap<u32, Arc<FakeInode>>>,
    }

    impl Filesystem for FakeFs {
        type Inode = FakeInode;

        fn root_inode_number(&self) -> u32 {
            1
        }

        async fn access_inode(&self, number: u32) -> Result<Arc<Self::Inode>> {
            self.inodes
                .lock()
                .unwrap()
                .get(&number)
                .cloned()
                .ok_or(BlockFsError::NotFound)
        }

        fn node_type(&self, inode: &Self::Inode) -> NodeType {
            inode.node_type
        }

        fn attr(&self, _inode: &Self::Inode) -> InodeAttr {
            unimplemented!("not exercised by these tests")
        }

        async fn find_entry(&self, dir: &Self::Inode, name: &[u8]) -> Result<LookupResult> {
            let (_, inode) = dir
                .entries
                .iter()
                .find(|(n, _)| n == name)
                .ok_or(BlockFsError::NotFound)?;
            let target = self.inodes.lock().unwrap().get(inode).cloned().unwrap();
            Ok(LookupResult {
                inode: *inode,
                node_type: target.node_type,
            })
        }

        async fn read_entries(&self, dir: &Self::Inode, cookie: u64) -> Result<Option<DirEntryOut>> {
            let idx = cookie as usize;
            Ok(dir.entries.get(idx).map(|(name, inode)| DirEntryOut {
                name: name.clone(),
                inode: *inode,
                node_type: NodeType::RegularFile,
                cookie: cookie + 1,
            }))
        }

        async fn read_symlink(&self, inode: &Self::Inode) -> Result<Vec<u8>> {
            Ok(inode.symlink_target.clone())
        }

        fn fs_stats(&self) -> FsStats {
            FsStats {
                block_size: 4096,
                num_blocks: 100,
                free_blocks: 50,
                max_name_length: 255,
                inode_stats: None,
                fsid: derive_fsid([0u8; 16], 1),
            }
        }
    }

    fn fake_fs() -> FakeFs {
        let mut inodes = HashMap::new();
        inodes.insert(
            1,
            Arc::new(FakeInode {
                node_type: NodeType::Directory,
                entries: vec![(b"link".to_vec(), 2), (b"file".to_vec(), 3)],
                symlink_target: Vec::new(),
            }),
        );
        inodes.insert(
            2,
            Arc::new(FakeInode {
                node_type: NodeType::Symlink,
                entries: Vec::new(),
                symlink_target: b"file".to_vec(),
            }),
        );
        inodes.insert(
            3,
            Arc::new(FakeInode {
                node_type: NodeType::RegularFile,
                entries: Vec::new(),
                symlink_target: Vec::new(),
            }),
        );
        FakeFs {
            inodes: Mutex::new(inodes),
        }
    }

    #[tokio::test]
    async fn traverse_resolves_plain_file() {
        let fs = fake_fs();
        let outcome = traverse_links(&fs, 1, &[b"file".to_vec()]).await.unwrap();
        match outcome {
            TraversalOutcome::Resolved(r) => {
                assert_eq!(r.inode, 3);
                assert_eq!(r.node_type, NodeType::RegularFile);
            }
            _ => panic!("expected Resolved"),
        }
    }

    #[tokio::test]
    async fn traverse_stops_at_symlink() {
        let fs = fake_fs();
        let outcome = traverse_links(&fs, 1, &[b"link".to_vec()]).await.unwrap();
        match outcome {
            TraversalOutcome::Symlink {
                inode,
                processed_components,
            } => {
                assert_eq!(inode, 2);
                assert_eq!(processed_components, 1);
            }
            _ => panic!("expected Symlink"),
        }
    }

    #[tokio::test]
    async fn traverse_dotdot_at_mount_root_is_a_no_op() {
        let fs = fake_fs();
        let outcome = traverse_links(&fs, 1, &[b"..".to_vec(), b"file".to_vec()])
            .await
            .unwrap();
        match outcome {
            TraversalOutcome::Resolved(r) => assert_eq!(r.inode, 3),
            _ => panic!("expected Resolved"),
        }
    }

    #[tokio::test]
    async fn read_entries_collects_all() {
        let fs = fake_fs();
        let dir = fs.access_inode(1).await.unwrap();
        let entries = read_entries(&fs, &dir).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"link");
        assert_eq!(entries[1].name, b"file");
    }

    #[tokio::test]
    async fn find_entry_rejects_non_directory() {
        let fs = fake_fs();
        let file = fs.access_inode(3).await.unwrap();
        let err = find_entry(&fs, &file, b"anything").await.unwrap_err();
        assert!(matches!(err, BlockFsError::NotADirectory));
    }
}
