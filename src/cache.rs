//! Inode manager and on-demand page-cache fault handler.
//!
//! This module is backend-agnostic: it owns the weak-cached inode table,
//! the `ready_event` handshake, and the long-running per-inode task that
//! services page-cache fault requests. What differs between Btrfs and
//! ext2 — how an inode record is fetched and how a byte range is read —
//! is factored out behind [`InodeSource`], which each backend implements
//! against its own tree/allocator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

use crate::device::BlockDevice;
use crate::error::Result;
use crate::fs::NodeType;

const PAGE_SIZE: u64 = 4096;

fn page_align_up(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// The subset of an on-disk inode record the manager and facade need,
/// independent of whether it came from a Btrfs `INODE_ITEM` or an ext2
/// inode table entry.
#[derive(Debug, Clone, Copy)]
pub struct InodeRecord {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub atime: (u64, u32),
    pub mtime: (u64, u32),
    pub ctime: (u64, u32),
}

impl InodeRecord {
    pub fn node_type(&self) -> NodeType {
        const S_IFMT: u32 = 0o170000;
        const S_IFDIR: u32 = 0o040000;
        const S_IFREG: u32 = 0o100000;
        const S_IFLNK: u32 = 0o120000;
        match self.mode & S_IFMT {
            S_IFDIR => NodeType::Directory,
            S_IFREG => NodeType::RegularFile,
            S_IFLNK => NodeType::Symlink,
            _ => NodeType::None,
        }
    }
}

/// Backend-specific inode data access: fetching the on-disk record for a
/// number, and materializing a byte range of file contents (walking
/// extents or block pointers as the backend requires).
pub trait InodeSource: Send + Sync + 'static {
    fn load_record(&self, number: u32) -> impl Future<Output = Result<InodeRecord>> + Send;

    /// Fill `out` with file bytes `[offset, offset + out.len())`. Must
    /// zero-fill sparse ranges itself; callers never see a partial read.
    fn read_range(
        &self,
        number: u32,
        offset: u64,
        out: &mut [u8],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Read-ahead policy passed when a managed-memory object is created.
/// Opaque to this crate beyond its name; the microkernel interprets it.
#[derive(Debug, Clone, Copy, Default)]
pub enum ReadAheadPolicy {
    #[default]
    None,
    Sequential,
}

/// Fault request shape the managed-memory primitive delivers.
#[derive(Debug, Clone, Copy)]
pub struct FaultRequest {
    pub kind: FaultKind,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Initialize,
    Writeback,
}

/// The server (backing) side of a managed-memory object.
pub struct BackingHandle {
    requests: Mutex<mpsc::UnboundedReceiver<FaultRequest>>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

/// The client-visible (frontal) side of a managed-memory object. Reads
/// block, conceptually, until the backing side has acknowledged an
/// `initialize` fault over the requested range; this in-process stand-in
/// simply shares the same buffer and trusts the handler to have filled
/// it before a read is observed.
pub struct FrontalHandle {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl FrontalHandle {
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let buf = self.buffer.lock().unwrap();
        let start = offset as usize;
        buf[start..start + len].to_vec()
    }
}

/// In-process stand-in for the microkernel's managed-memory primitive.
/// The real thing is an external collaborator; this exists so the fault
/// handler and the test suite have something concrete to drive.
pub struct ManagedMemory;

impl ManagedMemory {
    pub fn create(size_bytes: u64, _policy: ReadAheadPolicy) -> (BackingHandle, FrontalHandle, mpsc::UnboundedSender<FaultRequest>) {
        let buffer = Arc::new(Mutex::new(vec![0u8; size_bytes as usize]));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BackingHandle {
                requests: Mutex::new(rx),
                buffer: buffer.clone(),
            },
            FrontalHandle { buffer },
            tx,
        )
    }

    pub async fn submit(backing: &BackingHandle) -> Option<FaultRequest> {
        let mut rx = backing.requests.lock().unwrap();
        rx.recv().await
    }

    pub fn update(backing: &BackingHandle, offset: u64, data: &[u8]) {
        let mut buf = backing.buffer.lock().unwrap();
        buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }
}

/// An open inode: identity, lazily-populated record, and the page-cache
/// handles clients read through once `ready` fires.
pub struct Inode<D: BlockDevice> {
    pub number: u32,
    ready: Notify,
    record: Mutex<Option<InodeRecord>>,
    frontal: Mutex<Option<Arc<FrontalHandle>>>,
    fault_handler: Mutex<Option<AbortHandle>>,
    /// Names obstructed (hidden) on this directory by the caller's
    /// overlay; consulted by path traversal, set via `obstruct_link`.
    obstructed: Mutex<HashSet<Vec<u8>>>,
    _device: std::marker::PhantomData<D>,
}

impl<D: BlockDevice> Inode<D> {
    fn new(number: u32) -> Self {
        Self {
            number,
            ready: Notify::new(),
            record: Mutex::new(None),
            frontal: Mutex::new(None),
            fault_handler: Mutex::new(None),
            obstructed: Mutex::new(HashSet::new()),
            _device: std::marker::PhantomData,
        }
    }

    pub fn obstruct(&self, name: Vec<u8>) {
        self.obstructed.lock().unwrap().insert(name);
    }

    pub fn is_obstructed(&self, name: &[u8]) -> bool {
        self.obstructed.lock().unwrap().contains(name)
    }

    pub async fn wait_ready(&self) {
        if self.record.lock().unwrap().is_some() {
            return;
        }
        self.ready.notified().await;
    }

    pub fn record(&self) -> Option<InodeRecord> {
        *self.record.lock().unwrap()
    }

    pub fn frontal(&self) -> Option<Arc<FrontalHandle>> {
        self.frontal.lock().unwrap().clone()
    }
}

impl<D: BlockDevice> Drop for Inode<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.fault_handler.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Weak-cached `inode_number -> Inode` table: at most one live `Inode`
/// object exists per number at a time, enforced by upgrading the stored
/// `Weak` before ever constructing a new one.
pub struct InodeTable<D: BlockDevice> {
    entries: Mutex<HashMap<u32, Weak<Inode<D>>>>,
}

impl<D: BlockDevice> Default for InodeTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: BlockDevice> InodeTable<D> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live inode for `number`, constructing and spawning its
    /// initialization task if none exists. Callers must `wait_ready`
    /// before reading fields other than `number`.
    #[instrument(skip(self, source))]
    pub fn access_inode<S: InodeSource>(
        self: &Arc<Self>,
        number: u32,
        source: Arc<S>,
    ) -> Arc<Inode<D>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&number).and_then(Weak::upgrade) {
            return existing;
        }

        let inode = Arc::new(Inode::new(number));
        entries.insert(number, Arc::downgrade(&inode));
        drop(entries);

        let spawned = inode.clone();
        tokio::task::spawn(async move {
            if let Err(err) = initiate_inode(spawned, source).await {
                warn!(?err, number, "inode initialization failed");
            }
        });

        inode
    }
}

/// Fetch the on-disk record, allocate the managed-memory object, spawn
/// the fault handler, then fire `ready`.
async fn initiate_inode<D: BlockDevice, S: InodeSource>(
    inode: Arc<Inode<D>>,
    source: Arc<S>,
) -> Result<()> {
    let record = source.load_record(inode.number).await?;
    let mapped_size = page_align_up(record.size);

    let (backing, frontal, _tx) = ManagedMemory::create(mapped_size, ReadAheadPolicy::Sequential);
    let frontal = Arc::new(frontal);

    *inode.record.lock().unwrap() = Some(record);
    *inode.frontal.lock().unwrap() = Some(frontal);

    let handler_inode = inode.clone();
    let handler_source = source.clone();
    let handle = tokio::task::spawn(async move {
        manage_file_data(handler_inode, handler_source, backing, record.size).await
    });
    *inode.fault_handler.lock().unwrap() = Some(handle.abort_handle());

    inode.ready.notify_waiters();
    Ok(())
}

/// The long-running per-inode task: services `initialize` faults by
/// walking the backend's extents/blocks for the requested range and
/// copying or zero-filling bytes into the mapping; `writeback` is not
/// implemented by this crate and is reported, not panicked on.
#[instrument(skip(inode, source, backing))]
async fn manage_file_data<D: BlockDevice, S: InodeSource>(
    inode: Arc<Inode<D>>,
    source: Arc<S>,
    backing: BackingHandle,
    size: u64,
) {
    loop {
        let Some(request) = ManagedMemory::submit(&backing).await else {
            debug!(number = inode.number, "fault channel closed, handler exiting");
            return;
        };

        match request.kind {
            FaultKind::Initialize => {
                let backed_size = (size.saturating_sub(request.offset)).min(request.length);
                let mut buf = vec![0u8; backed_size as usize];
                if let Err(err) = source.read_range(inode.number, request.offset, &mut buf).await {
                    warn!(?err, number = inode.number, "fault handler read failed");
                    continue;
                }
                ManagedMemory::update(&backing, request.offset, &buf);
            }
            FaultKind::Writeback => {
                warn!(
                    number = inode.number,
                    "writeback fault is not supported by this backend"
                );
            }
        }
    }
}
