//! Generic copy-on-write B-tree traversal: point lookup, lower/upper
//! bound, first-key, and a resumable cursor-based `next_key` iterator.
//! Every Btrfs tree (root tree, chunk tree, FS tree) is walked through
//! this one engine.
//!
//! Node parsing is a header parse followed by indexing into a
//! fixed-stride record array. The cursor owns its block buffers and
//! never returns a borrow that outlives a mutation: values are
//! recomputed by (layer, index) on every access instead of being stored
//! as a slice tied to the cursor's lifetime.

use std::pin::Pin;

use zerocopy::FromBytes;

use super::chunk::ChunkMap;
use super::key::Key;
use super::structs::{BtrfsHeader, BtrfsItem, BtrfsKeyPtr, HEADER_SIZE};
use crate::device::{BlockDevice, read_bytes};
use crate::error::{BlockFsError, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One fetched `node_size`-byte B-tree block.
#[derive(Clone)]
pub struct NodeBuf {
    data: Vec<u8>,
}

impl NodeBuf {
    fn header(&self) -> Result<&BtrfsHeader> {
        BtrfsHeader::ref_from_prefix(&self.data)
            .map(|(h, _)| h)
            .map_err(|_| BlockFsError::Malformed("short btree block header"))
    }

    pub fn level(&self) -> Result<u8> {
        Ok(self.header()?.level)
    }

    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.level()? == 0)
    }

    pub fn nritems(&self) -> Result<usize> {
        Ok(self.header()?.nritems.get() as usize)
    }

    /// `i`th key pointer of an internal node.
    pub fn key_ptr(&self, i: usize) -> Result<BtrfsKeyPtr> {
        let start = HEADER_SIZE + i * size_of::<BtrfsKeyPtr>();
        let slice = self
            .data
            .get(start..)
            .ok_or(BlockFsError::Malformed("key_ptr index out of bounds"))?;
        BtrfsKeyPtr::ref_from_prefix(slice)
            .map(|(kp, _)| *kp)
            .map_err(|_| BlockFsError::Malformed("short key_ptr record"))
    }

    /// `i`th item header of a leaf.
    pub fn item(&self, i: usize) -> Result<BtrfsItem> {
        let start = HEADER_SIZE + i * size_of::<BtrfsItem>();
        let slice = self
            .data
            .get(start..)
            .ok_or(BlockFsError::Malformed("item index out of bounds"))?;
        BtrfsItem::ref_from_prefix(slice)
            .map(|(it, _)| *it)
            .map_err(|_| BlockFsError::Malformed("short item record"))
    }

    /// Payload bytes of the `i`th leaf item. Must stay within the block's
    /// data area.
    pub fn item_data(&self, i: usize) -> Result<&[u8]> {
        let item = self.item(i)?;
        let start = HEADER_SIZE + item.data_offset.get() as usize;
        let end = start + item.data_size.get() as usize;
        self.data
            .get(start..end)
            .ok_or(BlockFsError::Malformed("item payload out of bounds"))
    }
}

#[derive(Clone)]
struct CursorLayer {
    index: usize,
    node: NodeBuf,
}

/// A path from a subtree root to the current position, owning every
/// block buffer along the way. Values are re-sliced from the owned
/// top-of-stack buffer on every access, so a `&self` borrow never needs
/// to outlive a call to `next_key`.
#[derive(Clone)]
pub struct BtreeCursor {
    layers: Vec<CursorLayer>,
}

impl BtreeCursor {
    fn empty() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn current_key(&self) -> Option<Key> {
        let top = self.layers.last()?;
        let n = top.node.nritems().ok()?;
        if top.index >= n {
            return None;
        }
        top.node.item(top.index).ok().map(|it| it.key.into())
    }

    pub fn current_data(&self) -> Option<&[u8]> {
        let top = self.layers.last()?;
        let n = top.node.nritems().ok()?;
        if top.index >= n {
            return None;
        }
        top.node.item_data(top.index).ok()
    }
}

async fn fetch_node<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    logical: u64,
) -> Result<NodeBuf> {
    let physical = chunk_map.translate(logical)?;
    if physical % device.sector_size() as u64 != 0 {
        return Err(BlockFsError::Malformed(
            "translated btree block address is not sector-aligned",
        ));
    }
    let data = read_bytes(device, physical, node_size).await?;
    Ok(NodeBuf { data })
}

/// First key_ptr index with `key_ptr.key > key`; a return of `0` means
/// every key in this node is already greater than `key`, a return of
/// `nritems` is the past-the-end sentinel.
fn internal_upper_bound(node: &NodeBuf, key: &Key) -> Result<usize> {
    let n = node.nritems()?;
    let (mut lo, mut hi) = (0usize, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let k: Key = node.key_ptr(mid)?.key.into();
        if k <= *key { lo = mid + 1 } else { hi = mid }
    }
    Ok(lo)
}

/// First leaf item index with `item.key >= key`.
fn leaf_lower_bound(node: &NodeBuf, key: &Key) -> Result<usize> {
    let n = node.nritems()?;
    let (mut lo, mut hi) = (0usize, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let k: Key = node.item(mid)?.key.into();
        if k < *key { lo = mid + 1 } else { hi = mid }
    }
    Ok(lo)
}

/// First leaf item index with `item.key > key`.
fn leaf_upper_bound(node: &NodeBuf, key: &Key) -> Result<usize> {
    let n = node.nritems()?;
    let (mut lo, mut hi) = (0usize, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let k: Key = node.item(mid)?.key.into();
        if k <= *key { lo = mid + 1 } else { hi = mid }
    }
    Ok(lo)
}

/// Point lookup: `Some(payload)` iff some leaf contains an item with key
/// exactly `k`.
pub async fn find<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    root: u64,
    key: Key,
) -> Result<Option<Vec<u8>>> {
    let mut logical = root;
    loop {
        let node = fetch_node(device, chunk_map, node_size, logical).await?;
        if node.is_leaf()? {
            let idx = leaf_lower_bound(&node, &key)?;
            if idx < node.nritems()? {
                let item = node.item(idx)?;
                if Key::from(item.key) == key {
                    return Ok(Some(node.item_data(idx)?.to_vec()));
                }
            }
            return Ok(None);
        }

        let ub = internal_upper_bound(&node, &key)?;
        if ub == 0 {
            // Every key in this subtree exceeds `key`; no exact match exists.
            return Ok(None);
        }
        logical = node.key_ptr(ub - 1)?.block_ptr.get();
    }
}

/// Descend leftmost at every level, landing on the first item of the
/// leftmost leaf.
async fn descend_leftmost<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    mut logical: u64,
    layers: &mut Vec<CursorLayer>,
) -> Result<()> {
    loop {
        let node = fetch_node(device, chunk_map, node_size, logical).await?;
        if node.is_leaf()? {
            layers.push(CursorLayer { index: 0, node });
            return Ok(());
        }
        let next_logical = node.key_ptr(0)?.block_ptr.get();
        layers.push(CursorLayer { index: 0, node });
        logical = next_logical;
    }
}

pub async fn first_key<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    root: u64,
) -> Result<BtreeCursor> {
    let mut layers = Vec::new();
    descend_leftmost(device, chunk_map, node_size, root, &mut layers).await?;
    Ok(BtreeCursor { layers })
}

/// Try to move `layers` to the first item strictly after the current
/// (exhausted) leaf layer, popping up through ancestors and descending
/// back down the next sibling subtree as needed.
async fn advance_past_leaf_end<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    layers: &mut Vec<CursorLayer>,
) -> Result<bool> {
    layers.pop();
    loop {
        let Some(parent) = layers.last() else {
            return Ok(false);
        };
        let next_index = parent.index + 1;
        if next_index < parent.node.nritems()? {
            let child_logical = parent.node.key_ptr(next_index)?.block_ptr.get();
            layers.last_mut().unwrap().index = next_index;
            descend_leftmost(device, chunk_map, node_size, child_logical, layers).await?;
            return Ok(true);
        }
        layers.pop();
    }
}

/// First key `>= key` in subtree order.
///
/// Descent chooses the same predecessor child as `find`, but unlike
/// `find` never refuses to descend: if `key` is smaller than every key in
/// this node's subtree, the leftmost child still holds the answer. If the
/// chosen leaf's own local search runs past its end (the gap case where
/// `key` falls strictly between two children's ranges) the cursor is
/// advanced to the first item of the next leaf, reusing the same sibling
/// walk `next_key` uses.
pub async fn lower_bound<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    root: u64,
    key: Key,
) -> Result<BtreeCursor> {
    let mut layers = Vec::new();
    let mut logical = root;
    loop {
        let node = fetch_node(device, chunk_map, node_size, logical).await?;
        if node.is_leaf()? {
            let idx = leaf_lower_bound(&node, &key)?;
            layers.push(CursorLayer { index: idx, node });
            break;
        }
        let ub = internal_upper_bound(&node, &key)?;
        let idx = ub.saturating_sub(1);
        let next_logical = node.key_ptr(idx)?.block_ptr.get();
        layers.push(CursorLayer { index: idx, node });
        logical = next_logical;
    }

    let mut cursor = BtreeCursor { layers };
    if cursor.current_key().is_none() {
        advance_past_leaf_end(device, chunk_map, node_size, &mut cursor.layers).await?;
    }
    Ok(cursor)
}

/// First key `> key` in subtree order.
///
/// At each internal level, tries the predecessor-of-upper_bound child
/// first; if that subtree has nothing qualifying *and* a right sibling
/// exists (the upper_bound wasn't the past-the-end sentinel), tries the
/// sibling too. This is the one traversal that genuinely needs the retry
/// (unlike `lower_bound`, which can fall back on a single cheap
/// leaf-to-leaf hop because its predecessor choice is never totally
/// empty of qualifying subtrees below the root).
pub async fn upper_bound<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    root: u64,
    key: Key,
) -> Result<BtreeCursor> {
    match upper_bound_rec(device, chunk_map, node_size, root, key).await? {
        Some(layers) => Ok(BtreeCursor { layers }),
        None => Ok(BtreeCursor::empty()),
    }
}

fn upper_bound_rec<'a, D: BlockDevice>(
    device: &'a D,
    chunk_map: &'a ChunkMap,
    node_size: usize,
    logical: u64,
    key: Key,
) -> BoxFuture<'a, Result<Option<Vec<CursorLayer>>>> {
    Box::pin(async move {
        let node = fetch_node(device, chunk_map, node_size, logical).await?;

        if node.is_leaf()? {
            let idx = leaf_upper_bound(&node, &key)?;
            let nritems = node.nritems()?;
            if idx < nritems {
                return Ok(Some(vec![CursorLayer { index: idx, node }]));
            }
            return Ok(None);
        }

        let ub = internal_upper_bound(&node, &key)?;
        let nritems = node.nritems()?;

        if ub > 0 {
            let pred_logical = node.key_ptr(ub - 1)?.block_ptr.get();
            if let Some(mut suffix) =
                upper_bound_rec(device, chunk_map, node_size, pred_logical, key).await?
            {
                let mut result = vec![CursorLayer {
                    index: ub - 1,
                    node,
                }];
                result.append(&mut suffix);
                return Ok(Some(result));
            }
        }

        if ub < nritems {
            let succ_logical = node.key_ptr(ub)?.block_ptr.get();
            if let Some(mut suffix) =
                upper_bound_rec(device, chunk_map, node_size, succ_logical, key).await?
            {
                let mut result = vec![CursorLayer { index: ub, node }];
                result.append(&mut suffix);
                return Ok(Some(result));
            }
        }

        Ok(None)
    })
}

/// Advance `cursor` to the next item in tree order.
///
/// Returns `Ok(false)` when the subtree is exhausted, leaving `cursor`
/// unchanged: the escape search runs against a throwaway copy of the
/// layer stack and is only written back on success, so a failed
/// `next_key` never corrupts an in-progress iteration.
pub async fn next_key<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    node_size: usize,
    cursor: &mut BtreeCursor,
) -> Result<bool> {
    let Some(top) = cursor.layers.last() else {
        return Ok(false);
    };
    let nritems = top.node.nritems()?;
    if top.index + 1 < nritems {
        cursor.layers.last_mut().unwrap().index += 1;
        return Ok(true);
    }

    let mut trial = cursor.layers.clone();
    if advance_past_leaf_end(device, chunk_map, node_size, &mut trial).await? {
        cursor.layers = trial;
        Ok(true)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = Key::new(1, 1, 0);
        let b = Key::new(1, 1, 1);
        let c = Key::new(1, 2, 0);
        let d = Key::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn no_offset_strips_only_offset() {
        let k = Key::new(42, 0x54, 999);
        let prefix = k.no_offset();
        assert_eq!(prefix, Key::new(42, 0x54, 0));
        assert!(k.same_prefix(&prefix));
    }
}
