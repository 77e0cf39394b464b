//! `EXTENT_DATA` item decode and materialization.
//!
//! Three payload shapes share one header: inline (file bytes live right
//! in the item), regular (bytes live in a separate extent on disk), and
//! prealloc/sparse (a logical hole, read as zeros). Compressed or
//! encrypted extents are out of scope and surface as `Unsupported`
//! rather than being silently misread.

use zerocopy::FromBytes;

use super::chunk::ChunkMap;
use super::structs::{BtrfsExtentDataHeader, BtrfsExtentDataRegular, EXTENT_DATA_HEADER_SIZE};
use crate::device::{BlockDevice, read_bytes};
use crate::error::{BlockFsError, Result};

const EXTENT_TYPE_INLINE: u8 = 0;
const EXTENT_TYPE_REGULAR: u8 = 1;
const EXTENT_TYPE_PREALLOC: u8 = 2;

const COMPRESSION_NONE: u8 = 0;
const ENCRYPTION_NONE: u8 = 0;

#[derive(Debug, Clone)]
pub enum ExtentData {
    /// File bytes stored directly in the B-tree leaf.
    Inline(Vec<u8>),
    /// A hole: `num_bytes` logical zero bytes, nothing on disk.
    Sparse { num_bytes: u64 },
    /// Bytes stored out-of-line in a disk extent.
    Regular {
        disk_addr: u64,
        disk_size: u64,
        /// Offset into the disk extent where this file's data starts
        /// (nonzero after a clone/reflink of part of a larger extent).
        offset: u64,
        num_bytes: u64,
    },
}

impl ExtentData {
    /// Logical length of this extent's contribution to the file.
    pub fn len(&self) -> u64 {
        match self {
            ExtentData::Inline(bytes) => bytes.len() as u64,
            ExtentData::Sparse { num_bytes } => *num_bytes,
            ExtentData::Regular { num_bytes, .. } => *num_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode one `EXTENT_DATA` item payload (the leaf item's raw bytes).
pub fn decode(data: &[u8]) -> Result<ExtentData> {
    let header = BtrfsExtentDataHeader::ref_from_prefix(data)
        .map(|(h, _)| *h)
        .map_err(|_| BlockFsError::Malformed("truncated extent data header"))?;

    if header.compression != COMPRESSION_NONE {
        return Err(BlockFsError::Unsupported("compressed extent"));
    }
    if header.encryption != ENCRYPTION_NONE {
        return Err(BlockFsError::Unsupported("encrypted extent"));
    }

    match header.ty {
        EXTENT_TYPE_INLINE => {
            let inline = data
                .get(EXTENT_DATA_HEADER_SIZE..)
                .ok_or(BlockFsError::Malformed("truncated inline extent"))?;
            Ok(ExtentData::Inline(inline.to_vec()))
        }
        EXTENT_TYPE_REGULAR | EXTENT_TYPE_PREALLOC => {
            let rest = data
                .get(EXTENT_DATA_HEADER_SIZE..)
                .ok_or(BlockFsError::Malformed("truncated regular extent"))?;
            let body = BtrfsExtentDataRegular::ref_from_prefix(rest)
                .map(|(b, _)| *b)
                .map_err(|_| BlockFsError::Malformed("truncated regular extent body"))?;

            if body.extent_addr.get() == 0 {
                Ok(ExtentData::Sparse {
                    num_bytes: body.num_bytes.get(),
                })
            } else {
                if body.extent_offset.get() != 0 {
                    return Err(BlockFsError::Unsupported(
                        "regular extent with nonzero extent_offset",
                    ));
                }
                Ok(ExtentData::Regular {
                    disk_addr: body.extent_addr.get(),
                    disk_size: body.extent_size.get(),
                    offset: body.extent_offset.get(),
                    num_bytes: body.num_bytes.get(),
                })
            }
        }
        other => Err(BlockFsError::Malformed(
            if other == 0 { "unreachable" } else { "unknown extent type" },
        )),
    }
}

/// Read the bytes an [`ExtentData`] logically contributes, materializing
/// sparse ranges as zeros and reading regular extents through the chunk
/// map.
pub async fn read<D: BlockDevice>(
    device: &D,
    chunk_map: &ChunkMap,
    extent: &ExtentData,
) -> Result<Vec<u8>> {
    match extent {
        ExtentData::Inline(bytes) => Ok(bytes.clone()),
        ExtentData::Sparse { num_bytes } => Ok(vec![0u8; *num_bytes as usize]),
        ExtentData::Regular {
            disk_addr,
            offset,
            num_bytes,
            ..
        } => {
            let physical = chunk_map.translate(*disk_addr)?;
            read_bytes(device, physical + offset, *num_bytes as usize).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_compressed_extent() {
        let mut data = vec![0u8; EXTENT_DATA_HEADER_SIZE];
        data[16] = 1; // compression byte
        assert!(matches!(decode(&data), Err(BlockFsError::Unsupported(_))));
    }

    #[test]
    fn decodes_sparse_extent_as_hole() {
        let mut data = vec![0u8; EXTENT_DATA_HEADER_SIZE];
        data[20] = EXTENT_TYPE_REGULAR;
        let mut body = vec![0u8; 32];
        body[24..32].copy_from_slice(&4096u64.to_le_bytes()); // num_bytes
        data.extend(body);
        let extent = decode(&data).unwrap();
        assert!(matches!(extent, ExtentData::Sparse { num_bytes: 4096 }));
    }

    #[test]
    fn decodes_inline_extent() {
        let mut data = vec![0u8; EXTENT_DATA_HEADER_SIZE];
        data[20] = EXTENT_TYPE_INLINE;
        data.extend_from_slice(b"hello world");
        let extent = decode(&data).unwrap();
        match extent {
            ExtentData::Inline(bytes) => assert_eq!(bytes, b"hello world"),
            _ => panic!("expected inline extent"),
        }
    }
}
