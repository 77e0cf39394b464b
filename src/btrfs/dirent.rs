//! `DIR_ITEM`/`DIR_INDEX` decode.
//!
//! Both item types share the same payload shape: a fixed header followed
//! by a name and, for some types, opaque xattr-style data we don't
//! interpret. `DIR_ITEM` is keyed by a name hash (lookup by name);
//! `DIR_INDEX` is keyed by a creation-order counter (readdir order). Both
//! decode through this one function.

use zerocopy::FromBytes;

use super::key::Key;
use super::structs::{BtrfsDirItemRaw, DIR_ITEM_HEADER_SIZE};
use crate::error::{BlockFsError, Result};

/// File-type tag carried inline in a dir entry, avoiding a second lookup
/// just to tell a directory from a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl From<u8> for FileType {
    fn from(ty: u8) -> Self {
        match ty {
            1 => FileType::RegularFile,
            2 => FileType::Directory,
            3 => FileType::CharDevice,
            4 => FileType::BlockDevice,
            5 => FileType::Fifo,
            6 => FileType::Socket,
            7 => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Key of the target inode's `INODE_ITEM` (objectid carries the child).
    pub location: Key,
    pub name: Vec<u8>,
    pub file_type: FileType,
}

/// Decode one `DIR_ITEM`/`DIR_INDEX` payload. A leaf `DIR_ITEM` slot can
/// actually hold several colliding entries back to back; callers that
/// need all of them should call this repeatedly against the remaining
/// tail via [`decode_all`].
pub fn decode_one(data: &[u8]) -> Result<(DirEntry, usize)> {
    let header = BtrfsDirItemRaw::ref_from_prefix(data)
        .map(|(h, _)| *h)
        .map_err(|_| BlockFsError::Malformed("truncated dir item header"))?;

    let name_len = header.name_len.get() as usize;
    let data_len = header.data_len.get() as usize;
    let name_start = DIR_ITEM_HEADER_SIZE;
    let name_end = name_start + name_len;
    let entry_end = name_end + data_len;

    let name = data
        .get(name_start..name_end)
        .ok_or(BlockFsError::Malformed("truncated dir item name"))?
        .to_vec();
    if data.len() < entry_end {
        return Err(BlockFsError::Malformed("truncated dir item data"));
    }

    Ok((
        DirEntry {
            location: header.location.into(),
            name,
            file_type: header.ty.into(),
        },
        entry_end,
    ))
}

/// Decode every entry packed into one `DIR_ITEM`/`DIR_INDEX` payload.
pub fn decode_all(mut data: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let (entry, consumed) = decode_one(data)?;
        entries.push(entry);
        data = &data[consumed..];
    }
    Ok(entries)
}

/// `DIR_ITEM` lookup-by-name key offset: a CRC32C of the name, seeded the
/// same way the on-disk format does, so a direct point lookup finds the
/// item without a full directory scan.
pub fn name_hash(name: &[u8]) -> u64 {
    crc32c::crc32c_append(!1u32, name) as u64
}
