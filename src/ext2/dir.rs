//! Directory-entry decode: ext2 directories are just regular file data
//! containing a singly-linked chain of variable-length records per
//! block, terminated by the last entry's `rec_len` reaching the block's
//! own end rather than by a count.

use zerocopy::FromBytes;

use super::structs::{EXT2_DIR_ENTRY_HEADER_SIZE, Ext2DirEntryHeaderRaw, file_type};
use crate::error::{BlockFsError, Result};
use crate::fs::NodeType;

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
            file_type::REGULAR => FileType::RegularFile,
            file_type::DIRECTORY => FileType::Directory,
            file_type::CHARDEV => FileType::CharDevice,
            file_type::BLOCKDEV => FileType::BlockDevice,
            file_type::FIFO => FileType::Fifo,
            file_type::SOCKET => FileType::Socket,
            file_type::SYMLINK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }
}

impl From<FileType> for NodeType {
    fn from(ft: FileType) -> Self {
        match ft {
            FileType::Directory => NodeType::Directory,
            FileType::RegularFile => NodeType::RegularFile,
            FileType::Symlink => NodeType::Symlink,
            _ => NodeType::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: FileType,
}

/// Decode one record at the start of `data`. Returns the entry (`None`
/// for an unused slot where `inode == 0`) and the record's `rec_len`, so
/// the caller can advance to the next record regardless of whether this
/// one was live.
pub fn decode_one(data: &[u8]) -> Result<(Option<DirEntry>, usize)> {
    let header = Ext2DirEntryHeaderRaw::ref_from_prefix(data)
        .map(|(h, _)| *h)
        .map_err(|_| BlockFsError::Malformed("truncated ext2 dir entry header"))?;

    let rec_len = header.rec_len.get() as usize;
    if rec_len < EXT2_DIR_ENTRY_HEADER_SIZE || rec_len > data.len() {
        return Err(BlockFsError::Malformed("ext2 dir entry rec_len out of range"));
    }

    if header.inode.get() == 0 {
        return Ok((None, rec_len));
    }

    let name_len = header.name_len as usize;
    let name = data
        .get(EXT2_DIR_ENTRY_HEADER_SIZE..EXT2_DIR_ENTRY_HEADER_SIZE + name_len)
        .ok_or(BlockFsError::Malformed("truncated ext2 dir entry name"))?
        .to_vec();

    Ok((
        Some(DirEntry {
            inode: header.inode.get(),
            name,
            file_type: header.file_type.into(),
        }),
        rec_len,
    ))
}

/// Decode every live entry in one directory data block.
pub fn decode_block(mut data: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let (entry, rec_len) = decode_one(data)?;
        if let Some(entry) = entry {
            entries.push(entry);
        }
        data = &data[rec_len..];
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_entry(inode: u32, name: &[u8], file_type: u8, rec_len: u16) -> Vec<u8> {
        let header = Ext2DirEntryHeaderRaw {
            inode: zerocopy::byteorder::little_endian::U32::new(inode),
            rec_len: zerocopy::byteorder::little_endian::U16::new(rec_len),
            name_len: name.len() as u8,
            file_type,
        };
        use zerocopy::IntoBytes;
        let mut buf = header.as_bytes().to_vec();
        buf.extend_from_slice(name);
        buf.resize(rec_len as usize, 0);
        buf
    }

    #[test]
    fn decodes_single_entry() {
        let buf = encode_entry(2, b".", file_type::DIRECTORY, 12);
        let (entry, rec_len) = decode_one(&buf).unwrap();
        let entry = entry.unwrap();
        assert_eq!(rec_len, 12);
        assert_eq!(entry.name, b".");
        assert_eq!(entry.file_type, FileType::Directory);
    }

    #[test]
    fn skips_deleted_entry() {
        let mut block = encode_entry(0, b"", file_type::UNKNOWN, 16);
        block.extend(encode_entry(5, b"real", file_type::REGULAR, 16));
        let entries = decode_block(&block).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"real");
    }

    #[test]
    fn decode_block_collects_all_live_entries() {
        let mut block = encode_entry(2, b".", file_type::DIRECTORY, 12);
        block.extend(encode_entry(2, b"..", file_type::DIRECTORY, 12));
        block.extend(encode_entry(11, b"lost+found", file_type::DIRECTORY, 24));
        let entries = decode_block(&block).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].name, b"lost+found");
    }
}
