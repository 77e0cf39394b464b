//! End-to-end coverage against a hand-built, minimal ext2 image: one
//! block group, a root directory holding a regular file and a fast
//! symlink, exercised through `Ext2Filesystem` and the generic `fs`
//! walks on top of it.

use std::sync::Arc;

use blockfs::cache::InodeSource;
use blockfs::ext2::fs::Ext2Filesystem;
use blockfs::fs::{self, Filesystem, NodeType};
use blockfs::MemBlockDevice;

const BLOCK_SIZE: u32 = 1024;
const SECTOR_SIZE: usize = 512;

const ROOT_INO: u32 = 2;
const FILE_INO: u32 = 11;
const SYMLINK_INO: u32 = 12;

const FILE_CONTENTS: &[u8] = b"hello world\n";
const SYMLINK_TARGET: &[u8] = b"file.txt";

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_superblock(buf: &mut [u8]) {
    put_u32(buf, 0, 16); // inodes_count
    put_u32(buf, 4, 32); // blocks_count
    put_u32(buf, 8, 0); // r_blocks_count
    put_u32(buf, 12, 23); // free_blocks_count
    put_u32(buf, 16, 13); // free_inodes_count
    put_u32(buf, 20, 1); // first_data_block
    put_u32(buf, 24, 0); // log_block_size -> 1024
    put_u32(buf, 28, 0); // log_frag_size
    put_u32(buf, 32, 32); // blocks_per_group
    put_u32(buf, 36, 32); // frags_per_group
    put_u32(buf, 40, 16); // inodes_per_group
    put_u16(buf, 54, 0); // mnt_count
    put_u16(buf, 56, u16::MAX); // max_mnt_count
    put_u16(buf, 58, 0xEF53); // magic
    put_u16(buf, 60, 1); // state
    put_u16(buf, 62, 1); // errors
    put_u32(buf, 80, 0); // rev_level = EXT2_GOOD_OLD_REV
}

fn write_group_desc(buf: &mut [u8]) {
    put_u32(buf, 0, 3); // block_bitmap
    put_u32(buf, 4, 4); // inode_bitmap
    put_u32(buf, 8, 5); // inode_table
    put_u16(buf, 12, 23); // free_blocks_count
    put_u16(buf, 14, 13); // free_inodes_count
    put_u16(buf, 16, 1); // used_dirs_count
}

/// Write one directory-entry record at `off` within `block`.
fn write_dirent(block: &mut [u8], off: usize, inode: u32, name: &[u8], rec_len: u16, file_type: u8) {
    put_u32(block, off, inode);
    put_u16(block, off + 4, rec_len);
    block[off + 6] = name.len() as u8;
    block[off + 7] = file_type;
    block[off + 8..off + 8 + name.len()].copy_from_slice(name);
}

fn write_inode(table: &mut [u8], index_in_group: usize, mode: u16, size: u32, blocks: u32, block_ptrs: &[u32]) {
    let off = index_in_group * 128;
    put_u16(table, off, mode);
    put_u32(table, off + 4, size); // size_lo
    put_u16(table, off + 26, 1); // links_count
    put_u32(table, off + 28, blocks);
    for (i, &b) in block_ptrs.iter().enumerate() {
        put_u32(table, off + 40 + i * 4, b);
    }
}

fn build_image() -> Vec<u8> {
    let total_blocks = 32usize;
    let mut data = vec![0u8; total_blocks * BLOCK_SIZE as usize];

    write_superblock(&mut data[1024..1024 + 136]);
    write_group_desc(&mut data[2 * BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize + 32]);

    // block bitmap / inode bitmap: left zeroed, unused by the read path.

    let inode_table_start = 5 * BLOCK_SIZE as usize;
    let inode_table = &mut data[inode_table_start..inode_table_start + 2 * BLOCK_SIZE as usize];
    // Root directory inode (number 2 -> index 1).
    write_inode(inode_table, 1, 0o040_755, BLOCK_SIZE, 2, &[7]);
    // Regular file inode (number 11 -> index 10).
    write_inode(
        inode_table,
        10,
        0o100_644,
        FILE_CONTENTS.len() as u32,
        2,
        &[8],
    );
    // Fast symlink inode (number 12 -> index 11): target packed inline
    // into the block pointer array, `blocks == 0`.
    let sym_off = 11 * 128;
    put_u16(inode_table, sym_off, 0o120_777);
    put_u32(inode_table, sym_off + 4, SYMLINK_TARGET.len() as u32);
    put_u16(inode_table, sym_off + 26, 1);
    put_u32(inode_table, sym_off + 28, 0); // blocks == 0: fast symlink
    inode_table[sym_off + 40..sym_off + 40 + SYMLINK_TARGET.len()].copy_from_slice(SYMLINK_TARGET);

    // Root directory data block (block 7).
    let root_block_start = 7 * BLOCK_SIZE as usize;
    let root_block = &mut data[root_block_start..root_block_start + BLOCK_SIZE as usize];
    write_dirent(root_block, 0, ROOT_INO, b".", 12, 2);
    write_dirent(root_block, 12, ROOT_INO, b"..", 12, 2);
    write_dirent(root_block, 24, FILE_INO, b"file.txt", 16, 1);
    write_dirent(root_block, 40, SYMLINK_INO, b"link", (BLOCK_SIZE as usize - 40) as u16, 7);

    // File data block (block 8).
    let file_block_start = 8 * BLOCK_SIZE as usize;
    data[file_block_start..file_block_start + FILE_CONTENTS.len()].copy_from_slice(FILE_CONTENTS);

    data
}

async fn mount() -> Arc<Ext2Filesystem<MemBlockDevice>> {
    let device = Arc::new(MemBlockDevice::new(SECTOR_SIZE, build_image()));
    Ext2Filesystem::mount(device).await.expect("mount succeeds")
}

#[tokio::test]
async fn root_enumerates_file_and_symlink() {
    let fsys = mount().await;
    let root = fsys.access_inode(fsys.root_inode_number()).await.unwrap();
    let entries = fs::read_entries(fsys.as_ref(), &root).await.unwrap();

    let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
    assert!(names.contains(&b"file.txt".as_slice()));
    assert!(names.contains(&b"link".as_slice()));

    let file_entry = entries.iter().find(|e| e.name == b"file.txt").unwrap();
    assert_eq!(file_entry.node_type, NodeType::RegularFile);
    let link_entry = entries.iter().find(|e| e.name == b"link").unwrap();
    assert_eq!(link_entry.node_type, NodeType::Symlink);
}

#[tokio::test]
async fn reads_regular_file_contents() {
    let fsys = mount().await;
    let root = fsys.access_inode(fsys.root_inode_number()).await.unwrap();
    let found = fs::find_entry(fsys.as_ref(), &root, b"file.txt").await.unwrap();

    let mut buf = vec![0u8; FILE_CONTENTS.len()];
    InodeSource::read_range(fsys.as_ref(), found.inode, 0, &mut buf)
        .await
        .unwrap();
    assert_eq!(buf, FILE_CONTENTS);
}

#[tokio::test]
async fn reads_fast_symlink_target() {
    let fsys = mount().await;
    let root = fsys.access_inode(fsys.root_inode_number()).await.unwrap();
    let found = fs::find_entry(fsys.as_ref(), &root, b"link").await.unwrap();
    assert_eq!(found.node_type, NodeType::Symlink);

    let link = fsys.access_inode(found.inode).await.unwrap();
    let target = fs::read_symlink(fsys.as_ref(), &link).await.unwrap();
    assert_eq!(target, SYMLINK_TARGET);
}

#[tokio::test]
async fn traverse_links_resolves_nested_lookup() {
    let fsys = mount().await;
    let outcome = fs::traverse_links(
        fsys.as_ref(),
        fsys.root_inode_number(),
        &[b"file.txt".to_vec()],
    )
    .await
    .unwrap();
    match outcome {
        fs::TraversalOutcome::Resolved(r) => {
            assert_eq!(r.inode, FILE_INO);
            assert_eq!(r.node_type, NodeType::RegularFile);
        }
        fs::TraversalOutcome::Symlink { .. } => panic!("expected a resolved file"),
        fs::TraversalOutcome::Obstructed { .. } => panic!("expected a resolved file"),
    }
}

#[tokio::test]
async fn fs_stats_report_inode_counts() {
    let fsys = mount().await;
    let stats = fs::get_fs_stats(fsys.as_ref());
    assert_eq!(stats.block_size, BLOCK_SIZE as u64);
    let inode_stats = stats.inode_stats.expect("ext2 tracks inode counts");
    assert_eq!(inode_stats.total_inodes, 16);
}
