//! End-to-end coverage against a hand-built, single-leaf-per-tree Btrfs
//! image: one identity-mapped chunk, a root tree pointing at one
//! subvolume, and an FS tree holding a directory, a regular file, and a
//! symlink — all three trees reduced to exactly one leaf apiece so the
//! B-tree engine's leftmost-descent degenerates to "the root is the
//! leaf".

use std::sync::Arc;

use blockfs::btrfs::dirent::name_hash;
use blockfs::btrfs::fs::BtrfsFilesystem;
use blockfs::btrfs::key::Key;
use blockfs::btrfs::structs::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_ROOT_ITEM_LATEST_OFFSET, BTRFS_SUPERBLOCK_MAGIC,
    BTRFS_SUPERBLOCK_OFFSET, HEADER_SIZE, ITEM_SIZE, item_type,
};
use blockfs::cache::InodeSource;
use blockfs::fs::{self, Filesystem, NodeType};
use blockfs::MemBlockDevice;

const NODE_SIZE: usize = 4096;
const SECTOR_SIZE: u32 = 4096;
const TOTAL_BYTES: u64 = 0x2_0000;

const SUPERBLOCK_OFF: u64 = BTRFS_SUPERBLOCK_OFFSET;
const CHUNK_LEAF_OFF: u64 = 0x1_1000;
const ROOT_LEAF_OFF: u64 = 0x1_2000;
const FS_LEAF_OFF: u64 = 0x1_3000;

const ROOT_DIR_OBJECTID: u64 = 6;
const FS_TREE_OBJECTID: u64 = 5;
const FS_ROOT_INODE: u64 = BTRFS_FIRST_FREE_OBJECTID;
const FILE_INODE: u64 = 11;
const SYMLINK_INODE: u64 = 12;

const FILE_CONTENTS: &[u8] = b"hello world\n";
const SYMLINK_TARGET: &[u8] = b"file.txt";

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn write_key(buf: &mut [u8], off: usize, key: &Key) {
    put_u64(buf, off, key.objectid);
    buf[off + 8] = key.ty;
    put_u64(buf, off + 9, key.offset);
}

/// Pack `entries` (sorted by key) into one `node_size`-byte leaf: header,
/// then the item-header array, then payload bytes laid out contiguously
/// right after it.
fn build_leaf(mut entries: Vec<(Key, Vec<u8>)>) -> Vec<u8> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut buf = vec![0u8; NODE_SIZE];
    put_u32(&mut buf, 96, entries.len() as u32); // nritems
    buf[100] = 0; // level: leaf

    let items_start = HEADER_SIZE;
    let mut data_cursor = entries.len() * ITEM_SIZE;
    for (i, (key, payload)) in entries.iter().enumerate() {
        let item_off = items_start + i * ITEM_SIZE;
        write_key(&mut buf, item_off, key);
        put_u32(&mut buf, item_off + 17, data_cursor as u32);
        put_u32(&mut buf, item_off + 21, payload.len() as u32);

        let payload_start = items_start + data_cursor;
        buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);
        data_cursor += payload.len();
    }
    buf
}

fn encode_dir_entry(location: Key, name: &[u8], file_type: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 30]; // DIR_ITEM_HEADER_SIZE
    write_key(&mut buf, 0, &location);
    put_u16(&mut buf, 27, name.len() as u16);
    buf[29] = file_type;
    buf.extend_from_slice(name);
    buf
}

fn encode_inode_item(mode: u32, size: u64, nlink: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 160];
    put_u64(&mut buf, 16, size);
    put_u32(&mut buf, 40, nlink);
    put_u32(&mut buf, 52, mode);
    buf
}

fn encode_root_item(bytenr: u64, root_dirid: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 239];
    put_u64(&mut buf, 168, root_dirid);
    put_u64(&mut buf, 176, bytenr);
    buf
}

fn encode_inline_extent(data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 21]; // EXTENT_DATA_HEADER_SIZE
    put_u64(&mut buf, 8, data.len() as u64); // decoded_size
    buf[20] = 0; // inline
    buf.extend_from_slice(data);
    buf
}

fn write_superblock(buf: &mut [u8]) {
    buf[64..72].copy_from_slice(&BTRFS_SUPERBLOCK_MAGIC);
    put_u64(buf, 80, ROOT_LEAF_OFF); // root
    put_u64(buf, 88, CHUNK_LEAF_OFF); // chunk_root
    put_u64(buf, 112, TOTAL_BYTES); // total_bytes
    put_u64(buf, 120, TOTAL_BYTES / 4); // bytes_used
    put_u64(buf, 128, ROOT_DIR_OBJECTID); // root_dir_objectid
    put_u32(buf, 144, SECTOR_SIZE); // sector_size
    put_u32(buf, 148, NODE_SIZE as u32); // node_size

    // sys_chunk_array: one CHUNK_ITEM, identity-mapping the whole device.
    let chunk_key = Key::new(256, item_type::CHUNK_ITEM, 0);
    let array_off = 811usize;
    write_key(buf, array_off, &chunk_key);
    let item_off = array_off + 17;
    put_u64(buf, item_off, TOTAL_BYTES); // chunk_size
    put_u16(buf, item_off + 44, 1); // stripe_count
    put_u16(buf, item_off + 46, 1); // sub_stripes
    let stripe_off = item_off + 48;
    put_u64(buf, stripe_off, 1); // device_id
    put_u64(buf, stripe_off + 8, 0); // physical_offset: identity map
    put_u32(buf, 160, (17 + 48 + 32) as u32); // sys_chunk_array_size
}

fn build_image() -> Vec<u8> {
    let mut data = vec![0u8; TOTAL_BYTES as usize];

    write_superblock(&mut data[SUPERBLOCK_OFF as usize..SUPERBLOCK_OFF as usize + 4096]);

    let chunk_leaf = build_leaf(Vec::new());
    data[CHUNK_LEAF_OFF as usize..CHUNK_LEAF_OFF as usize + NODE_SIZE].copy_from_slice(&chunk_leaf);

    let root_item_key = Key::new(FS_TREE_OBJECTID, item_type::ROOT_ITEM, BTRFS_ROOT_ITEM_LATEST_OFFSET);
    let root_item = encode_root_item(FS_LEAF_OFF, FS_ROOT_INODE);
    let dir_item_key = Key::new(ROOT_DIR_OBJECTID, item_type::DIR_ITEM, 0);
    let dir_item = encode_dir_entry(
        Key::new(FS_TREE_OBJECTID, item_type::ROOT_ITEM, BTRFS_ROOT_ITEM_LATEST_OFFSET),
        b"default",
        2,
    );
    let root_leaf = build_leaf(vec![(root_item_key, root_item), (dir_item_key, dir_item)]);
    data[ROOT_LEAF_OFF as usize..ROOT_LEAF_OFF as usize + NODE_SIZE].copy_from_slice(&root_leaf);

    let file_hash = name_hash(b"file.txt");
    let link_hash = name_hash(b"link");

    let fs_entries = vec![
        (
            Key::new(FS_ROOT_INODE, item_type::INODE_ITEM, 0),
            encode_inode_item(0o040_755, NODE_SIZE as u64, 2),
        ),
        (
            Key::new(FS_ROOT_INODE, item_type::DIR_ITEM, file_hash),
            encode_dir_entry(Key::new(FILE_INODE, item_type::INODE_ITEM, 0), b"file.txt", 1),
        ),
        (
            Key::new(FS_ROOT_INODE, item_type::DIR_ITEM, link_hash),
            encode_dir_entry(Key::new(SYMLINK_INODE, item_type::INODE_ITEM, 0), b"link", 7),
        ),
        (
            Key::new(FS_ROOT_INODE, item_type::DIR_INDEX, 2),
            encode_dir_entry(Key::new(FILE_INODE, item_type::INODE_ITEM, 0), b"file.txt", 1),
        ),
        (
            Key::new(FS_ROOT_INODE, item_type::DIR_INDEX, 3),
            encode_dir_entry(Key::new(SYMLINK_INODE, item_type::INODE_ITEM, 0), b"link", 7),
        ),
        (
            Key::new(FILE_INODE, item_type::INODE_ITEM, 0),
            encode_inode_item(0o100_644, FILE_CONTENTS.len() as u64, 1),
        ),
        (
            Key::new(FILE_INODE, item_type::EXTENT_DATA, 0),
            encode_inline_extent(FILE_CONTENTS),
        ),
        (
            Key::new(SYMLINK_INODE, item_type::INODE_ITEM, 0),
            encode_inode_item(0o120_777, SYMLINK_TARGET.len() as u64, 1),
        ),
        (
            Key::new(SYMLINK_INODE, item_type::EXTENT_DATA, 0),
            encode_inline_extent(SYMLINK_TARGET),
        ),
    ];
    let fs_leaf = build_leaf(fs_entries);
    data[FS_LEAF_OFF as usize..FS_LEAF_OFF as usize + NODE_SIZE].copy_from_slice(&fs_leaf);

    data
}

async fn mount() -> Arc<BtrfsFilesystem<MemBlockDevice>> {
    let device = Arc::new(MemBlockDevice::new(SECTOR_SIZE as usize, build_image()));
    BtrfsFilesystem::mount(device).await.expect("mount succeeds")
}

#[tokio::test]
async fn mount_resolves_root_inode() {
    let fsys = mount().await;
    assert_eq!(fsys.root_inode_number(), FS_ROOT_INODE as u32);
}

#[tokio::test]
async fn root_enumerates_file_and_symlink() {
    let fsys = mount().await;
    let root = fsys.access_inode(fsys.root_inode_number()).await.unwrap();
    let entries = fs::read_entries(fsys.as_ref(), &root).await.unwrap();

    assert_eq!(entries.len(), 2);
    let file_entry = entries.iter().find(|e| e.name == b"file.txt").unwrap();
    assert_eq!(file_entry.node_type, NodeType::RegularFile);
    assert_eq!(file_entry.inode, FILE_INODE as u32);
    let link_entry = entries.iter().find(|e| e.name == b"link").unwrap();
    assert_eq!(link_entry.node_type, NodeType::Symlink);
    assert_eq!(link_entry.inode, SYMLINK_INODE as u32);
}

#[tokio::test]
async fn find_entry_resolves_both_children() {
    let fsys = mount().await;
    let root = fsys.access_inode(fsys.root_inode_number()).await.unwrap();

    let file = fs::find_entry(fsys.as_ref(), &root, b"file.txt").await.unwrap();
    assert_eq!(file.inode, FILE_INODE as u32);
    assert_eq!(file.node_type, NodeType::RegularFile);

    let link = fs::find_entry(fsys.as_ref(), &root, b"link").await.unwrap();
    assert_eq!(link.inode, SYMLINK_INODE as u32);
    assert_eq!(link.node_type, NodeType::Symlink);
}

#[tokio::test]
async fn reads_inline_regular_file_contents() {
    let fsys = mount().await;
    let mut buf = vec![0u8; FILE_CONTENTS.len()];
    InodeSource::read_range(fsys.as_ref(), FILE_INODE as u32, 0, &mut buf)
        .await
        .unwrap();
    assert_eq!(buf, FILE_CONTENTS);
}

#[tokio::test]
async fn reads_inline_symlink_target() {
    let fsys = mount().await;
    let link = fsys.access_inode(SYMLINK_INODE as u32).await.unwrap();
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
            assert_eq!(r.inode, FILE_INODE as u32);
            assert_eq!(r.node_type, NodeType::RegularFile);
        }
        fs::TraversalOutcome::Symlink { .. } => panic!("expected a resolved file"),
        fs::TraversalOutcome::Obstructed { .. } => panic!("expected a resolved file"),
    }
}
