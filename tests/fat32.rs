//! End-to-end tests against an in-memory volume.

use std::collections::HashSet;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use spin::RwLock;

use kfat32::{
    BlockDevice, DeviceErr, DirError, EntryHandle, FileError, FileKind, FileSystem, MountError,
    ATTR_DIRECTORY, BLOCK_SIZE, END_OF_CLUSTER,
};

const TOTAL_SECTORS: usize = 0x4000;
const RESERVED_SECTORS: usize = 32;
const FAT_SECTORS: usize = 128;
const SECTORS_PER_CLUSTER: usize = 8;
const FIRST_DATA_SECTOR: usize = RESERVED_SECTORS + 2 * FAT_SECTORS;

/// RAM-backed block device.
struct MemDisk(RwLock<Vec<u8>>);

impl BlockDevice for MemDisk {
    fn read_blocks(&self, buf: &mut [u8], offset: usize, _block_cnt: usize) -> Result<(), DeviceErr> {
        assert!(offset % BLOCK_SIZE == 0);
        assert!(buf.len() % BLOCK_SIZE == 0);
        let data = self.0.read();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_blocks(&self, buf: &[u8], offset: usize, _block_cnt: usize) -> Result<(), DeviceErr> {
        assert!(offset % BLOCK_SIZE == 0);
        assert!(buf.len() % BLOCK_SIZE == 0);
        let mut data = self.0.write();
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

fn set_fat(img: &mut [u8], index: usize, value: u32) {
    let off = RESERVED_SECTORS * BLOCK_SIZE + index * 4;
    img[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// A freshly formatted volume: 8 MiB, 4 KiB clusters, empty root at
/// cluster 2.
fn blank_image() -> Vec<u8> {
    let mut img = vec![0u8; TOTAL_SECTORS * BLOCK_SIZE];
    img[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
    img[13] = SECTORS_PER_CLUSTER as u8;
    img[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    img[16] = 2;
    img[32..36].copy_from_slice(&(TOTAL_SECTORS as u32).to_le_bytes());
    img[36..40].copy_from_slice(&(FAT_SECTORS as u32).to_le_bytes());
    img[44..48].copy_from_slice(&2u32.to_le_bytes());
    img[82..90].copy_from_slice(b"FAT32   ");
    img[510] = 0x55;
    img[511] = 0xAA;

    set_fat(&mut img, 0, 0x0FFF_FFF8);
    set_fat(&mut img, 1, 0xFFFF_FFFF);
    // root directory chain
    set_fat(&mut img, 2, 0x0FFF_FFFF);
    img
}

/// Blank volume plus one short-named file the way another formatter
/// would have left it: `README.TXT`, 11 bytes, at cluster 3.
fn image_with_readme() -> Vec<u8> {
    let mut img = blank_image();
    let root = FIRST_DATA_SECTOR * BLOCK_SIZE;
    img[root..root + 11].copy_from_slice(b"README  TXT");
    img[root + 11] = 0x20;
    img[root + 26..root + 28].copy_from_slice(&3u16.to_le_bytes());
    img[root + 28..root + 32].copy_from_slice(&11u32.to_le_bytes());
    set_fat(&mut img, 3, 0x0FFF_FFFF);

    let data = (FIRST_DATA_SECTOR + SECTORS_PER_CLUSTER) * BLOCK_SIZE;
    img[data..data + 11].copy_from_slice(b"hello world");
    img
}

fn mount_disk(img: Vec<u8>) -> (Arc<MemDisk>, Arc<FileSystem>) {
    let disk = Arc::new(MemDisk(RwLock::new(img)));
    let fs = FileSystem::mount(disk.clone()).unwrap();
    (disk, fs)
}

fn mount(img: Vec<u8>) -> Arc<FileSystem> {
    mount_disk(img).1
}

/// Flush, drop the old volume and mount the same backing store again.
fn remount(disk: &Arc<MemDisk>, fs: Arc<FileSystem>) -> Arc<FileSystem> {
    fs.sync();
    drop(fs);
    FileSystem::mount(disk.clone()).unwrap()
}

/// Clusters of a chain starting at `first`, in order.
fn chain_of(fs: &Arc<FileSystem>, first: u32) -> Vec<u32> {
    let mut chain = Vec::new();
    let mut cluster = first;
    while (2..END_OF_CLUSTER).contains(&cluster) {
        chain.push(cluster);
        cluster = fs.read_fat(cluster);
        assert!(chain.len() <= TOTAL_SECTORS, "chain does not terminate");
    }
    chain
}

fn create_file(dir: &EntryHandle, name: &str) -> EntryHandle {
    let mut guard = dir.lock();
    assert!(guard.find(name).is_none());
    guard.create(name, FileKind::File).unwrap()
}

#[test]
fn mount_rejects_bad_signature() {
    let mut img = blank_image();
    img[82..87].copy_from_slice(b"FAT16");
    let err = FileSystem::mount(Arc::new(MemDisk(RwLock::new(img)))).unwrap_err();
    assert_eq!(err, MountError::BadSignature);
}

#[test]
fn mount_rejects_foreign_sector_size() {
    let mut img = blank_image();
    img[11..13].copy_from_slice(&1024u16.to_le_bytes());
    let err = FileSystem::mount(Arc::new(MemDisk(RwLock::new(img)))).unwrap_err();
    assert_eq!(err, MountError::SectorSizeMismatch);
}

#[test]
fn root_resolves_to_the_sentinel() {
    let fs = mount(blank_image());
    let root = fs.get_entry("/").unwrap();
    assert!(root.is_dir());
    assert_ne!(root.attr() & ATTR_DIRECTORY, 0);
    assert_eq!(root.lock().first_cluster, 2);

    // one identity, however it is reached
    assert_eq!(root, fs.root());
    assert_eq!(root, fs.get_entry("").unwrap());
    assert_eq!(root, fs.get_entry("///").unwrap());
}

#[test]
fn short_named_file_from_foreign_volume() {
    let fs = mount(image_with_readme());
    let file = fs.get_entry("/README.TXT").unwrap();
    let guard = file.lock();
    assert_eq!(guard.file_size, 11);

    let mut buf = [0u8; 11];
    assert_eq!(guard.read_at(&mut buf[..], 0), 11);
    assert_eq!(&buf, b"hello world");

    let st = guard.stat();
    assert_eq!(st.ino, 3);
    assert_eq!(st.size, 11);
    assert_eq!(st.dev, 0);

    assert!(fs.get_entry("/README.TXX").is_none());
    assert!(fs.get_entry("/readme.txt").is_none());
}

#[test]
fn create_write_read_small() {
    let fs = mount(blank_image());
    let root = fs.root();
    let file = create_file(&root, "hello.txt");

    let mut guard = file.lock();
    assert_eq!(guard.write_at(&b"world"[..], 0).unwrap(), 5);
    assert_eq!(guard.file_size, 5);

    let mut buf = [0u8; 5];
    assert_eq!(guard.read_at(&mut buf[..], 0), 5);
    assert_eq!(&buf, b"world");
    drop(guard);

    // the resolver hands back the very same cache slot
    assert_eq!(file, fs.get_entry("/hello.txt").unwrap());
}

#[test]
fn write_across_cluster_boundary_allocates_exactly() {
    let (disk, fs) = mount_disk(blank_image());
    let root = fs.root();
    let file = create_file(&root, "big.bin");

    let pattern: Vec<u8> = (0..8192u32).map(|i| (i * 7) as u8).collect();
    let mut guard = file.lock();
    assert_eq!(guard.write_at(&pattern[..], 0).unwrap(), 8192);
    assert_eq!(guard.file_size, 8192);

    let chain = chain_of(&fs, guard.first_cluster);
    assert_eq!(chain.len(), 2, "8192 bytes on 4096-byte clusters");
    assert_ne!(chain[0], chain[1]);
    drop(guard);
    drop(file);
    drop(root);

    // the on-disk record has the new size and survives a remount
    let fs = remount(&disk, fs);
    let file = fs.get_entry("/big.bin").unwrap();
    let guard = file.lock();
    assert_eq!(guard.file_size, 8192);
    let mut back = vec![0u8; 8192];
    assert_eq!(guard.read_at(&mut back[..], 0), 8192);
    assert_eq!(back, pattern);
}

#[test]
fn partial_tail_write_allocates_one() {
    let fs = mount(blank_image());
    let root = fs.root();
    let file = create_file(&root, "tail.bin");
    let mut guard = file.lock();

    assert_eq!(guard.write_at(&vec![0xAB; 4096][..], 0).unwrap(), 4096);
    assert_eq!(chain_of(&fs, guard.first_cluster).len(), 1);

    // overwrite inside the allocated region: no growth
    assert_eq!(guard.write_at(&[1, 2, 3][..], 100).unwrap(), 3);
    assert_eq!(chain_of(&fs, guard.first_cluster).len(), 1);

    // one byte just past the boundary: exactly one more cluster
    assert_eq!(guard.write_at(&[9][..], 4096).unwrap(), 1);
    assert_eq!(chain_of(&fs, guard.first_cluster).len(), 2);
    assert_eq!(guard.file_size, 4097);
}

#[test]
fn read_write_bounds() {
    let fs = mount(blank_image());
    let root = fs.root();
    let file = create_file(&root, "bounds.bin");
    let mut guard = file.lock();
    guard.write_at(&b"0123456789"[..], 0).unwrap();

    // reading at the end of the file transfers nothing
    let mut buf = [0u8; 4];
    assert_eq!(guard.read_at(&mut buf[..], 10), 0);
    assert_eq!(guard.read_at(&mut buf[..], 11), 0);
    // short read at the tail
    assert_eq!(guard.read_at(&mut buf[..], 8), 2);

    // writes may start at, but not beyond, the end
    assert_eq!(guard.write_at(&b"x"[..], 11).unwrap_err(), FileError::OutOfRange);
    assert_eq!(guard.write_at(&b"x"[..], 10).unwrap(), 1);

    // empty transfers
    let mut none = [0u8; 0];
    assert_eq!(guard.read_at(&mut none[..], 0), 0);
    assert_eq!(guard.write_at(&none[..], 0).unwrap(), 0);
}

#[test]
fn truncate_frees_the_chain_and_the_name() {
    let (disk, fs) = mount_disk(blank_image());
    let root = fs.root();
    let file = create_file(&root, "doomed.bin");
    let mut guard = file.lock();
    guard.write_at(&vec![0x5A; 8192][..], 0).unwrap();
    let chain = chain_of(&fs, guard.first_cluster);
    assert_eq!(chain.len(), 2);

    guard.truncate();
    assert_eq!(guard.first_cluster, 0);
    assert_eq!(guard.file_size, 0);
    drop(guard);
    drop(file);

    for cluster in chain {
        assert_eq!(fs.read_fat(cluster), 0, "cluster is free again");
    }
    assert!(fs.get_entry("/doomed.bin").is_none());

    // both slots of the record carry the deleted marker on disk
    fs.sync();
    {
        let img = disk.0.read();
        let root_bytes = FIRST_DATA_SECTOR * BLOCK_SIZE;
        assert_eq!(img[root_bytes], 0xE5, "long entry slot");
        assert_eq!(img[root_bytes + 32], 0xE5, "short entry slot");
    }

    // the name can be taken again
    let again = create_file(&root, "doomed.bin");
    let mut guard = again.lock();
    assert_eq!(guard.write_at(&b"fresh"[..], 0).unwrap(), 5);
}

#[test]
fn parent_lookup_keeps_the_directory() {
    let fs = mount(blank_image());
    let root = fs.root();
    let a = {
        let mut guard = root.lock();
        guard.create("a", FileKind::Dir).unwrap()
    };
    {
        let mut guard = a.lock();
        guard.create("b", FileKind::Dir).unwrap();
    }

    let (parent, name) = fs.get_parent("/a/b/c").unwrap();
    assert_eq!(name, "c");
    assert_eq!(parent, fs.get_entry("/a/b").unwrap());
    assert!(parent.is_dir());

    // the would-be child itself does not exist
    assert!(fs.get_entry("/a/b/c").is_none());
    // no final component, no parent
    assert!(fs.get_parent("/").is_none());
    // a missing intermediate hop fails the walk
    assert!(fs.get_parent("/a/x/c").is_none());
}

#[test]
fn relative_paths_resolve_from_cwd() {
    let fs = mount(blank_image());
    let root = fs.root();
    let a = {
        let mut guard = root.lock();
        guard.create("a", FileKind::Dir).unwrap()
    };
    let b = {
        let mut guard = a.lock();
        guard.create("b", FileKind::Dir).unwrap()
    };
    {
        let mut guard = b.lock();
        guard.create("leaf.txt", FileKind::File).unwrap();
    }

    assert_eq!(
        fs.get_entry_from(&a, "b/leaf.txt").unwrap(),
        fs.get_entry("/a/b/leaf.txt").unwrap()
    );
    // absolute paths ignore the working directory
    assert_eq!(fs.get_entry_from(&b, "/a").unwrap(), a);

    let (parent, name) = fs.get_parent_from(&a, "b/new.txt").unwrap();
    assert_eq!(parent, b);
    assert_eq!(name, "new.txt");
}

#[test]
fn non_directory_hop_fails() {
    let fs = mount(image_with_readme());
    assert!(fs.get_entry("/README.TXT/x").is_none());
    assert!(fs.get_parent("/README.TXT/x").is_none());
}

#[test]
fn long_and_wide_names() {
    let (disk, fs) = mount_disk(blank_image());
    let root = fs.root();
    let names = [
        "a-rather-long-filename-for-tests.txt",
        "thirteenchars",
        "naïve-名前.txt",
    ];
    for (i, name) in names.iter().enumerate() {
        let file = create_file(&root, name);
        let mut guard = file.lock();
        guard.write_at(&[i as u8; 16][..], 0).unwrap();
    }
    drop(root);

    // cold-cache lookups must decode the on-disk long records
    let fs = remount(&disk, fs);
    for (i, name) in names.iter().enumerate() {
        let path = format!("/{}", name);
        let file = fs.get_entry(&path).unwrap();
        assert_eq!(file.name(), *name);
        let guard = file.lock();
        let mut buf = [0u8; 16];
        assert_eq!(guard.read_at(&mut buf[..], 0), 16);
        assert_eq!(buf, [i as u8; 16]);
    }

    // a 13-character name fills its long entry exactly; neighbours of
    // that length must not match it
    assert!(fs.get_entry("/thirteenchar").is_none());
    assert!(fs.get_entry("/thirteencharss").is_none());
}

#[test]
fn create_validates_names() {
    let fs = mount(blank_image());
    let root = fs.root();
    let mut guard = root.lock();
    assert_eq!(
        guard.create("", FileKind::File).unwrap_err(),
        DirError::InvalidName
    );
    assert_eq!(
        guard.create("a:b", FileKind::File).unwrap_err(),
        DirError::InvalidName
    );
    drop(guard);

    // creating inside a file is refused
    let f = {
        let mut guard = root.lock();
        guard.create("plain.txt", FileKind::File).unwrap()
    };
    let mut guard = f.lock();
    assert_eq!(
        guard.create("child", FileKind::File).unwrap_err(),
        DirError::NotDir
    );
}

#[test]
fn directory_listing() {
    let fs = mount(image_with_readme());
    let root = fs.root();
    for name in ["one.txt", "two-with-a-longer-name.txt"] {
        create_file(&root, name);
    }

    let guard = root.lock();
    let mut names = Vec::new();
    let mut off = 0;
    while let Some(rec) = guard.read_dir_at(off) {
        names.push(rec.name.clone());
        off = rec.next_off;
    }
    assert!(names.contains(&"README.TXT".to_string()));
    assert!(names.contains(&"one.txt".to_string()));
    assert!(names.contains(&"two-with-a-longer-name.txt".to_string()));
}

#[test]
fn bulk_random_roundtrip_and_remount() {
    let (disk, fs) = mount_disk(blank_image());
    let root = fs.root();
    let file = create_file(&root, "random.bin");

    let mut rng = StdRng::seed_from_u64(0xF32);
    let mut data = vec![0u8; 1 << 20];
    rng.fill(&mut data[..]);

    let mut guard = file.lock();
    assert_eq!(guard.write_at(&data[..], 0).unwrap(), data.len());

    let chain = chain_of(&fs, guard.first_cluster);
    assert_eq!(chain.len(), (1 << 20) / 4096);
    let distinct: HashSet<u32> = chain.iter().copied().collect();
    assert_eq!(distinct.len(), chain.len(), "allocator repeated a cluster");

    let mut back = vec![0u8; data.len()];
    assert_eq!(guard.read_at(&mut back[..], 0), data.len());
    assert_eq!(back, data);
    drop(guard);
    drop(file);
    drop(root);

    let fs = remount(&disk, fs);
    let file = fs.get_entry("/random.bin").unwrap();
    let guard = file.lock();
    let mut back = vec![0u8; data.len()];
    assert_eq!(guard.read_at(&mut back[..], 0), data.len());
    assert_eq!(back, data);
}

#[test]
fn cache_churn_survives_reclaim() {
    let fs = mount(blank_image());
    let root = fs.root();

    // more names than the entry cache has slots, and enough records to
    // push the root directory into a second cluster
    let names: Vec<String> = (0..70).map(|i| format!("file-{:02}.dat", i)).collect();
    for (i, name) in names.iter().enumerate() {
        let file = create_file(&root, name);
        let mut guard = file.lock();
        guard.write_at(&[i as u8][..], 0).unwrap();
    }
    assert!(chain_of(&fs, 2).len() >= 2, "root grew a second cluster");

    for round in 0..2 {
        for (i, name) in names.iter().enumerate() {
            let path = format!("/{}", name);
            let file = fs.get_entry(&path).unwrap();
            let guard = file.lock();
            let mut buf = [0u8; 1];
            assert_eq!(guard.read_at(&mut buf[..], 0), 1, "round {}", round);
            assert_eq!(buf[0], i as u8);
        }
    }
}
