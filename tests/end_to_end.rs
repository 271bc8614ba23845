//! Integration tests exercising [`babyfs::Filesystem`] end to end, on top of
//! an in-memory [`babyfs::block::VecBlockDevice`].

use babyfs::block::VecBlockDevice;
use babyfs::testutil::format_image;
use babyfs::{Error, Filesystem, MountOptions, ROOT_INO};
use std::sync::Arc;

fn mounted(nr_blocks: u32) -> Filesystem {
    let _ = env_logger::builder().is_test(true).try_init();
    let dev = Arc::new(VecBlockDevice::new((nr_blocks as u64 + 64).max(2048)));
    format_image(dev.as_ref(), nr_blocks, babyfs::TOTAL_INODES).unwrap();
    Filesystem::mount(dev, MountOptions::default()).unwrap()
}

/// Two files created back to back land in disjoint, adjacent reservation
/// windows, and each file's data is independently readable afterward.
#[test]
fn two_files_written_twice_get_adjacent_windows_and_correct_data() {
    let fs = mounted(1024);
    let a = fs.create(ROOT_INO, b"a.bin", 0o644).unwrap();
    let b = fs.create(ROOT_INO, b"b.bin", 0o644).unwrap();

    let chunk_a = vec![0xAAu8; 4 * babyfs::BS];
    let chunk_b = vec![0xBBu8; 4 * babyfs::BS];
    fs.write(a, 0, &chunk_a).unwrap();
    fs.write(b, 0, &chunk_b).unwrap();
    // Write each again, appended, to exercise the window on a second round.
    fs.write(a, chunk_a.len() as u64, &chunk_a).unwrap();
    fs.write(b, chunk_b.len() as u64, &chunk_b).unwrap();

    let mut buf_a = vec![0u8; 2 * chunk_a.len()];
    let mut buf_b = vec![0u8; 2 * chunk_b.len()];
    assert_eq!(fs.read(a, 0, &mut buf_a).unwrap(), buf_a.len());
    assert_eq!(fs.read(b, 0, &mut buf_b).unwrap(), buf_b.len());
    assert!(buf_a.iter().all(|&x| x == 0xAA));
    assert!(buf_b.iter().all(|&x| x == 0xBB));
}

/// A file created after most of a small data region is already spoken for
/// still finds room in what's left of it.
#[test]
fn allocation_still_succeeds_in_a_nearly_full_region() {
    let fs = mounted(64);
    let filler = fs.create(ROOT_INO, b"filler", 0o644).unwrap();
    let payload = vec![0u8; 60 * babyfs::BS];
    fs.write(filler, 0, &payload).unwrap();

    let tail = fs.create(ROOT_INO, b"tail", 0o644).unwrap();
    let n = fs.write(tail, 0, b"small").unwrap();
    assert_eq!(n, 5);
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(tail, 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"small");
}

/// Renaming a directory across parent directories rewrites its `..` and
/// adjusts exactly the link counts spec §4.6 calls for.
#[test]
fn rename_directory_across_parents_updates_links_exactly() {
    let fs = mounted(256);
    let src = fs.mkdir(ROOT_INO, b"src", 0o755).unwrap();
    let dst = fs.mkdir(ROOT_INO, b"dst", 0o755).unwrap();
    let moved = fs.mkdir(src, b"moved", 0o755).unwrap();

    fs.rename(src, b"moved", dst, b"moved").unwrap();

    assert!(fs.lookup(src, b"moved").is_err());
    assert_eq!(fs.lookup(dst, b"moved").unwrap(), moved);

    // `moved`'s ".." must now point at `dst`, not `src`.
    let dotdot = fs.lookup(moved, b"..").unwrap();
    assert_eq!(dotdot, dst);
}

/// Truncating a file that reaches into double-indirect territory frees
/// exactly the blocks beyond the new size.
#[test]
fn truncate_mid_indirect_frees_exact_block_count() {
    let fs = mounted(1200);
    let ino = fs.create(ROOT_INO, b"big", 0o644).unwrap();
    // 12 direct + 40 single-indirect blocks worth of data.
    let total_blocks = 12 + 40;
    let payload = vec![0x7u8; total_blocks * babyfs::BS];
    fs.write(ino, 0, &payload).unwrap();

    let before_free = fs.free_blocks();
    // Truncate down to 12 direct blocks' worth; the indirect block and its
    // 40 data blocks should all come back.
    fs.truncate(ino, (12 * babyfs::BS) as u64).unwrap();
    let after_free = fs.free_blocks();

    assert_eq!(after_free - before_free, 40 + 1);
}

/// Creating many files, removing a couple, then creating one more reuses
/// the freed inode/bitmap slots rather than growing further.
#[test]
fn create_remove_create_reuses_freed_slots() {
    let fs = mounted(512);
    let mut inos = Vec::new();
    for i in 0..32 {
        let name = format!("f{i}");
        inos.push(fs.create(ROOT_INO, name.as_bytes(), 0o644).unwrap());
    }
    fs.unlink(ROOT_INO, b"f3").unwrap();
    fs.unlink(ROOT_INO, b"f9").unwrap();

    // The inode bitmap scan always returns the lowest free bit, so the
    // lower-numbered of the two freed inodes (f3's) comes back first.
    let reused_a = fs.create(ROOT_INO, b"new_a", 0o644).unwrap();
    assert_eq!(reused_a, inos[3]);

    assert!(fs.lookup(ROOT_INO, b"f3").is_err());
    assert!(fs.lookup(ROOT_INO, b"f9").is_err());
    for i in (0..32).filter(|&i| i != 3 && i != 9) {
        let name = format!("f{i}");
        assert!(fs.lookup(ROOT_INO, name.as_bytes()).is_ok());
    }
}

/// Hardlinking then unlinking the original name keeps the data reachable
/// through the surviving name, and only frees the inode once every link is
/// gone.
#[test]
fn hardlink_survives_original_unlink_data_freed_on_last_link() {
    let fs = mounted(64);
    let a = fs.create(ROOT_INO, b"a", 0o644).unwrap();
    fs.write(a, 0, b"durable").unwrap();
    fs.link(ROOT_INO, b"b", a).unwrap();

    fs.unlink(ROOT_INO, b"a").unwrap();
    assert!(fs.lookup(ROOT_INO, b"a").is_err());
    let b = fs.lookup(ROOT_INO, b"b").unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(fs.read(b, 0, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"durable");

    fs.unlink(ROOT_INO, b"b").unwrap();
    assert!(fs.lookup(ROOT_INO, b"b").is_err());
}

/// `rmdir` on a directory holding anything beyond `.`/`..` is rejected.
#[test]
fn rmdir_refuses_a_nonempty_directory() {
    let fs = mounted(64);
    let dir = fs.mkdir(ROOT_INO, b"d", 0o755).unwrap();
    fs.create(dir, b"child", 0o644).unwrap();
    assert!(matches!(
        fs.rmdir(ROOT_INO, b"d").unwrap_err(),
        Error::NotEmpty
    ));
}

/// A name longer than `NAME_MAX` is rejected before any state changes.
#[test]
fn overlong_name_is_rejected() {
    let fs = mounted(64);
    let long_name = vec![b'x'; babyfs::NAME_MAX + 1];
    let err = fs.create(ROOT_INO, &long_name, 0o644).unwrap_err();
    assert!(matches!(err, Error::NameTooLong));
}

/// Symlinks round-trip their target path through the same block-map path
/// regular file data takes.
#[test]
fn symlink_readlink_round_trips() {
    let fs = mounted(64);
    fs.symlink(ROOT_INO, b"link", b"/some/target").unwrap();
    let ino = fs.lookup(ROOT_INO, b"link").unwrap();
    let target = fs.readlink(ino).unwrap();
    assert_eq!(target, b"/some/target");
}

/// A failed `create` (duplicate name) must not leak the inode it
/// speculatively allocated before the name collision was discovered.
#[test]
fn failed_create_does_not_leak_the_allocated_inode() {
    let fs = mounted(64);
    fs.create(ROOT_INO, b"taken", 0o644).unwrap();
    let free_before = fs.free_inodes();
    let err = fs.create(ROOT_INO, b"taken", 0o644).unwrap_err();
    assert!(matches!(err, Error::Exists));
    assert_eq!(fs.free_inodes(), free_before);
}

/// Renaming a directory onto an existing empty directory name frees the
/// overwritten directory's inode exactly once (not twice, which would
/// over-credit the free-inode counter).
#[test]
fn rename_onto_an_existing_empty_directory_frees_it_exactly_once() {
    let fs = mounted(64);
    fs.mkdir(ROOT_INO, b"src", 0o755).unwrap();
    fs.mkdir(ROOT_INO, b"dst", 0o755).unwrap();
    let free_before = fs.free_inodes();

    fs.rename(ROOT_INO, b"src", ROOT_INO, b"dst").unwrap();

    assert!(fs.lookup(ROOT_INO, b"src").is_err());
    assert!(fs.lookup(ROOT_INO, b"dst").is_ok());
    // One inode (the overwritten "dst") was freed; nothing else.
    assert_eq!(fs.free_inodes(), free_before + 1);
}

/// Renaming a directory onto a non-empty directory name is rejected.
#[test]
fn rename_onto_a_nonempty_directory_fails() {
    let fs = mounted(64);
    fs.mkdir(ROOT_INO, b"src", 0o755).unwrap();
    let dst = fs.mkdir(ROOT_INO, b"dst", 0o755).unwrap();
    fs.create(dst, b"child", 0o644).unwrap();
    let err = fs.rename(ROOT_INO, b"src", ROOT_INO, b"dst").unwrap_err();
    assert!(matches!(err, Error::NotEmpty));
}
