//! The directory engine (spec §4.6): fixed 256-byte directory records, four
//! per block, rather than ext2's variable-length dirents.
//!
//! A record is a tombstone/free slot iff *both* `inode_no == 0` and
//! `name_len == 0` (spec §3, GLOSSARY): checking `inode_no` alone would
//! misfire on the root directory's own records, since the root is inode 0
//! and its `.`/`..` legitimately point at inode 0 with a non-zero
//! `name_len`.

use crate::block::BlockCache;
use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::map::Mapped;
use crate::superblock::SuperblockManager;
use crate::{DRECS_PER_BLOCK, DREC, FT_DIR, NAME_MAX};
use bytemuck::{Pod, Zeroable};

/// The on-disk directory record (spec §6), 256 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct DirRecord {
    pub inode_no: u32,
    pub name: [u8; NAME_MAX],
    pub name_len: u8,
    pub file_type: u8,
}

impl DirRecord {
    fn is_free(&self) -> bool {
        self.inode_no == 0 && self.name_len == 0
    }

    fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

fn block_count_for_size(size: u64) -> u64 {
    (size + crate::BS as u64 - 1) / crate::BS as u64
}

fn make_record(inode_no: u32, name: &[u8], file_type: u8) -> DirRecord {
    let mut rec = DirRecord::zeroed();
    rec.inode_no = inode_no;
    rec.name[..name.len()].copy_from_slice(name);
    rec.name_len = name.len() as u8;
    rec.file_type = file_type;
    rec
}

/// Scans every existing block of `dir`, calling `visit(block_physical,
/// slot, record)` for each record. Stops early (returning `Ok(Some(r))`)
/// the first time `visit` returns `Some`.
fn scan<T>(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    mut visit: impl FnMut(u64, usize, &DirRecord) -> Option<T>,
) -> Result<Option<T>> {
    let nblocks = block_count_for_size(dir.size);
    for b in 0..nblocks {
        let physical = match dir.get_blocks(sb, cache, b, 1, false)? {
            Mapped::Block { physical, .. } => physical as u64,
            Mapped::Hole => continue,
        };
        let block = cache.read(physical)?;
        for slot in 0..DRECS_PER_BLOCK {
            let rec: DirRecord = block.read_struct(slot * DREC);
            if let Some(r) = visit(physical, slot, &rec) {
                return Ok(Some(r));
            }
        }
    }
    Ok(None)
}

/// Looks up `name` in `dir` (spec §4.6 `find_entry`).
pub fn find_entry(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    name: &[u8],
) -> Result<(u32, u8)> {
    let found = scan(sb, cache, dir, |_, _, rec| {
        if !rec.is_free() && rec.name_bytes() == name {
            Some((rec.inode_no, rec.file_type))
        } else {
            None
        }
    })?;
    found.ok_or(Error::NotFound)
}

/// Inserts a new `(name, inode_no)` record into `dir`, reusing a free slot
/// if one exists or appending a new block otherwise (spec §4.6
/// `add_entry`).
pub fn add_entry(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    inode_no: u32,
    name: &[u8],
    file_type: u8,
) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }

    let mut free_slot: Option<(u64, usize)> = None;
    let duplicate = scan(sb, cache, dir, |physical, slot, rec| {
        if rec.is_free() {
            if free_slot.is_none() {
                free_slot = Some((physical, slot));
            }
            None
        } else if rec.name_bytes() == name {
            Some(())
        } else {
            None
        }
    })?;
    if duplicate.is_some() {
        return Err(Error::Exists);
    }

    let rec = make_record(inode_no, name, file_type);
    if let Some((physical, slot)) = free_slot {
        let block = cache.read(physical)?;
        block.write_struct(slot * DREC, &rec);
        cache.mark_dirty(&block);
    } else {
        let b = block_count_for_size(dir.size);
        let physical = match dir.get_blocks(sb, cache, b, 1, true)? {
            Mapped::Block { physical, .. } => physical as u64,
            Mapped::Hole => unreachable!("create=true never returns a hole"),
        };
        let block = cache.get_or_create(physical)?;
        block.zero();
        block.write_struct(0, &rec);
        cache.mark_dirty(&block);
        dir.size += crate::BS as u64;
    }
    dir.dirty = true;
    Ok(())
}

/// Removes the record named `name` from `dir`, returning the inode number
/// it referenced (spec §4.6 `delete_entry`).
pub fn delete_entry(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    name: &[u8],
) -> Result<u32> {
    let found = scan(sb, cache, dir, |physical, slot, rec| {
        if !rec.is_free() && rec.name_bytes() == name {
            Some((physical, slot, rec.inode_no))
        } else {
            None
        }
    })?;
    let (physical, slot, ino) = found.ok_or(Error::NotFound)?;
    let block = cache.read(physical)?;
    block.write_struct(slot * DREC, &DirRecord::zeroed());
    cache.mark_dirty(&block);
    dir.dirty = true;
    Ok(ino)
}

/// Repoints the record named `name` at a different inode/type in place,
/// without touching its slot — the directory-side half of rename (spec
/// §4.6 supplement; the inode-store half lives alongside inode lifecycle
/// operations).
pub fn set_link(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    name: &[u8],
    new_ino: u32,
    new_ft: u8,
) -> Result<()> {
    let found = scan(sb, cache, dir, |physical, slot, rec| {
        if !rec.is_free() && rec.name_bytes() == name {
            Some((physical, slot))
        } else {
            None
        }
    })?;
    let (physical, slot) = found.ok_or(Error::NotFound)?;
    let block = cache.read(physical)?;
    let rec = make_record(new_ino, name, new_ft);
    block.write_struct(slot * DREC, &rec);
    cache.mark_dirty(&block);
    dir.dirty = true;
    Ok(())
}

/// Calls `f(name, inode_no, file_type)` for every live record in `dir`
/// (spec §4.6 `iterate`).
pub fn iterate(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    mut f: impl FnMut(&[u8], u32, u8),
) -> Result<()> {
    scan(sb, cache, dir, |_, _, rec| {
        if !rec.is_free() {
            f(rec.name_bytes(), rec.inode_no, rec.file_type);
        }
        None::<()>
    })?;
    Ok(())
}

/// Writes the initial `.`/`..` records for a freshly created directory
/// inode and sets its metadata accordingly (spec §4.6 `make_empty`).
pub fn make_empty(
    sb: &SuperblockManager,
    cache: &BlockCache,
    dir: &mut Inode,
    parent_ino: u32,
) -> Result<()> {
    debug_assert_eq!(dir.size, 0);
    let physical = match dir.get_blocks(sb, cache, 0, 1, true)? {
        Mapped::Block { physical, .. } => physical as u64,
        Mapped::Hole => unreachable!("create=true never returns a hole"),
    };
    let block = cache.get_or_create(physical)?;
    block.zero();
    block.write_struct(0, &make_record(dir.ino, b".", FT_DIR));
    block.write_struct(DREC, &make_record(parent_ino, b"..", FT_DIR));
    cache.mark_dirty(&block);
    // `dir.size` tracks whole blocks, not live records (spec §8 invariant
    // 7: "every directory's size is a multiple of BS") — slots 2 and 3 of
    // this block are free slots `add_entry` can already reuse, not holes
    // past the end of the file.
    dir.size = crate::BS as u64;
    dir.subdir_num = 0;
    dir.nlink = 2;
    dir.dirty = true;
    Ok(())
}

/// True if `dir` holds nothing but `.` and `..` (spec §4.6 `empty_dir`,
/// the rmdir precondition).
pub fn empty_dir(sb: &SuperblockManager, cache: &BlockCache, dir: &mut Inode) -> Result<bool> {
    let mut count = 0u32;
    scan(sb, cache, dir, |_, _, rec| {
        if !rec.is_free() {
            count += 1;
        }
        None::<()>
    })?;
    Ok(count <= 2)
}

/// The inode number `dir`'s `..` entry points at.
pub fn dotdot(sb: &SuperblockManager, cache: &BlockCache, dir: &mut Inode) -> Result<u32> {
    find_entry(sb, cache, dir, b"..").map(|(ino, _)| ino)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VecBlockDevice;
    use crate::inode::InodeStore;
    use crate::superblock::SuperblockManager;
    use crate::testutil::format_image;
    use crate::FT_REG;
    use std::sync::Arc;

    fn mounted(nr_blocks: u32) -> (Arc<BlockCache>, SuperblockManager, InodeStore) {
        let dev = Arc::new(VecBlockDevice::new(2048));
        format_image(dev.as_ref(), nr_blocks, crate::TOTAL_INODES).unwrap();
        let cache = Arc::new(BlockCache::new(dev));
        let sb = SuperblockManager::mount(&cache).unwrap();
        let store = InodeStore::new(cache.clone(), &sb);
        (cache, sb, store)
    }

    #[test]
    fn root_directory_starts_with_dot_and_dotdot() {
        let (cache, sb, store) = mounted(64);
        let root = store.get(0).unwrap();
        let mut root = root.write().unwrap();
        assert!(empty_dir(&sb, &cache, &mut root).unwrap());
        assert_eq!(dotdot(&sb, &cache, &mut root).unwrap(), 0);
    }

    #[test]
    fn add_find_delete_round_trip() {
        let (cache, sb, store) = mounted(64);
        let root = store.get(0).unwrap();
        let mut root = root.write().unwrap();
        add_entry(&sb, &cache, &mut root, 7, b"hello.txt", FT_REG).unwrap();
        assert!(!empty_dir(&sb, &cache, &mut root).unwrap());
        let (ino, ft) = find_entry(&sb, &cache, &mut root, b"hello.txt").unwrap();
        assert_eq!(ino, 7);
        assert_eq!(ft, FT_REG);
        assert_eq!(delete_entry(&sb, &cache, &mut root, b"hello.txt").unwrap(), 7);
        assert!(find_entry(&sb, &cache, &mut root, b"hello.txt").is_err());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (cache, sb, store) = mounted(64);
        let root = store.get(0).unwrap();
        let mut root = root.write().unwrap();
        add_entry(&sb, &cache, &mut root, 7, b"a", FT_REG).unwrap();
        let err = add_entry(&sb, &cache, &mut root, 8, b"a", FT_REG).unwrap_err();
        assert!(matches!(err, Error::Exists));
    }

    #[test]
    fn deleted_slot_is_reused_before_growing_a_new_block() {
        let (cache, sb, store) = mounted(64);
        let root = store.get(0).unwrap();
        let mut root = root.write().unwrap();
        for i in 0..2 {
            add_entry(&sb, &cache, &mut root, 10 + i, &[b'a' + i as u8], FT_REG).unwrap();
        }
        let size_before = root.size;
        delete_entry(&sb, &cache, &mut root, b"a").unwrap();
        add_entry(&sb, &cache, &mut root, 99, b"z", FT_REG).unwrap();
        assert_eq!(root.size, size_before);
    }
}
