//! The inode table and in-memory inode store (spec §4.3, §6).
//!
//! Mode dispatch follows the redesign note in spec §9: rather than branching
//! on `i_mode` bits at every call site, each loaded inode is tagged once
//! into a [`Kind`] and callers match on that.

use crate::alloc::{self, BlockAllocInfo};
use crate::block::BlockCache;
use crate::error::{Error, Result};
use crate::map;
use crate::superblock::SuperblockManager;
use crate::{INODES_PER_BLOCK, IS, N};
use bytemuck::{Pod, Zeroable};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// `i_mode` format bits (spec §6; values follow common UNIX `S_IFMT`
/// convention, which the field's bit width and the directory engine's
/// `file_type` tag both presuppose).
pub const S_IFMT: u16 = 0xF000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFLNK: u16 = 0xA000;

/// The on-disk inode record (spec §6), 128 bytes, little-endian, packed.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct RawInode {
    pub i_size: u64,
    pub i_ctime: u32,
    pub i_atime: u32,
    pub i_mtime: u32,
    pub i_blocknum: u32,
    pub i_blocks: [u32; N],
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_gid: u16,
    pub i_nlink: u16,
    pub i_subdir_num: u16,
    pub _padding: [u8; 34],
}

/// What kind of file an inode is, resolved once from `i_mode` at load time
/// (spec §9's "Inode kind tagging" redesign note).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Regular,
    Directory,
    Symlink,
    Other,
}

fn kind_of(mode: u16) -> Kind {
    match mode & S_IFMT {
        S_IFDIR => Kind::Directory,
        S_IFREG => Kind::Regular,
        S_IFLNK => Kind::Symlink,
        _ => Kind::Other,
    }
}

/// Seconds since the UNIX epoch, truncated to the on-disk timestamp width.
/// Falls back to 0 on a clock set before the epoch rather than panicking.
fn now() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// An in-memory inode: the live, mutable counterpart to [`RawInode`], plus
/// the allocator state that only exists once a file starts taking data
/// blocks (spec §3).
pub struct Inode {
    pub ino: u32,
    pub kind: Kind,
    pub size: u64,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    pub blocknum: u32,
    pub blocks: [u32; N],
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub nlink: u16,
    pub subdir_num: u16,
    pub alloc: BlockAllocInfo,
    pub dirty: bool,
}

impl Inode {
    fn from_raw(ino: u32, raw: RawInode) -> Self {
        let mode = raw.i_mode;
        Self {
            ino,
            kind: kind_of(mode),
            size: raw.i_size,
            ctime: raw.i_ctime,
            atime: raw.i_atime,
            mtime: raw.i_mtime,
            blocknum: raw.i_blocknum,
            blocks: raw.i_blocks,
            mode,
            uid: raw.i_uid,
            gid: raw.i_gid,
            nlink: raw.i_nlink,
            subdir_num: raw.i_subdir_num,
            alloc: BlockAllocInfo::new(),
            dirty: false,
        }
    }

    fn to_raw(&self) -> RawInode {
        RawInode {
            i_size: self.size,
            i_ctime: self.ctime,
            i_atime: self.atime,
            i_mtime: self.mtime,
            i_blocknum: self.blocknum,
            i_blocks: self.blocks,
            i_mode: self.mode,
            i_uid: self.uid,
            i_gid: self.gid,
            i_nlink: self.nlink,
            i_subdir_num: self.subdir_num,
            _padding: [0u8; 34],
        }
    }

    /// Maps logical block `b`, allocating it (and any index blocks it
    /// needs) when `create` and the slot is a hole (spec §4.5.3).
    pub fn get_blocks(
        &mut self,
        sb: &SuperblockManager,
        cache: &BlockCache,
        b: u64,
        max: u32,
        create: bool,
    ) -> Result<map::Mapped> {
        let mapped = map::get_blocks(
            sb,
            cache,
            self.ino,
            &mut self.blocks,
            &mut self.blocknum,
            &mut self.alloc,
            b,
            max,
            create,
        )?;
        if create {
            self.dirty = true;
        }
        Ok(mapped)
    }

    /// Releases every block beyond `offset` and discards the reservation
    /// window (spec §4.5.4, §4.4.5).
    pub fn truncate(&mut self, sb: &SuperblockManager, cache: &BlockCache, offset: u64) -> Result<()> {
        map::truncate_blocks(
            sb,
            cache,
            &mut self.blocks,
            &mut self.blocknum,
            &mut self.alloc,
            offset,
        )?;
        self.size = self.size.min(offset);
        self.dirty = true;
        Ok(())
    }
}

fn table_location(ino: u32) -> (u64, usize) {
    let block = ino as u64 / INODES_PER_BLOCK as u64;
    let slot = ino as usize % INODES_PER_BLOCK;
    (block, slot)
}

/// The inode table: loads, allocates, persists, and evicts [`Inode`]s
/// (spec §4.3).
pub struct InodeStore {
    cache: Arc<BlockCache>,
    table_base: u64,
    bitmap_base: u64,
    nr_inodes: u32,
    live: RwLock<HashMap<u32, Arc<RwLock<Inode>>>>,
}

impl InodeStore {
    pub fn new(cache: Arc<BlockCache>, sb: &SuperblockManager) -> Self {
        Self {
            cache,
            table_base: sb.inode_table_base(),
            bitmap_base: sb.inode_bitmap_base(),
            nr_inodes: sb.nr_inodes(),
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Loads (or returns the already-live handle for) inode `ino`.
    pub fn get(&self, ino: u32) -> Result<Arc<RwLock<Inode>>> {
        if let Some(h) = self.live.read().unwrap().get(&ino) {
            return Ok(h.clone());
        }
        if ino >= self.nr_inodes {
            return Err(Error::NotFound);
        }
        let (blk, slot) = table_location(ino);
        let block = self.cache.read(self.table_base + blk)?;
        let raw: RawInode = block.read_struct(slot * IS);
        if raw.i_nlink == 0 {
            return Err(Error::NotFound);
        }
        let inode = Arc::new(RwLock::new(Inode::from_raw(ino, raw)));
        self.live.write().unwrap().insert(ino, inode.clone());
        trace!("inode {ino} loaded");
        Ok(inode)
    }

    /// Allocates a free inode number, bitmap bit and table slot, and
    /// returns a fresh, dirty in-memory inode of the given `mode` (spec
    /// §4.3 "new inode"). `sb`'s free-inode counter is decremented.
    /// `uid`/`gid` are inherited from `parent` per standard UNIX rules;
    /// `ctime`/`atime`/`mtime` are all set to the current time.
    pub fn new_inode(
        &self,
        sb: &SuperblockManager,
        parent: &Inode,
        mode: u16,
    ) -> Result<Arc<RwLock<Inode>>> {
        sb.take_free_inode()?;
        let ino = match self.find_free_bit()? {
            Some(ino) => ino,
            None => {
                sb.give_free_inode();
                return Err(Error::NoSpace);
            }
        };

        let ts = now();
        let mut inode = Inode::from_raw(
            ino,
            RawInode {
                i_size: 0,
                i_ctime: ts,
                i_atime: ts,
                i_mtime: ts,
                i_blocknum: 0,
                i_blocks: [0u32; N],
                i_mode: mode,
                i_uid: parent.uid,
                i_gid: parent.gid,
                i_nlink: 0,
                i_subdir_num: 0,
                _padding: [0u8; 34],
            },
        );
        inode.dirty = true;
        let handle = Arc::new(RwLock::new(inode));
        self.live.write().unwrap().insert(ino, handle.clone());
        debug!(
            "inode {ino} allocated, mode={mode:#o}, uid={}, gid={}",
            parent.uid, parent.gid
        );
        Ok(handle)
    }

    fn find_free_bit(&self) -> Result<Option<u32>> {
        let bits_per_buf = (crate::BS * 8) as u32;
        let nr_bitmap_blocks = (self.nr_inodes + bits_per_buf - 1) / bits_per_buf;
        for buf_idx in 0..nr_bitmap_blocks {
            let block = self.cache.read(self.bitmap_base + buf_idx as u64)?;
            let limit = ((buf_idx + 1) * bits_per_buf).min(self.nr_inodes) - buf_idx * bits_per_buf;
            for bit in 0..limit as usize {
                if !block.test_and_set_bit(bit) {
                    self.cache.mark_dirty(&block);
                    return Ok(Some(buf_idx * bits_per_buf + bit as u32));
                }
            }
        }
        Ok(None)
    }

    /// Writes an inode's in-memory state back to its table slot, clearing
    /// `dirty`, and flushes the buffer through the cache if `sync`.
    pub fn write(&self, handle: &Arc<RwLock<Inode>>, sync: bool) -> Result<()> {
        let mut inode = handle.write().unwrap();
        let (blk, slot) = table_location(inode.ino);
        let block = self.cache.read(self.table_base + blk)?;
        block.write_struct(slot * IS, &inode.to_raw());
        self.cache.mark_dirty(&block);
        if sync {
            self.cache.sync(&block)?;
        }
        inode.dirty = false;
        Ok(())
    }

    /// Drops an inode from the live cache. Does not touch disk — callers
    /// that are actually deleting the inode (`nlink` reached zero) must
    /// `write` the cleared record and clear its bitmap bit first.
    pub fn evict(&self, ino: u32) {
        self.live.write().unwrap().remove(&ino);
    }

    /// Releases inode `ino`'s table slot and bitmap bit entirely: truncates
    /// its blocks, zeroes its record, clears the bitmap bit, and gives the
    /// free-inode count back. Called once `nlink` reaches zero and no
    /// process still holds it open (spec §4.3 "inode deletion").
    pub fn free(&self, sb: &SuperblockManager, handle: &Arc<RwLock<Inode>>) -> Result<()> {
        let ino;
        {
            let mut inode = handle.write().unwrap();
            ino = inode.ino;
            inode.truncate(sb, &self.cache, 0)?;
        }
        let (blk, slot) = table_location(ino);
        let block = self.cache.read(self.table_base + blk)?;
        block.write_struct(slot * IS, &RawInode::zeroed());
        self.cache.mark_dirty(&block);

        let bits_per_buf = (crate::BS * 8) as u32;
        let bmp_block = self.cache.read(self.bitmap_base + (ino / bits_per_buf) as u64)?;
        bmp_block.test_and_clear_bit((ino % bits_per_buf) as usize);
        self.cache.mark_dirty(&bmp_block);

        sb.give_free_inode();
        self.evict(ino);
        debug!("inode {ino} freed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VecBlockDevice;
    use crate::superblock::SuperblockManager;
    use crate::testutil::format_image;

    fn mounted(nr_blocks: u32) -> (Arc<BlockCache>, SuperblockManager) {
        let dev = Arc::new(VecBlockDevice::new(2048));
        format_image(dev.as_ref(), nr_blocks, crate::TOTAL_INODES).unwrap();
        let cache = Arc::new(BlockCache::new(dev));
        let sb = SuperblockManager::mount(&cache).unwrap();
        (cache, sb)
    }

    #[test]
    fn root_inode_loads_as_a_directory_with_two_links() {
        let (cache, sb) = mounted(64);
        let store = InodeStore::new(cache, &sb);
        let root = store.get(0).unwrap();
        let root = root.read().unwrap();
        assert_eq!(root.kind, Kind::Directory);
        assert_eq!(root.nlink, 2);
        assert_eq!(root.blocknum, 1);
    }

    #[test]
    fn new_inode_claims_a_distinct_bitmap_bit() {
        let (cache, sb) = mounted(64);
        let store = InodeStore::new(cache, &sb);
        let root = store.get(0).unwrap();
        let parent = root.read().unwrap();
        let before = sb.free_inodes();
        let a = store.new_inode(&sb, &parent, S_IFREG | 0o644).unwrap();
        let b = store.new_inode(&sb, &parent, S_IFREG | 0o644).unwrap();
        assert_ne!(a.read().unwrap().ino, b.read().unwrap().ino);
        assert_eq!(sb.free_inodes(), before - 2);
    }

    #[test]
    fn new_inode_inherits_parent_owner_and_stamps_times() {
        let (cache, sb) = mounted(64);
        let store = InodeStore::new(cache, &sb);
        let root = store.get(0).unwrap();
        let mut parent = root.write().unwrap();
        parent.uid = 7;
        parent.gid = 9;
        let a = store.new_inode(&sb, &parent, S_IFREG | 0o644).unwrap();
        let a = a.read().unwrap();
        assert_eq!(a.uid, 7);
        assert_eq!(a.gid, 9);
        assert!(a.ctime > 0);
        assert_eq!(a.ctime, a.atime);
        assert_eq!(a.ctime, a.mtime);
    }

    #[test]
    fn write_then_evict_then_reload_round_trips() {
        let (cache, sb) = mounted(64);
        let store = InodeStore::new(cache, &sb);
        let root = store.get(0).unwrap();
        let parent = root.read().unwrap();
        let handle = store.new_inode(&sb, &parent, S_IFREG | 0o644).unwrap();
        let ino = {
            let mut inode = handle.write().unwrap();
            inode.size = 4096;
            inode.nlink = 1;
            inode.ino
        };
        store.write(&handle, true).unwrap();
        store.evict(ino);
        let reloaded = store.get(ino).unwrap();
        assert_eq!(reloaded.read().unwrap().size, 4096);
    }
}
