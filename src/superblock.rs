//! The superblock manager (spec §4.2).
//!
//! Owns the mount-time layout (block 0's persistent record), the free-inode
//! and free-block counters, and the reservation tree's lock. The on-disk
//! record's field names follow spec §6 exactly; the *meaning* of
//! `nr_istore_blocks`/`nr_dstore_blocks`/`nr_ifree_blocks`/`nr_bfree_blocks`
//! is under-specified by the byte table alone, so this module resolves it
//! against the fixed layout diagram in the same section (see `DESIGN.md`):
//! `nr_ifree_blocks`/`nr_bfree_blocks` are bitmap *block counts*,
//! `nr_istore_blocks` is the inode table's block count, and
//! `nr_dstore_blocks` is the data region's *base block number* — the names
//! this crate's teacher-adjacent lineage (simplefs-style superblocks) uses
//! for the same fields, and the only reading under which the worked example
//! (`2 + 1024 == 1026`) in §6's layout diagram checks out.

use crate::block::{BlockCache, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::reservation::ReservationTree;
use crate::{D, MAGIC, N, P};
use bytemuck::{Pod, Zeroable};
use log::{debug, warn};
use spin::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// The on-disk superblock record (spec §6), little-endian, packed, 38
/// bytes within block 0.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct RawSuperblock {
    pub magic: u16,
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_dstore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
    pub last_bitmap_bits: u32,
}

/// Fixed block numbers from spec §6's layout diagram.
pub const INODE_BITMAP_BASE: u64 = 1;
pub const INODE_TABLE_BASE: u64 = 2;

/// Mount-time layout plus live counters and the reservation tree.
pub struct SuperblockManager {
    nr_blocks: u32,
    nr_inodes: u32,
    nr_istore_blocks: u32,
    nr_ifree_blocks: u32,
    nr_bfree_blocks: u32,
    data_base: u32,
    last_bitmap_bits: u32,
    free_inodes: AtomicU32,
    free_blocks: AtomicU32,
    /// Per-superblock spinlock guarding the reservation tree (spec §5).
    pub reservations: Mutex<ReservationTree>,
}

impl SuperblockManager {
    /// Reads and validates block 0, building the live manager (spec §4.2).
    pub fn mount(cache: &BlockCache) -> Result<Self> {
        let block = cache.read(0)?;
        let raw: RawSuperblock = block.read_struct(0);

        let magic = raw.magic;
        if magic != MAGIC {
            return Err(Error::Corrupted(format!(
                "bad superblock magic {magic:#x}, expected {MAGIC:#x}"
            )));
        }

        let nr_blocks = raw.nr_blocks;
        let nr_inodes = raw.nr_inodes;
        let nr_istore_blocks = raw.nr_istore_blocks;
        let nr_ifree_blocks = raw.nr_ifree_blocks;
        let nr_bfree_blocks = raw.nr_bfree_blocks;
        let data_base = raw.nr_dstore_blocks;
        let last_bitmap_bits = raw.last_bitmap_bits;
        let free_inodes = raw.nr_free_inodes;
        let free_blocks = raw.nr_free_blocks;

        let inode_table_base = INODE_BITMAP_BASE + nr_ifree_blocks as u64;
        let data_bitmap_base = inode_table_base + nr_istore_blocks as u64;
        let expected_data_base = data_bitmap_base + nr_bfree_blocks as u64;
        if INODE_BITMAP_BASE >= inode_table_base
            || inode_table_base >= data_bitmap_base
            || data_bitmap_base >= data_base as u64
            || data_base as u64 != expected_data_base
        {
            return Err(Error::Corrupted(format!(
                "superblock base blocks out of order: ibitmap={INODE_BITMAP_BASE} itable={inode_table_base} dbitmap={data_bitmap_base} data={data_base}"
            )));
        }

        let device_blocks = cache.block_count();
        if data_base as u64 + nr_blocks as u64 > device_blocks {
            return Err(Error::Corrupted(format!(
                "device has {device_blocks} blocks but superblock claims data region up to {}",
                data_base as u64 + nr_blocks as u64
            )));
        }

        let bits_per_bitmap = (BLOCK_SIZE * 8) as u32;
        let expected_last_bits = if nr_blocks % bits_per_bitmap == 0 {
            bits_per_bitmap
        } else {
            nr_blocks % bits_per_bitmap
        };
        if last_bitmap_bits != expected_last_bits {
            return Err(Error::Corrupted(format!(
                "last_bitmap_bits={last_bitmap_bits}, expected {expected_last_bits} for nr_blocks={nr_blocks}"
            )));
        }

        debug!(
            "mounted: nr_blocks={nr_blocks} nr_inodes={nr_inodes} data_base={data_base} \
             free_inodes={free_inodes} free_blocks={free_blocks}"
        );

        Ok(Self {
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            data_base,
            last_bitmap_bits,
            free_inodes: AtomicU32::new(free_inodes),
            free_blocks: AtomicU32::new(free_blocks),
            reservations: Mutex::new(ReservationTree::new()),
        })
    }

    /// Persists the live counters back into block 0 (spec §4.2).
    pub fn sync(&self, cache: &BlockCache) -> Result<()> {
        let block = cache.read(0)?;
        let raw = RawSuperblock {
            magic: MAGIC,
            nr_blocks: self.nr_blocks,
            nr_inodes: self.nr_inodes,
            nr_istore_blocks: self.nr_istore_blocks,
            nr_dstore_blocks: self.data_base,
            nr_ifree_blocks: self.nr_ifree_blocks,
            nr_bfree_blocks: self.nr_bfree_blocks,
            nr_free_inodes: self.free_inodes.load(Ordering::Acquire),
            nr_free_blocks: self.free_blocks.load(Ordering::Acquire),
            last_bitmap_bits: self.last_bitmap_bits,
        };
        block.write_struct(0, &raw);
        cache.mark_dirty(&block);
        cache.sync(&block)
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    pub fn nr_inodes(&self) -> u32 {
        self.nr_inodes
    }

    pub fn inode_bitmap_base(&self) -> u64 {
        INODE_BITMAP_BASE
    }

    pub fn inode_table_base(&self) -> u64 {
        INODE_BITMAP_BASE + self.nr_ifree_blocks as u64
    }

    pub fn data_bitmap_base(&self) -> u64 {
        self.inode_table_base() + self.nr_istore_blocks as u64
    }

    pub fn nr_bbitmap_blocks(&self) -> u32 {
        self.nr_bfree_blocks
    }

    /// The data region's base block number (physical block 0 of logical
    /// data-block 0).
    pub fn data_base(&self) -> u32 {
        self.data_base
    }

    pub fn last_bitmap_bits(&self) -> u32 {
        self.last_bitmap_bits
    }

    pub fn free_inodes(&self) -> u32 {
        self.free_inodes.load(Ordering::Acquire)
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks.load(Ordering::Acquire)
    }

    /// Claims one free inode, returning an error if none remain.
    pub fn take_free_inode(&self) -> Result<()> {
        loop {
            let cur = self.free_inodes.load(Ordering::Acquire);
            if cur == 0 {
                return Err(Error::NoSpace);
            }
            if self
                .free_inodes
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn give_free_inode(&self) {
        self.free_inodes.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the free-block counter by `n`, saturating at zero and
    /// logging a warning — callers only reach this after the bitmap itself
    /// already rejected an overdraw, so a saturating clamp here is a last
    /// line of defense against a counter that drifted out of sync.
    pub fn take_free_blocks(&self, n: u32) {
        let prev = self.free_blocks.fetch_sub(n, Ordering::AcqRel);
        if prev < n {
            warn!("free_blocks counter underflowed by {}, clamping", n - prev);
            self.free_blocks.store(0, Ordering::Release);
        }
    }

    pub fn give_free_blocks(&self, n: u32) {
        self.free_blocks.fetch_add(n, Ordering::AcqRel);
    }

    /// Maximum file size in bytes, derived from the addressing scheme
    /// (spec §4.2): `D + P + P^2 + P^3` addressable blocks, minus the index
    /// blocks themselves — 1 for the single-indirect chain, `1 + P` for the
    /// double-indirect chain, `1 + P + P^2` for the triple-indirect chain —
    /// clamped by free data blocks and by `u64`.
    pub fn max_file_size(&self) -> u64 {
        let p = P as u64;
        let addressable = D as u64 + p + p * p + p * p * p;
        let index_overhead = 1 + (1 + p) + (1 + p + p * p);
        let max_blocks = addressable - index_overhead;
        debug_assert_eq!(N, D + 3);
        let by_space = self.nr_blocks as u64;
        max_blocks.min(by_space.max(1)) * BLOCK_SIZE as u64
    }
}
