//! The block I/O shim (spec §4.1): a thin adapter over a host-provided block
//! device and its block-buffer cache.
//!
//! The real buffer cache — capacity limits, LRU eviction, writeback
//! scheduling — is an external collaborator (spec §1) this crate does not
//! own; [`BlockCache`] here is the minimal in-process stand-in every other
//! component is written against, generalized from the teacher's
//! `RAMDisk`/`BlkDev` pairing (`kernel/src/device/storage/ramdisk.rs`,
//! `kernel/src/file/fs/ext2/mod.rs::read_block`). A host embedding this
//! crate behind a real page cache would implement [`BlockDevice`] instead of
//! using [`VecBlockDevice`].
//!
//! Buffers are reference-counted the way the teacher's `RcFrame` is: holding
//! an [`BlockRef`] (an `Arc`) *is* holding the pin, and dropping the last
//! reference releases it. This turns spec §4.1's paired acquire/release
//! obligation into an ordinary RAII discipline instead of a manually
//! tracked counter, per the "Buffer handles with pin counting" redesign note
//! in spec §9.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// The fixed block size (spec §6).
pub const BLOCK_SIZE: usize = 1024;

/// A host-provided block device: the thing behind the block-buffer cache.
///
/// Implementations are expected to perform their own I/O scheduling; this
/// trait is deliberately synchronous, matching spec §4.1.
pub trait BlockDevice: Send + Sync {
    /// Total number of `BLOCK_SIZE` blocks on the device.
    fn block_count(&self) -> u64;

    /// Reads block `index` into `out`.
    fn read_block(&self, index: u64, out: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Writes `data` to block `index`.
    fn write_block(&self, index: u64, data: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// A single cached block. Pinned for as long as any [`BlockRef`] (an `Arc`
/// of this type) exists.
pub struct CachedBlock {
    index: u64,
    data: Box<[AtomicU8; BLOCK_SIZE]>,
    dirty: AtomicBool,
}

/// A pinned, reference-counted handle onto a block's bytes.
///
/// Cloning increments the pin count; dropping the last clone releases it
/// back to the cache (spec §4.1 `release`).
pub type BlockRef = Arc<CachedBlock>;

impl CachedBlock {
    fn new(index: u64, bytes: [u8; BLOCK_SIZE]) -> Self {
        let data: Box<[AtomicU8; BLOCK_SIZE]> =
            Box::new(bytes.map(AtomicU8::new));
        Self {
            index,
            data,
            dirty: AtomicBool::new(false),
        }
    }

    /// The block number this buffer is caching.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Copies the whole block out into a plain byte array.
    pub fn read_into(&self, out: &mut [u8; BLOCK_SIZE]) {
        for (o, a) in out.iter_mut().zip(self.data.iter()) {
            *o = a.load(Ordering::Acquire);
        }
    }

    /// Overwrites the whole block from a plain byte array. Does not mark
    /// dirty by itself; callers follow with [`BlockCache::mark_dirty`].
    pub fn write_from(&self, src: &[u8; BLOCK_SIZE]) {
        for (a, s) in self.data.iter().zip(src.iter()) {
            a.store(*s, Ordering::Release);
        }
    }

    /// Zeroes the whole block.
    pub fn zero(&self) {
        for a in self.data.iter() {
            a.store(0, Ordering::Release);
        }
    }

    /// Reads `T` out of the block at byte offset `off` via `bytemuck`.
    pub fn read_struct<T: bytemuck::Pod>(&self, off: usize) -> T {
        let len = core::mem::size_of::<T>();
        let mut buf = vec![0u8; len];
        for (b, a) in buf.iter_mut().zip(self.data[off..off + len].iter()) {
            *b = a.load(Ordering::Acquire);
        }
        *bytemuck::from_bytes(&buf)
    }

    /// Writes `val` into the block at byte offset `off` via `bytemuck`.
    /// Does not mark dirty; callers follow with [`BlockCache::mark_dirty`].
    pub fn write_struct<T: bytemuck::Pod>(&self, off: usize, val: &T) {
        let bytes = bytemuck::bytes_of(val);
        for (a, b) in self.data[off..off + bytes.len()].iter().zip(bytes.iter()) {
            a.store(*b, Ordering::Release);
        }
    }

    /// Reads a single byte.
    pub fn byte(&self, off: usize) -> u8 {
        self.data[off].load(Ordering::Acquire)
    }

    /// Writes a single byte. Does not mark dirty.
    pub fn set_byte(&self, off: usize, v: u8) {
        self.data[off].store(v, Ordering::Release);
    }

    /// Atomically sets bit `bit` (little-endian within each byte) and
    /// returns its previous value. This is the primitive a racing allocator
    /// retries on (spec §4.4.1: "if the bit was already set... advance by
    /// one and retry").
    pub fn test_and_set_bit(&self, bit: usize) -> bool {
        let byte_off = bit / 8;
        let mask = 1u8 << (bit % 8);
        let prev = self.data[byte_off].fetch_or(mask, Ordering::AcqRel);
        prev & mask != 0
    }

    /// Atomically clears bit `bit` and returns its previous value.
    pub fn test_and_clear_bit(&self, bit: usize) -> bool {
        let byte_off = bit / 8;
        let mask = 1u8 << (bit % 8);
        let prev = self.data[byte_off].fetch_and(!mask, Ordering::AcqRel);
        prev & mask != 0
    }

    /// Reads bit `bit` without mutating it.
    pub fn get_bit(&self, bit: usize) -> bool {
        let byte_off = bit / 8;
        let mask = 1u8 << (bit % 8);
        self.data[byte_off].load(Ordering::Acquire) & mask != 0
    }
}

/// The block I/O shim: `read`/`get_or_create`/`mark_dirty`/`sync`.
pub struct BlockCache {
    dev: Arc<dyn BlockDevice>,
    blocks: Mutex<HashMap<u64, BlockRef>>,
}

impl BlockCache {
    /// Wraps a [`BlockDevice`] in a block cache.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Total number of blocks on the underlying device.
    pub fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    fn insert_or_get(&self, index: u64, bytes: [u8; BLOCK_SIZE]) -> BlockRef {
        let mut map = self.blocks.lock().unwrap();
        map.entry(index)
            .or_insert_with(|| Arc::new(CachedBlock::new(index, bytes)))
            .clone()
    }

    /// Reads block `index`, pulling it from the device on a cache miss.
    pub fn read(&self, index: u64) -> Result<BlockRef> {
        {
            let map = self.blocks.lock().unwrap();
            if let Some(b) = map.get(&index) {
                return Ok(b.clone());
            }
        }
        let mut bytes = [0u8; BLOCK_SIZE];
        self.dev.read_block(index, &mut bytes)?;
        Ok(self.insert_or_get(index, bytes))
    }

    /// Returns a pinned buffer for `index` whose contents are undefined
    /// until written (spec §4.1 `get_or_create`): used when a caller is
    /// about to overwrite the block wholesale (freshly allocated index or
    /// data blocks) and reading the old contents first would be wasted
    /// work.
    pub fn get_or_create(&self, index: u64) -> Result<BlockRef> {
        let mut map = self.blocks.lock().unwrap();
        if let Some(b) = map.get(&index) {
            return Ok(b.clone());
        }
        let block = Arc::new(CachedBlock::new(index, [0u8; BLOCK_SIZE]));
        map.insert(index, block.clone());
        Ok(block)
    }

    /// Marks a buffer dirty so a later [`sync`](Self::sync) writes it back.
    pub fn mark_dirty(&self, b: &BlockRef) {
        b.dirty.store(true, Ordering::Release);
    }

    /// Flushes a buffer to the device if dirty.
    pub fn sync(&self, b: &BlockRef) -> Result<()> {
        if b.dirty.swap(false, Ordering::AcqRel) {
            let mut bytes = [0u8; BLOCK_SIZE];
            b.read_into(&mut bytes);
            self.dev
                .write_block(b.index(), &bytes)
                .map_err(|e| Error::Io(format!("writeback of block {}: {e}", b.index())))?;
        }
        Ok(())
    }

    /// Flushes every dirty buffer currently cached.
    pub fn sync_all(&self) -> Result<()> {
        let blocks: Vec<BlockRef> = self.blocks.lock().unwrap().values().cloned().collect();
        for b in blocks {
            self.sync(&b)?;
        }
        Ok(())
    }
}

/// An in-memory block device, generalized from the teacher's `RAMDisk`
/// (`kernel/src/device/storage/ramdisk.rs`) from a fixed 4 MiB disk to a
/// caller-sized one, for use in tests and as the reference implementation
/// mkfs-equivalents write against.
pub struct VecBlockDevice {
    data: Mutex<Vec<u8>>,
    block_count: u64,
}

impl VecBlockDevice {
    /// Creates a zeroed device of `block_count` blocks.
    pub fn new(block_count: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; block_count as usize * BLOCK_SIZE]),
            block_count,
        }
    }
}

impl BlockDevice for VecBlockDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, index: u64, out: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let off = index as usize * BLOCK_SIZE;
        out.copy_from_slice(&data[off..off + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, index: u64, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let off = index as usize * BLOCK_SIZE;
        data[off..off + BLOCK_SIZE].copy_from_slice(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_caches_and_returns_same_buffer() {
        let dev = Arc::new(VecBlockDevice::new(4));
        let cache = BlockCache::new(dev);
        let a = cache.read(1).unwrap();
        let b = cache.read(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn write_and_sync_round_trips_through_device() {
        let dev = Arc::new(VecBlockDevice::new(4));
        let cache = BlockCache::new(dev.clone());
        let b = cache.get_or_create(2).unwrap();
        let mut payload = [0u8; BLOCK_SIZE];
        payload[0] = 0xAB;
        b.write_from(&payload);
        cache.mark_dirty(&b);
        cache.sync(&b).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        dev.read_block(2, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn bit_test_and_set_reports_previous_value() {
        let dev = Arc::new(VecBlockDevice::new(1));
        let cache = BlockCache::new(dev);
        let b = cache.get_or_create(0).unwrap();
        assert!(!b.test_and_set_bit(5));
        assert!(b.test_and_set_bit(5));
        assert!(b.get_bit(5));
        assert!(b.test_and_clear_bit(5));
        assert!(!b.get_bit(5));
    }
}
