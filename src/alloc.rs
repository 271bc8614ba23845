//! The block allocator (spec §4.4): reservation-window placement on top of
//! the bitmap primitive.

use crate::bitmap::{self, BITS_PER_BUFFER};
use crate::block::BlockCache;
use crate::error::{Error, Result};
use crate::reservation::ReservationWindow;
use crate::superblock::SuperblockManager;
use log::trace;

/// Per-inode block-allocation info (spec §3), lazily created for regular
/// files and directories on first data-block allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockAllocInfo {
    pub window: ReservationWindow,
    pub last_alloc_logical: Option<u32>,
    pub last_alloc_physical: Option<u32>,
}

impl BlockAllocInfo {
    /// Spec §4.4.5 `init_block_alloc_info`.
    pub fn new() -> Self {
        Self {
            window: ReservationWindow::empty(),
            last_alloc_logical: None,
            last_alloc_physical: None,
        }
    }
}

fn load_bitmap_span(
    cache: &BlockCache,
    sb: &SuperblockManager,
    start: u32,
    end_incl: u32,
) -> Result<(Vec<crate::block::BlockRef>, u32, u32, u32)> {
    let first_buf = start / BITS_PER_BUFFER;
    let last_buf = end_incl / BITS_PER_BUFFER;
    let base = sb.data_bitmap_base();
    let mut buffers = Vec::with_capacity((last_buf - first_buf + 1) as usize);
    for idx in first_buf..=last_buf {
        buffers.push(cache.read(base + idx as u64)?);
    }
    let lo = start - first_buf * BITS_PER_BUFFER;
    let hi = end_incl - first_buf * BITS_PER_BUFFER + 1;
    Ok((buffers, lo, hi, first_buf))
}

/// Spec §4.4.2 `try_to_extend`: non-blocking lock acquisition, extends the
/// window's tail by `extra`, bounded by the next window's `start - 1` and
/// by the data region's end.
pub fn try_to_extend(
    sb: &SuperblockManager,
    inode_no: u32,
    alloc: &mut BlockAllocInfo,
    extra: u32,
) -> bool {
    if alloc.window.is_empty() || extra == 0 {
        return false;
    }
    let Some(mut tree) = sb.reservations.try_lock() else {
        return false;
    };
    let bound = tree
        .successor_start(alloc.window.start)
        .map(|s| s.saturating_sub(1))
        .unwrap_or(u32::MAX)
        .min(sb.nr_blocks().saturating_sub(1));
    let new_end = (alloc.window.end.saturating_add(extra)).min(bound);
    if new_end <= alloc.window.end {
        return false;
    }
    tree.remove(alloc.window.start);
    if tree
        .insert(alloc.window.start, new_end, inode_no)
        .is_err()
    {
        return false;
    }
    alloc.window.end = new_end;
    true
}

/// Spec §4.4.3 `alloc_new_reservation`: places (or replaces) `alloc`'s
/// window near `goal`, verifying the candidate actually has free space
/// before committing it. Returns `Ok(false)` (not an error) when no
/// placement could be found after a bounded number of retries.
fn alloc_new_reservation(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode_no: u32,
    alloc: &mut BlockAllocInfo,
) -> Result<bool> {
    if !alloc.window.is_empty() && alloc.window.alloc_hit.saturating_mul(2) > alloc.window.len() {
        alloc.window.double_goal_size();
    }

    let nr_blocks = sb.nr_blocks();
    let old_start = if alloc.window.is_empty() {
        None
    } else {
        Some(alloc.window.start)
    };
    let mut search_from = alloc
        .last_alloc_logical
        .map(|l| l + 1)
        .unwrap_or(old_start.unwrap_or(0));

    for _ in 0..8 {
        let candidate = {
            let tree = sb.reservations.lock();
            tree.find_next_reservable(
                search_from,
                alloc.window.goal_size,
                0,
                nr_blocks,
                old_start,
            )
        };
        let Some((cand_start, cand_end)) = candidate else {
            return Ok(false);
        };

        let (buffers, lo, hi, first_buf) = load_bitmap_span(cache, sb, cand_start, cand_end)?;
        match bitmap::first_clear_bit(&buffers, lo, hi) {
            Some(first_local) => {
                let new_start = first_buf * BITS_PER_BUFFER + first_local;
                let mut tree = sb.reservations.lock();
                if let Some(s) = old_start {
                    tree.remove(s);
                }
                tree.insert(new_start, cand_end, inode_no)?;
                drop(tree);
                alloc.window.start = new_start;
                alloc.window.end = cand_end;
                alloc.window.alloc_hit = 0;
                trace!("inode {inode_no}: placed reservation window [{new_start}, {cand_end}]");
                return Ok(true);
            }
            None => {
                // Candidate fully occupied: advance past it and retry.
                search_from = cand_end + 1;
            }
        }
    }
    Ok(false)
}

/// Spec §4.4.3: the inner allocation loop.
pub fn allocate_with_reservation(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode_no: u32,
    alloc: &mut BlockAllocInfo,
    mut goal: Option<u32>,
    count: u32,
) -> Result<(u32, u32)> {
    let mut fail_streak = 0u32;

    loop {
        let outside = match goal {
            Some(g) => g < alloc.window.start || g > alloc.window.end,
            None => true,
        };

        if alloc.window.is_empty() || outside || fail_streak > 0 {
            alloc.window.bump_goal_size(count);
            if !alloc_new_reservation(sb, cache, inode_no, alloc)? {
                fail_streak += 1;
                if fail_streak >= 2 {
                    return allocate_no_window(sb, cache, goal, count);
                }
                continue;
            }
            fail_streak = 0;
            if let Some(g) = goal {
                if g < alloc.window.start || g > alloc.window.end {
                    goal = None;
                }
            }
        } else {
            let g = goal.unwrap();
            let remaining = alloc.window.end - g + 1;
            if remaining < count {
                try_to_extend(sb, inode_no, alloc, count - remaining);
            }
        }

        let (buffers, lo, hi, first_buf) =
            load_bitmap_span(cache, sb, alloc.window.start, alloc.window.end)?;
        let goal_bit = goal.map(|g| lo + (g - alloc.window.start));
        let mut local_count = count;
        match bitmap::try_to_allocate(
            cache,
            &buffers,
            goal_bit,
            &mut local_count,
            Some((lo, hi)),
            BITS_PER_BUFFER,
        ) {
            Some(first_local) => {
                // first_local is expressed in the same basis as lo/hi
                // (relative to buffers[0], i.e. window.start's bitmap
                // block), so the run's logical start is window.start plus
                // the offset past lo.
                let first_logical = alloc.window.start + (first_local - lo);
                let _ = first_buf;
                alloc.window.alloc_hit = alloc.window.alloc_hit.saturating_add(local_count);
                alloc.last_alloc_logical = Some(first_logical + local_count - 1);
                alloc.last_alloc_physical = Some(sb.data_base() + first_logical + local_count - 1);
                return Ok((sb.data_base() + first_logical, local_count));
            }
            None => {
                fail_streak += 1;
                if fail_streak >= 2 {
                    return allocate_no_window(sb, cache, goal, count);
                }
            }
        }
    }
}

/// Fallback path when reservation placement repeatedly fails: a plain
/// bitmap scan with no window, starting from `goal`'s bitmap block (or the
/// first) and advancing block by block until space is found or the bitmap
/// is exhausted (spec §4.4.3's "falls back to an allocation with no window
/// before surfacing `OUT_OF_SPACE`").
fn allocate_no_window(
    sb: &SuperblockManager,
    cache: &BlockCache,
    goal: Option<u32>,
    count: u32,
) -> Result<(u32, u32)> {
    let nr_blocks = sb.nr_blocks();
    if nr_blocks == 0 {
        return Err(Error::NoSpace);
    }
    let start_logical = goal.unwrap_or(0).min(nr_blocks - 1);
    let nr_bitmap_blocks = sb.nr_bbitmap_blocks();
    let start_buf = start_logical / BITS_PER_BUFFER;

    for buf_idx in start_buf..nr_bitmap_blocks {
        let block = cache.read(sb.data_bitmap_base() + buf_idx as u64)?;
        let local_goal = if buf_idx == start_buf {
            Some(start_logical - buf_idx * BITS_PER_BUFFER)
        } else {
            None
        };
        let last_bits = if buf_idx + 1 == nr_bitmap_blocks {
            sb.last_bitmap_bits()
        } else {
            BITS_PER_BUFFER
        };
        let mut c = count;
        if let Some(first_local) =
            bitmap::try_to_allocate(cache, &[block], local_goal, &mut c, None, last_bits)
        {
            let first_logical = buf_idx * BITS_PER_BUFFER + first_local;
            return Ok((sb.data_base() + first_logical, c));
        }
    }
    Err(Error::NoSpace)
}

/// Spec §4.4.4, public entry point: normalizes `goal_physical` to a logical
/// goal, clamps/wraps it, and delegates to [`allocate_with_reservation`].
pub fn new_blocks(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode_no: u32,
    alloc: &mut BlockAllocInfo,
    goal_physical: Option<u32>,
    count: u32,
) -> Result<(u32, u32)> {
    let nr_blocks = sb.nr_blocks();
    let goal_logical = goal_physical.map(|g| {
        let logical = g.checked_sub(sb.data_base()).unwrap_or(0);
        if logical >= nr_blocks {
            0
        } else {
            logical
        }
    });
    let (first, actual) = allocate_with_reservation(sb, cache, inode_no, alloc, goal_logical, count)?;
    sb.take_free_blocks(actual);
    trace!(
        "new_blocks: inode={inode_no} goal={goal_physical:?} count={count} -> first={first} actual={actual}"
    );
    Ok((first, actual))
}

/// Spec §4.4.5 `free_blocks`: clears `count` bits starting at logical block
/// `first_physical - data_base`, crossing bitmap boundaries as needed.
pub fn free_blocks(
    sb: &SuperblockManager,
    cache: &BlockCache,
    first_physical: u32,
    count: u32,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let mut remaining = count;
    let mut logical = first_physical - sb.data_base();
    while remaining > 0 {
        let buf_idx = logical / BITS_PER_BUFFER;
        let local = logical % BITS_PER_BUFFER;
        let take = remaining.min(BITS_PER_BUFFER - local);
        let block = cache.read(sb.data_bitmap_base() + buf_idx as u64)?;
        bitmap::clear_bits(cache, &[block], local, take);
        logical += take;
        remaining -= take;
    }
    sb.give_free_blocks(count);
    Ok(())
}

/// Spec §4.4.5 `discard_reservation`: unlinks the window under the tree
/// lock and resets `alloc` to the empty/default state.
pub fn discard_reservation(sb: &SuperblockManager, alloc: &mut BlockAllocInfo) {
    if !alloc.window.is_empty() {
        let mut tree = sb.reservations.lock();
        tree.remove(alloc.window.start);
    }
    *alloc = BlockAllocInfo::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VecBlockDevice;
    use crate::testutil::format_image;
    use std::sync::Arc;

    fn mounted(nr_blocks: u32) -> (BlockCache, SuperblockManager) {
        let dev = Arc::new(VecBlockDevice::new(2048));
        format_image(dev.as_ref(), nr_blocks, crate::TOTAL_INODES).unwrap();
        let cache = BlockCache::new(dev);
        let sb = SuperblockManager::mount(&cache).unwrap();
        (cache, sb)
    }

    #[test]
    fn two_files_get_disjoint_adjacent_windows() {
        let (cache, sb) = mounted(1024);
        let mut a = BlockAllocInfo::new();
        let mut b = BlockAllocInfo::new();
        let (first_a, count_a) = new_blocks(&sb, &cache, 1, &mut a, None, 4).unwrap();
        let (first_b, count_b) = new_blocks(&sb, &cache, 2, &mut b, None, 4).unwrap();
        assert_eq!(count_a, 4);
        assert_eq!(count_b, 4);
        assert_eq!(first_a, sb.data_base());
        assert!(a.window.end < b.window.start);
        assert_eq!(a.window.end + 1, b.window.start);
        assert_eq!(first_b, sb.data_base() + b.window.start);
    }

    #[test]
    fn free_then_reallocate_clears_bits() {
        let (cache, sb) = mounted(64);
        let mut a = BlockAllocInfo::new();
        let (first, count) = new_blocks(&sb, &cache, 1, &mut a, None, 4).unwrap();
        assert_eq!(count, 4);
        let before_free = sb.free_blocks();
        free_blocks(&sb, &cache, first, count).unwrap();
        assert_eq!(sb.free_blocks(), before_free + count);
    }

    #[test]
    fn exhausting_data_region_reports_no_space() {
        let (cache, sb) = mounted(8);
        let mut a = BlockAllocInfo::new();
        let (_, count) = new_blocks(&sb, &cache, 1, &mut a, None, 8).unwrap();
        assert_eq!(count, 8);
        let mut b = BlockAllocInfo::new();
        let err = new_blocks(&sb, &cache, 2, &mut b, None, 1).unwrap_err();
        assert!(matches!(err, Error::NoSpace));
        assert_eq!(sb.free_blocks(), 0);
    }

    #[test]
    fn discard_reservation_unlinks_window() {
        let (cache, sb) = mounted(64);
        let mut a = BlockAllocInfo::new();
        new_blocks(&sb, &cache, 1, &mut a, None, 4).unwrap();
        let start = a.window.start;
        discard_reservation(&sb, &mut a);
        assert!(a.window.is_empty());
        assert!(sb.reservations.lock().search(start).is_none());
    }
}

