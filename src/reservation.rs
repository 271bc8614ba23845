//! Reservation windows and the filesystem-wide reservation tree (spec
//! §4.4.2, §9).
//!
//! The original design keys a red-black tree by window `start`, with each
//! node living inside its owning inode's allocation info and only weakly
//! referenced by the tree. Rust has no portable intrusive-RB-tree idiom and
//! raw pointers into another owner's heap allocation would make the
//! exclusive-ownership invariant unenforceable, so this crate follows the
//! redesign note in spec §9 literally: the tree is a [`std::collections::BTreeMap`]
//! keyed by `start`, and each entry ([`ReservationEntry`]) is a *duplicate*
//! of the window's current `(end, inode_no)` — small, `Copy`, and kept in
//! sync by the allocator every time a window moves. The inode's own
//! [`ReservationWindow`] remains the single owner of the live state; the
//! tree only ever answers "is this range free" queries.

use crate::error::{Error, Result};
use crate::{DEFAULT_WINDOW, MAX_WINDOW};
use log::error;
use std::collections::BTreeMap;

/// A window is empty when `end == EMPTY_SENTINEL` (spec §3).
pub const EMPTY_SENTINEL: u32 = 0;

/// A per-inode sliding window of reserved logical data-block numbers (spec
/// §3's "Block allocation info").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservationWindow {
    pub start: u32,
    pub end: u32,
    pub goal_size: u32,
    pub alloc_hit: u32,
}

impl Default for ReservationWindow {
    fn default() -> Self {
        Self::empty()
    }
}

impl ReservationWindow {
    /// The "not allocated" window: `start == end == 0`.
    pub fn empty() -> Self {
        Self {
            start: 0,
            end: EMPTY_SENTINEL,
            goal_size: DEFAULT_WINDOW,
            alloc_hit: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end == EMPTY_SENTINEL
    }

    /// Number of logical blocks spanned, 0 if empty.
    pub fn len(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Raises `goal_size` to at least `count`, capped at [`MAX_WINDOW`].
    pub fn bump_goal_size(&mut self, count: u32) {
        if self.goal_size < count {
            self.goal_size = count.min(MAX_WINDOW);
        }
    }

    /// Doubles `goal_size`, capped at [`MAX_WINDOW`] — called when the
    /// prior window's hit rate exceeded half (spec §4.4.3).
    pub fn double_goal_size(&mut self) {
        self.goal_size = (self.goal_size.saturating_mul(2)).min(MAX_WINDOW);
    }
}

/// The tree's view of one window: a copy of its extent and owner, kept in
/// sync with the owning inode's [`ReservationWindow`] by the allocator.
#[derive(Clone, Copy, Debug)]
pub struct ReservationEntry {
    pub end: u32,
    pub inode_no: u32,
}

/// The filesystem-wide tree of non-overlapping reservation windows,
/// protected by the superblock's spinlock (spec §5, field
/// `SuperblockManager::reservations`).
#[derive(Default)]
pub struct ReservationTree {
    map: BTreeMap<u32, ReservationEntry>,
}

impl ReservationTree {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Inserts a window at `start`. Fails (and dumps the tree) if it
    /// overlaps a neighbor — spec §4.4.2's `window_add`: "panic-dump on
    /// overlap (indicates a bug or corruption)". A library cannot abort the
    /// host process, so this surfaces as [`Error::Corrupted`] after the
    /// dump instead.
    pub fn insert(&mut self, start: u32, end: u32, inode_no: u32) -> Result<()> {
        if let Some((&pstart, pentry)) = self.map.range(..start).next_back() {
            if pentry.end >= start {
                self.dump();
                return Err(Error::Corrupted(format!(
                    "window [{start},{end}] overlaps predecessor [{pstart},{}]",
                    pentry.end
                )));
            }
        }
        if let Some((&sstart, _)) = self.map.range(start..).next() {
            if sstart <= end {
                self.dump();
                return Err(Error::Corrupted(format!(
                    "window [{start},{end}] overlaps successor starting at {sstart}"
                )));
            }
        }
        self.map.insert(start, ReservationEntry { end, inode_no });
        Ok(())
    }

    /// Unlinks the window rooted at `start`, if any (spec §4.4.2
    /// `window_remove`).
    pub fn remove(&mut self, start: u32) -> Option<ReservationEntry> {
        self.map.remove(&start)
    }

    /// Returns the window containing `goal`, or the window immediately
    /// preceding it, if any (spec §4.4.2 `search_window`). `None` means
    /// `goal` precedes every window currently in the tree.
    pub fn search(&self, goal: u32) -> Option<(u32, ReservationEntry)> {
        self.map.range(..=goal).next_back().map(|(&s, &e)| (s, e))
    }

    /// Finds the first gap of at least `goal_size` logical blocks starting
    /// at or after `search_from`, bounded by `[start_block, end_block)`;
    /// wraps and retries the prefix `[start_block, search_from)` on failure
    /// (spec §4.4.2 `find_next_reservable`). `exclude_start` skips the
    /// window being re-placed so it doesn't collide with itself.
    pub fn find_next_reservable(
        &self,
        search_from: u32,
        goal_size: u32,
        start_block: u32,
        end_block: u32,
        exclude_start: Option<u32>,
    ) -> Option<(u32, u32)> {
        let from = search_from.max(start_block);
        if let Some(r) = self.first_gap_from(from, goal_size, end_block, exclude_start) {
            return Some(r);
        }
        if from > start_block {
            return self.first_gap_from(start_block, goal_size, from, exclude_start);
        }
        None
    }

    fn first_gap_from(
        &self,
        mut cursor: u32,
        goal_size: u32,
        limit: u32,
        exclude_start: Option<u32>,
    ) -> Option<(u32, u32)> {
        if cursor >= limit {
            return None;
        }
        for (&start, entry) in self.map.range(cursor..limit) {
            if Some(start) == exclude_start {
                continue;
            }
            if start > cursor && start - cursor >= goal_size {
                let win_end = (cursor + goal_size - 1).min(limit - 1);
                return Some((cursor, win_end));
            }
            if start >= cursor {
                cursor = entry.end.saturating_add(1).max(cursor);
            }
            if cursor >= limit {
                return None;
            }
        }
        if limit - cursor >= 1 {
            let size = goal_size.min(limit - cursor);
            return Some((cursor, cursor + size - 1));
        }
        None
    }

    /// The start of the window immediately following `after`, if any —
    /// used by `try_to_extend` to bound how far a window's tail may grow.
    pub fn successor_start(&self, after: u32) -> Option<u32> {
        self.map.range(after.saturating_add(1)..).next().map(|(&s, _)| s)
    }

    /// Logs every window in the tree at error level, for the corruption
    /// path (`original_source/balloc.c`'s `rsv_window_dump`, spec §9
    /// supplement).
    pub fn dump(&self) {
        error!("reservation tree dump ({} windows):", self.map.len());
        for (start, entry) in &self.map {
            error!("  [{start}, {}] owned by inode {}", entry.end, entry.inode_no);
        }
    }
}
