//! The indexed block map (spec §4.5): translates a file's logical block
//! index into a physical block number through up to four hops, allocating
//! missing index and data blocks on write and releasing whole sub-trees on
//! truncation.
//!
//! Functions here take an inode's block-index array and allocation info by
//! reference rather than an `Inode` handle, so this module has no
//! dependency on [`crate::inode`] — the inode store builds on top of this,
//! not the other way around.

use crate::alloc::{self, BlockAllocInfo};
use crate::block::{BlockCache, BlockRef};
use crate::error::{Error, Result};
use crate::superblock::SuperblockManager;
use crate::{max_logical_blocks, BS, D, IND1, IND2, IND3, N, P};

/// A resolved (logical block -> index-chain) address (spec §4.5.1).
#[derive(Clone, Copy, Debug)]
pub struct Addr {
    pub depth: usize,
    pub offsets: [usize; 4],
    /// Distance from this slot to the last slot of its leaf block —
    /// `D - 1 - b` for direct blocks, `P - 1 - leaf_index` otherwise.
    pub boundary: usize,
}

/// Resolves logical block `b` to a chain depth and offset path (spec
/// §4.5.1). Returns `None` if `b` exceeds the addressable range.
pub fn address(b: u64) -> Option<Addr> {
    let p = P as u64;
    if b < D as u64 {
        return Some(Addr {
            depth: 1,
            offsets: [b as usize, 0, 0, 0],
            boundary: (D as u64 - 1 - b) as usize,
        });
    }
    let b1 = b - D as u64;
    if b1 < p {
        return Some(Addr {
            depth: 2,
            offsets: [IND1, b1 as usize, 0, 0],
            boundary: (p - 1 - b1) as usize,
        });
    }
    let b2 = b1 - p;
    if b2 < p * p {
        let i1 = (b2 / p) as usize;
        let i2 = (b2 % p) as usize;
        return Some(Addr {
            depth: 3,
            offsets: [IND2, i1, i2, 0],
            boundary: P - 1 - i2,
        });
    }
    let b3 = b2 - p * p;
    if b3 < p * p * p {
        let i1 = (b3 / (p * p)) as usize;
        let i2 = ((b3 / p) % p) as usize;
        let i3 = (b3 % p) as usize;
        return Some(Addr {
            depth: 4,
            offsets: [IND3, i1, i2, i3],
            boundary: P - 1 - i3,
        });
    }
    None
}

/// Result of descending an index chain (spec §4.5.2).
pub struct Branch {
    pub complete: bool,
    pub physical: u32,
    /// Chain position (0 = the inode's own slot) at which a zero pointer
    /// was found. Meaningless when `complete`.
    pub missing_from: usize,
    /// The block containing the missing slot, or `None` when the missing
    /// slot is the inode's own direct/indirect-root array.
    pub parent_block: Option<BlockRef>,
}

/// Descends the chain described by `addr`, reading each indirect block via
/// the block cache (spec §4.5.2 `get_branch`).
pub fn get_branch(cache: &BlockCache, blocks: &[u32; N], addr: &Addr) -> Result<Branch> {
    let top = blocks[addr.offsets[0]];
    if addr.depth == 1 {
        return Ok(Branch {
            complete: top != 0,
            physical: top,
            missing_from: 0,
            parent_block: None,
        });
    }
    if top == 0 {
        return Ok(Branch {
            complete: false,
            physical: 0,
            missing_from: 0,
            parent_block: None,
        });
    }
    let mut cur = cache.read(top as u64)?;
    for level in 1..addr.depth {
        let off = addr.offsets[level];
        let child: u32 = cur.read_struct(off * 4);
        if child == 0 {
            return Ok(Branch {
                complete: false,
                physical: 0,
                missing_from: level,
                parent_block: Some(cur),
            });
        }
        if level == addr.depth - 1 {
            return Ok(Branch {
                complete: true,
                physical: child,
                missing_from: 0,
                parent_block: None,
            });
        }
        cur = cache.read(child as u64)?;
    }
    unreachable!("loop always returns by depth - 1")
}

fn goal_hint(
    balloc: &BlockAllocInfo,
    b: u64,
    branch: &Branch,
    addr: &Addr,
    sb: &SuperblockManager,
) -> u32 {
    if b > 0 {
        if let (Some(ll), Some(lp)) = (balloc.last_alloc_logical, balloc.last_alloc_physical) {
            if ll as u64 == b - 1 {
                return lp + 1;
            }
        }
    }
    if let Some(parent) = &branch.parent_block {
        let idx = addr.offsets[branch.missing_from];
        for i in (0..idx).rev() {
            let v: u32 = parent.read_struct(i * 4);
            if v != 0 {
                return v + (idx - i) as u32;
            }
        }
        return parent.index() as u32;
    }
    sb.data_base()
}

fn allocate_chain(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode_no: u32,
    balloc: &mut BlockAllocInfo,
    goal: u32,
    indirect_needed: usize,
    data_needed: u32,
) -> Result<(Vec<u32>, u32, u32)> {
    let mut indirect_phys = Vec::with_capacity(indirect_needed);
    let mut goal_cursor = Some(goal);

    for _ in 0..indirect_needed {
        match alloc::new_blocks(sb, cache, inode_no, balloc, goal_cursor, 1) {
            Ok((first, _)) => {
                indirect_phys.push(first);
                goal_cursor = Some(first + 1);
            }
            Err(e) => {
                for &p in &indirect_phys {
                    let _ = alloc::free_blocks(sb, cache, p, 1);
                }
                return Err(e);
            }
        }
    }

    match alloc::new_blocks(sb, cache, inode_no, balloc, goal_cursor, data_needed) {
        Ok((first, count)) => Ok((indirect_phys, first, count)),
        Err(e) => {
            for &p in &indirect_phys {
                let _ = alloc::free_blocks(sb, cache, p, 1);
            }
            Err(e)
        }
    }
}

fn splice(
    cache: &BlockCache,
    blocks: &mut [u32; N],
    addr: &Addr,
    branch: &Branch,
    indirect_phys: &[u32],
    data_first: u32,
    data_count: u32,
) -> Result<()> {
    let mut prev_block: Option<BlockRef> = branch.parent_block.clone();

    for (i, &phys) in indirect_phys.iter().enumerate() {
        let level = branch.missing_from + i;
        let new_block = cache.get_or_create(phys as u64)?;
        new_block.zero();
        if i + 1 == indirect_phys.len() {
            for k in 0..data_count {
                new_block.write_struct(
                    (addr.offsets[addr.depth - 1] + k as usize) * 4,
                    &(data_first + k),
                );
            }
        }
        cache.mark_dirty(&new_block);

        match &prev_block {
            Some(parent) => {
                parent.write_struct(addr.offsets[level] * 4, &phys);
                cache.mark_dirty(parent);
            }
            None => blocks[addr.offsets[level]] = phys,
        }
        prev_block = Some(new_block);
    }

    if indirect_phys.is_empty() {
        match &branch.parent_block {
            Some(parent) => {
                for k in 0..data_count {
                    parent.write_struct(
                        (addr.offsets[addr.depth - 1] + k as usize) * 4,
                        &(data_first + k),
                    );
                }
                cache.mark_dirty(parent);
            }
            None => blocks[addr.offsets[0]] = data_first,
        }
    }
    Ok(())
}

/// What [`get_blocks`] resolved logical block `b` to.
pub enum Mapped {
    /// `b` (and the following `count - 1` logical blocks) map to a
    /// contiguous physical run starting at `physical`.
    Block { physical: u32, count: u32 },
    /// `b` is unmapped and `create` was false.
    Hole,
}

/// Spec §4.5.3 `get_blocks(inode, b, max, create)`.
#[allow(clippy::too_many_arguments)]
pub fn get_blocks(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode_no: u32,
    blocks: &mut [u32; N],
    blocknum: &mut u32,
    balloc: &mut BlockAllocInfo,
    b: u64,
    max: u32,
    create: bool,
) -> Result<Mapped> {
    let addr =
        address(b).ok_or_else(|| Error::Corrupted(format!("logical block {b} out of range")))?;
    let branch = get_branch(cache, blocks, &addr)?;

    if branch.complete {
        let mut count = 1u32;
        if addr.depth > 1 {
            if let Some(parent) = &branch.parent_block {
                let leaf_idx = addr.offsets[addr.depth - 1];
                let room = (addr.boundary as u32).min(max.saturating_sub(1));
                let mut next = branch.physical + 1;
                while count <= room {
                    let slot = leaf_idx + count as usize;
                    if slot >= P {
                        break;
                    }
                    let v: u32 = parent.read_struct(slot * 4);
                    if v != next {
                        break;
                    }
                    count += 1;
                    next += 1;
                }
            }
        }
        return Ok(Mapped::Block {
            physical: branch.physical,
            count,
        });
    }

    if !create {
        return Ok(Mapped::Hole);
    }

    let goal = goal_hint(balloc, b, &branch, &addr, sb);
    let indirect_needed = addr.depth - branch.missing_from - 1;
    let data_needed = max.min(addr.boundary as u32 + 1).max(1);

    let (indirect_phys, data_first, data_count) =
        allocate_chain(sb, cache, inode_no, balloc, goal, indirect_needed, data_needed)?;

    if let Err(e) = splice(cache, blocks, &addr, &branch, &indirect_phys, data_first, data_count) {
        for &p in &indirect_phys {
            let _ = alloc::free_blocks(sb, cache, p, 1);
        }
        let _ = alloc::free_blocks(sb, cache, data_first, data_count);
        return Err(e);
    }

    *blocknum += indirect_phys.len() as u32 + data_count;
    balloc.last_alloc_logical = Some(b as u32 + data_count - 1);
    balloc.last_alloc_physical = Some(data_first + data_count - 1);

    Ok(Mapped::Block {
        physical: data_first,
        count: data_count,
    })
}

fn free_subtree_all(
    cache: &BlockCache,
    sb: &SuperblockManager,
    block_no: u32,
    level: usize,
    freed: &mut u32,
) -> Result<()> {
    if block_no == 0 {
        return Ok(());
    }
    let block = cache.read(block_no as u64)?;
    for idx in 0..P {
        let child: u32 = block.read_struct(idx * 4);
        if child == 0 {
            continue;
        }
        if level == 1 {
            alloc::free_blocks(sb, cache, child, 1)?;
            *freed += 1;
        } else {
            free_subtree_all(cache, sb, child, level - 1, freed)?;
        }
    }
    alloc::free_blocks(sb, cache, block_no, 1)?;
    *freed += 1;
    Ok(())
}

fn free_whole(
    cache: &BlockCache,
    sb: &SuperblockManager,
    slot: &mut u32,
    level: usize,
    freed: &mut u32,
) -> Result<()> {
    if *slot != 0 {
        free_subtree_all(cache, sb, *slot, level, freed)?;
        *slot = 0;
    }
    Ok(())
}

/// Frees everything in `*slot`'s subtree from `keep_path[0]` onward:
/// siblings strictly after it are freed wholesale, the child at
/// `keep_path[0]` is kept but recursed into with `keep_path[1..]` (spec
/// §4.5.4's recursive `free_branches`, applied at the truncation
/// boundary).
///
/// When `keep_path[0] == 0` nothing in this subtree survives at all, so the
/// block rooted at `*slot` is freed wholesale (itself included) and `*slot`
/// is zeroed — without this, a truncation landing exactly on an index
/// block's first slot would free every data block it points to but leave
/// the now-empty index block itself permanently allocated and still linked
/// from its parent.
fn free_partial(
    cache: &BlockCache,
    sb: &SuperblockManager,
    slot: &mut u32,
    level: usize,
    keep_path: &[usize],
    freed: &mut u32,
) -> Result<()> {
    let block_no = *slot;
    if block_no == 0 {
        return Ok(());
    }
    let at = keep_path[0];
    if at == 0 {
        free_subtree_all(cache, sb, block_no, level, freed)?;
        *slot = 0;
        return Ok(());
    }

    let block = cache.read(block_no as u64)?;
    if level == 1 {
        for idx in at..P {
            let child: u32 = block.read_struct(idx * 4);
            if child != 0 {
                alloc::free_blocks(sb, cache, child, 1)?;
                *freed += 1;
                block.write_struct(idx * 4, &0u32);
            }
        }
    } else {
        for idx in (at + 1)..P {
            let child: u32 = block.read_struct(idx * 4);
            if child != 0 {
                free_subtree_all(cache, sb, child, level - 1, freed)?;
                block.write_struct(idx * 4, &0u32);
            }
        }
        let mut child_at: u32 = block.read_struct(at * 4);
        if child_at != 0 {
            free_partial(cache, sb, &mut child_at, level - 1, &keep_path[1..], freed)?;
            block.write_struct(at * 4, &child_at);
        }
    }
    cache.mark_dirty(&block);
    Ok(())
}

fn truncate_from(
    cache: &BlockCache,
    sb: &SuperblockManager,
    blocks: &mut [u32; N],
    path: &Addr,
    freed: &mut u32,
) -> Result<()> {
    match path.depth {
        1 => {
            for slot in path.offsets[0]..D {
                let phys = blocks[slot];
                if phys != 0 {
                    alloc::free_blocks(sb, cache, phys, 1)?;
                    *freed += 1;
                    blocks[slot] = 0;
                }
            }
            free_whole(cache, sb, &mut blocks[IND1], 1, freed)?;
            free_whole(cache, sb, &mut blocks[IND2], 2, freed)?;
            free_whole(cache, sb, &mut blocks[IND3], 3, freed)?;
        }
        2 => {
            free_partial(cache, sb, &mut blocks[IND1], 1, &path.offsets[1..2], freed)?;
            free_whole(cache, sb, &mut blocks[IND2], 2, freed)?;
            free_whole(cache, sb, &mut blocks[IND3], 3, freed)?;
        }
        3 => {
            free_partial(cache, sb, &mut blocks[IND2], 2, &path.offsets[1..3], freed)?;
            free_whole(cache, sb, &mut blocks[IND3], 3, freed)?;
        }
        4 => {
            free_partial(cache, sb, &mut blocks[IND3], 3, &path.offsets[1..4], freed)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Spec §4.5.4 `truncate_blocks(inode, offset)`.
pub fn truncate_blocks(
    sb: &SuperblockManager,
    cache: &BlockCache,
    blocks: &mut [u32; N],
    blocknum: &mut u32,
    balloc: &mut BlockAllocInfo,
    offset: u64,
) -> Result<()> {
    let ib = (offset + BS as u64 - 1) / BS as u64;
    let mut freed = 0u32;

    if ib < max_logical_blocks() {
        let path = address(ib).expect("ib checked against max_logical_blocks above");
        truncate_from(cache, sb, blocks, &path, &mut freed)?;
    }

    *blocknum = blocknum.saturating_sub(freed);
    alloc::discard_reservation(sb, balloc);
    Ok(())
}
