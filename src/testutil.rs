//! Test-only scaffolding: an image-formatting helper and the in-memory
//! device it writes against, used by this crate's own unit tests and by the
//! `tests/` integration suite. Not a mkfs API — a host filesystem tool
//! builds images its own way; this one just needs *a* valid image to mount.

use crate::bitmap::BITS_PER_BUFFER;
use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::dirent::DirRecord;
use crate::error::Result;
use crate::inode::{RawInode, S_IFDIR};
use crate::superblock::RawSuperblock;
use crate::{DREC, FT_DIR, INODE_TABLE_BLOCKS, MAGIC};
use bytemuck::Zeroable;

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Writes a fresh, valid image of `nr_blocks` data blocks and `nr_inodes`
/// inodes directly to `dev`, bypassing the block cache (there's nothing to
/// cache yet). Sets up the root directory as inode 0 with `.` and `..`
/// both pointing at itself.
pub fn format_image(dev: &dyn BlockDevice, nr_blocks: u32, nr_inodes: u32) -> Result<()> {
    let nr_ifree_blocks = ceil_div(nr_inodes, BITS_PER_BUFFER);
    let nr_bfree_blocks = ceil_div(nr_blocks, BITS_PER_BUFFER);
    let nr_istore_blocks = INODE_TABLE_BLOCKS as u32;
    let data_base = 1 + nr_ifree_blocks + nr_istore_blocks + nr_bfree_blocks;
    let last_bitmap_bits = if nr_blocks % BITS_PER_BUFFER == 0 {
        BITS_PER_BUFFER
    } else {
        nr_blocks % BITS_PER_BUFFER
    };

    let zero = [0u8; BLOCK_SIZE];

    // Inode bitmap: bit 0 (root) set, everything else clear.
    for idx in 0..nr_ifree_blocks {
        let mut bytes = zero;
        if idx == 0 {
            bytes[0] |= 1;
        }
        dev.write_block(1 + idx as u64, &bytes)?;
    }

    // Inode table, zeroed except for the root inode's record, filled in
    // after the root's data block is known.
    for idx in 0..nr_istore_blocks {
        dev.write_block(1 + nr_ifree_blocks as u64 + idx as u64, &zero)?;
    }

    // Data bitmap: all clear except the trailing padding bits of the last
    // buffer, which must read as "allocated" (spec §3/§8).
    let dbitmap_base = 1 + nr_ifree_blocks as u64 + nr_istore_blocks as u64;
    for idx in 0..nr_bfree_blocks {
        let mut bytes = zero;
        if idx + 1 == nr_bfree_blocks && last_bitmap_bits < BITS_PER_BUFFER {
            for bit in last_bitmap_bits..BITS_PER_BUFFER {
                bytes[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        // Root's single data block, logical 0, is claimed up front.
        if idx == 0 {
            bytes[0] |= 1;
        }
        dev.write_block(dbitmap_base + idx as u64, &bytes)?;
    }

    // Root directory's single data block: "." and ".." both pointing at
    // inode 0.
    let mut root_data = zero;
    write_dirent(&mut root_data, 0, 0, b".", FT_DIR);
    write_dirent(&mut root_data, 1, 0, b"..", FT_DIR);
    dev.write_block(data_base as u64, &root_data)?;

    // Root inode record, inode table slot 0.
    let root_inode = RawInode {
        i_size: BLOCK_SIZE as u64,
        i_ctime: 0,
        i_atime: 0,
        i_mtime: 0,
        i_blocknum: 1,
        i_blocks: {
            let mut b = [0u32; 15];
            b[0] = data_base;
            b
        },
        i_mode: S_IFDIR | 0o755,
        i_uid: 0,
        i_gid: 0,
        i_nlink: 2,
        i_subdir_num: 0,
        _padding: [0u8; 34],
    };
    let mut table_block0 = zero;
    let bytes = bytemuck::bytes_of(&root_inode);
    table_block0[..bytes.len()].copy_from_slice(bytes);
    dev.write_block(1 + nr_ifree_blocks as u64, &table_block0)?;

    // Superblock, block 0.
    let sb = RawSuperblock {
        magic: MAGIC,
        nr_blocks,
        nr_inodes,
        nr_istore_blocks,
        nr_dstore_blocks: data_base,
        nr_ifree_blocks,
        nr_bfree_blocks,
        nr_free_inodes: nr_inodes - 1,
        nr_free_blocks: nr_blocks - 1,
        last_bitmap_bits,
    };
    let mut block0 = zero;
    let bytes = bytemuck::bytes_of(&sb);
    block0[..bytes.len()].copy_from_slice(bytes);
    dev.write_block(0, &block0)?;

    Ok(())
}

fn write_dirent(block: &mut [u8; BLOCK_SIZE], slot: usize, inode_no: u32, name: &[u8], ft: u8) {
    let mut rec = DirRecord::zeroed();
    rec.inode_no = inode_no;
    rec.name[..name.len()].copy_from_slice(name);
    rec.name_len = name.len() as u8;
    rec.file_type = ft;
    let bytes = bytemuck::bytes_of(&rec);
    let off = slot * DREC;
    block[off..off + bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockCache, VecBlockDevice};
    use crate::superblock::SuperblockManager;
    use std::sync::Arc;

    #[test]
    fn formats_a_mountable_image() {
        let dev = Arc::new(VecBlockDevice::new(2048));
        format_image(dev.as_ref(), 1024, crate::TOTAL_INODES).unwrap();
        let cache = BlockCache::new(dev);
        let sb = SuperblockManager::mount(&cache).unwrap();
        assert_eq!(sb.nr_blocks(), 1024);
        assert_eq!(sb.free_inodes(), crate::TOTAL_INODES - 1);
        assert_eq!(sb.free_blocks(), 1023);
    }
}
