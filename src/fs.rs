//! The mounted filesystem (spec §1, §4.3's rename algorithm): the object a
//! host's VFS layer actually drives. Ties the block cache, superblock
//! manager, and inode store together and implements the file-level
//! operations spec §1 lists (create/read/write/truncate/unlink, mkdir/
//! rmdir, symlink/hardlink, rename, directory iteration) on top of the
//! indexed block map and directory engine.

use crate::block::{BlockCache, BlockDevice};
use crate::config::MountOptions;
use crate::dirent;
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeStore, Kind, S_IFDIR, S_IFLNK, S_IFREG};
use crate::map::Mapped;
use crate::superblock::SuperblockManager;
use crate::{BS, FT_DIR, FT_REG, ROOT_INO};
use log::debug;
use std::sync::{Arc, RwLock};

/// A mounted filesystem instance (spec §9: "per-filesystem-instance, not
/// global" state).
pub struct Filesystem {
    cache: Arc<BlockCache>,
    sb: SuperblockManager,
    inodes: InodeStore,
    opts: MountOptions,
}

fn file_type_of(kind: Kind) -> u8 {
    match kind {
        Kind::Directory => FT_DIR,
        _ => FT_REG,
    }
}

impl Filesystem {
    /// Mounts `dev` (spec §4.2's validation runs here).
    pub fn mount(dev: Arc<dyn BlockDevice>, opts: MountOptions) -> Result<Self> {
        let cache = Arc::new(BlockCache::new(dev));
        let sb = SuperblockManager::mount(&cache)?;
        let inodes = InodeStore::new(cache.clone(), &sb);
        debug!(
            "filesystem mounted: {} blocks, {} inodes, read_only={}",
            sb.nr_blocks(),
            sb.nr_inodes(),
            opts.read_only
        );
        Ok(Self {
            cache,
            sb,
            inodes,
            opts,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.opts.read_only
    }

    pub fn max_file_size(&self) -> u64 {
        self.sb.max_file_size()
    }

    /// Free data blocks remaining (spec §8's countable invariants).
    pub fn free_blocks(&self) -> u32 {
        self.sb.free_blocks()
    }

    /// Free inodes remaining.
    pub fn free_inodes(&self) -> u32 {
        self.sb.free_inodes()
    }

    /// Flushes the superblock and every dirty buffer to the device.
    pub fn sync(&self) -> Result<()> {
        self.sb.sync(&self.cache)?;
        self.cache.sync_all()
    }

    fn dir_handle(&self, ino: u32) -> Result<Arc<RwLock<Inode>>> {
        let h = self.inodes.get(ino)?;
        if h.read().unwrap().kind != Kind::Directory {
            return Err(Error::NotFound);
        }
        Ok(h)
    }

    /// Resolves `name` inside directory `dir_ino` (spec §4.6 `find_entry`).
    pub fn lookup(&self, dir_ino: u32, name: &[u8]) -> Result<u32> {
        let dir = self.dir_handle(dir_ino)?;
        let mut dir = dir.write().unwrap();
        dirent::find_entry(&self.sb, &self.cache, &mut dir, name).map(|(ino, _)| ino)
    }

    /// Creates a regular file named `name` in `dir_ino` (spec §4.3
    /// `new_inode` + §4.6 `add_entry`).
    pub fn create(&self, dir_ino: u32, name: &[u8], mode: u16) -> Result<u32> {
        let dir = self.dir_handle(dir_ino)?;
        let handle = {
            let parent = dir.read().unwrap();
            self.inodes.new_inode(&self.sb, &parent, S_IFREG | (mode & 0o7777))?
        };
        let ino = {
            let mut inode = handle.write().unwrap();
            inode.nlink = 1;
            inode.ino
        };
        let mut dir = dir.write().unwrap();
        if let Err(e) = dirent::add_entry(&self.sb, &self.cache, &mut dir, ino, name, FT_REG) {
            drop(dir);
            self.inodes.free(&self.sb, &handle)?;
            return Err(e);
        }
        self.inodes.write(&handle, false)?;
        Ok(ino)
    }

    /// Creates a directory named `name` in `dir_ino` (spec §4.6
    /// `make_empty`; bumps `dir_ino`'s link count for the new `..`).
    pub fn mkdir(&self, dir_ino: u32, name: &[u8], mode: u16) -> Result<u32> {
        let dir = self.dir_handle(dir_ino)?;
        let handle = {
            let parent = dir.read().unwrap();
            self.inodes.new_inode(&self.sb, &parent, S_IFDIR | (mode & 0o7777))?
        };
        let ino = {
            let mut inode = handle.write().unwrap();
            dirent::make_empty(&self.sb, &self.cache, &mut inode, dir_ino)?;
            inode.ino
        };
        let mut dir = dir.write().unwrap();
        if let Err(e) = dirent::add_entry(&self.sb, &self.cache, &mut dir, ino, name, FT_DIR) {
            drop(dir);
            self.inodes.free(&self.sb, &handle)?;
            return Err(e);
        }
        dir.nlink += 1;
        drop(dir);
        self.inodes.write(&handle, false)?;
        Ok(ino)
    }

    /// Creates a symbolic link whose target path is `target` (spec §1;
    /// recorded as `FT_REG` per §4.6, distinguished by the inode's mode).
    pub fn symlink(&self, dir_ino: u32, name: &[u8], target: &[u8]) -> Result<u32> {
        let dir = self.dir_handle(dir_ino)?;
        let handle = {
            let parent = dir.read().unwrap();
            self.inodes.new_inode(&self.sb, &parent, S_IFLNK | 0o777)?
        };
        let ino = {
            let mut inode = handle.write().unwrap();
            inode.nlink = 1;
            write_inode_data(&self.sb, &self.cache, &mut inode, 0, target)?;
            inode.ino
        };
        let mut dir = dir.write().unwrap();
        if let Err(e) = dirent::add_entry(&self.sb, &self.cache, &mut dir, ino, name, FT_REG) {
            drop(dir);
            self.inodes.free(&self.sb, &handle)?;
            return Err(e);
        }
        self.inodes.write(&handle, false)?;
        Ok(ino)
    }

    /// Reads a symlink's target path.
    pub fn readlink(&self, ino: u32) -> Result<Vec<u8>> {
        let handle = self.inodes.get(ino)?;
        let mut inode = handle.write().unwrap();
        if inode.kind != Kind::Symlink {
            return Err(Error::NotFound);
        }
        let len = inode.size as usize;
        let mut buf = vec![0u8; len];
        read_inode_data(&self.sb, &self.cache, &mut inode, 0, &mut buf)?;
        Ok(buf)
    }

    /// Adds another name for an existing inode (hardlink). Directories
    /// cannot be hardlinked, matching standard UNIX restriction.
    pub fn link(&self, dir_ino: u32, name: &[u8], target_ino: u32) -> Result<()> {
        let dir = self.dir_handle(dir_ino)?;
        let target = self.inodes.get(target_ino)?;
        let mut target = target.write().unwrap();
        if target.kind == Kind::Directory {
            return Err(Error::Exists);
        }
        let mut dir = dir.write().unwrap();
        dirent::add_entry(
            &self.sb,
            &self.cache,
            &mut dir,
            target_ino,
            name,
            file_type_of(target.kind),
        )?;
        target.nlink += 1;
        target.dirty = true;
        Ok(())
    }

    /// Removes a non-directory entry; frees the inode once its link count
    /// reaches zero (spec §4.3 `evict`).
    pub fn unlink(&self, dir_ino: u32, name: &[u8]) -> Result<()> {
        let dir = self.dir_handle(dir_ino)?;
        let mut dir = dir.write().unwrap();
        let (target_ino, _) = dirent::find_entry(&self.sb, &self.cache, &mut dir, name)?;
        let target = self.inodes.get(target_ino)?;
        if target.read().unwrap().kind == Kind::Directory {
            return Err(Error::Exists);
        }
        dirent::delete_entry(&self.sb, &self.cache, &mut dir, name)?;
        self.drop_link(&target)
    }

    /// Removes an empty subdirectory (spec §8 invariant: rmdir on a
    /// non-empty directory fails with `NOT_EMPTY`).
    pub fn rmdir(&self, dir_ino: u32, name: &[u8]) -> Result<()> {
        let dir = self.dir_handle(dir_ino)?;
        let mut dir = dir.write().unwrap();
        let (target_ino, _) = dirent::find_entry(&self.sb, &self.cache, &mut dir, name)?;
        let target = self.inodes.get(target_ino)?;
        {
            let mut target_w = target.write().unwrap();
            if target_w.kind != Kind::Directory {
                return Err(Error::NotFound);
            }
            if !dirent::empty_dir(&self.sb, &self.cache, &mut target_w)? {
                return Err(Error::NotEmpty);
            }
        }
        dirent::delete_entry(&self.sb, &self.cache, &mut dir, name)?;
        dir.nlink -= 1;
        dir.dirty = true;
        self.inodes.free(&self.sb, &target)
    }

    fn drop_link(&self, handle: &Arc<RwLock<Inode>>) -> Result<()> {
        self.drop_links(handle, 1)
    }

    /// Drops `n` links at once and frees the inode if that brings it to
    /// zero. Used instead of calling [`Self::drop_link`] `n` times so an
    /// inode that reaches zero mid-sequence isn't handed to
    /// [`InodeStore::free`] more than once (which would double-decrement
    /// the free-inode counter).
    fn drop_links(&self, handle: &Arc<RwLock<Inode>>, n: u16) -> Result<()> {
        let nlink = {
            let mut inode = handle.write().unwrap();
            inode.nlink = inode.nlink.saturating_sub(n);
            inode.dirty = true;
            inode.nlink
        };
        if nlink == 0 {
            self.inodes.free(&self.sb, handle)
        } else {
            self.inodes.write(handle, false)
        }
    }

    /// Moves/renames `(old_dir, old_name)` to `(new_dir, new_name)` (spec
    /// §4.6 "Rename"). Not atomic across the add/delete pair — the same
    /// crash-consistency boundary the design calls out.
    pub fn rename(
        &self,
        old_dir_ino: u32,
        old_name: &[u8],
        new_dir_ino: u32,
        new_name: &[u8],
    ) -> Result<()> {
        let old_dir = self.dir_handle(old_dir_ino)?;
        let new_dir = self.dir_handle(new_dir_ino)?;

        let moved_ino = {
            let mut old = old_dir.write().unwrap();
            dirent::find_entry(&self.sb, &self.cache, &mut old, old_name)?.0
        };
        let moved = self.inodes.get(moved_ino)?;
        let moved_is_dir = moved.read().unwrap().kind == Kind::Directory;
        let moved_ft = file_type_of(moved.read().unwrap().kind);

        let existing = {
            let mut new = new_dir.write().unwrap();
            dirent::find_entry(&self.sb, &self.cache, &mut new, new_name).ok()
        };

        if let Some((prev_ino, _)) = existing {
            if prev_ino == moved_ino {
                return Ok(());
            }
            let prev = self.inodes.get(prev_ino)?;
            let prev_is_dir = prev.read().unwrap().kind == Kind::Directory;
            if prev_is_dir != moved_is_dir {
                return Err(Error::Exists);
            }
            if prev_is_dir {
                let mut prev_w = prev.write().unwrap();
                if !dirent::empty_dir(&self.sb, &self.cache, &mut prev_w)? {
                    return Err(Error::NotEmpty);
                }
            }
            {
                let mut new = new_dir.write().unwrap();
                dirent::set_link(&self.sb, &self.cache, &mut new, new_name, moved_ino, moved_ft)?;
            }
            // A plain file loses one link (its name in `new_dir`); an
            // overwritten (necessarily empty) directory loses both its own
            // entry-link and the "." self-link that made up its nlink == 2.
            self.drop_links(&prev, if moved_is_dir { 2 } else { 1 })?;
        } else {
            let mut new = new_dir.write().unwrap();
            dirent::add_entry(&self.sb, &self.cache, &mut new, moved_ino, new_name, moved_ft)?;
            if moved_is_dir {
                new.nlink += 1;
                new.dirty = true;
            }
        }

        {
            let mut old = old_dir.write().unwrap();
            dirent::delete_entry(&self.sb, &self.cache, &mut old, old_name)?;
        }

        if moved_is_dir && old_dir_ino != new_dir_ino {
            let mut moved_w = moved.write().unwrap();
            dirent::set_link(&self.sb, &self.cache, &mut moved_w, b"..", new_dir_ino, FT_DIR)?;
            drop(moved_w);
            let mut old = old_dir.write().unwrap();
            old.nlink -= 1;
            old.dirty = true;
        }
        Ok(())
    }

    /// Calls `f(name, ino, file_type)` for every live entry of `dir_ino`.
    pub fn iterate_dir(&self, dir_ino: u32, f: impl FnMut(&[u8], u32, u8)) -> Result<()> {
        let dir = self.dir_handle(dir_ino)?;
        let mut dir = dir.write().unwrap();
        dirent::iterate(&self.sb, &self.cache, &mut dir, f)
    }

    /// Reads up to `buf.len()` bytes from `ino` starting at `offset`,
    /// returning the number of bytes actually read (short on EOF).
    pub fn read(&self, ino: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let handle = self.inodes.get(ino)?;
        let mut inode = handle.write().unwrap();
        read_inode_data(&self.sb, &self.cache, &mut inode, offset, buf)
    }

    /// Writes `buf` to `ino` starting at `offset`, extending `size` and
    /// allocating blocks as needed.
    pub fn write(&self, ino: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        let handle = self.inodes.get(ino)?;
        let mut inode = handle.write().unwrap();
        let n = write_inode_data(&self.sb, &self.cache, &mut inode, offset, buf)?;
        drop(inode);
        self.inodes.write(&handle, false)?;
        Ok(n)
    }

    /// Truncates `ino` to `new_size` (spec §4.5.4).
    pub fn truncate(&self, ino: u32, new_size: u64) -> Result<()> {
        let handle = self.inodes.get(ino)?;
        {
            let mut inode = handle.write().unwrap();
            inode.truncate(&self.sb, &self.cache, new_size)?;
        }
        self.inodes.write(&handle, false)
    }
}

fn read_inode_data(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode: &mut Inode,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    if offset >= inode.size {
        return Ok(0);
    }
    let want = buf.len().min((inode.size - offset) as usize);
    let mut done = 0usize;
    while done < want {
        let pos = offset + done as u64;
        let b = pos / BS as u64;
        let in_block = (pos % BS as u64) as usize;
        let chunk = (BS - in_block).min(want - done);
        match inode.get_blocks(sb, cache, b, 1, false)? {
            Mapped::Block { physical, .. } => {
                let block = cache.read(physical as u64)?;
                for i in 0..chunk {
                    buf[done + i] = block.byte(in_block + i);
                }
            }
            Mapped::Hole => {
                buf[done..done + chunk].fill(0);
            }
        }
        done += chunk;
    }
    Ok(done)
}

fn write_inode_data(
    sb: &SuperblockManager,
    cache: &BlockCache,
    inode: &mut Inode,
    offset: u64,
    buf: &[u8],
) -> Result<usize> {
    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset + done as u64;
        let b = pos / BS as u64;
        let in_block = (pos % BS as u64) as usize;
        let chunk = (BS - in_block).min(buf.len() - done);
        let physical = match inode.get_blocks(sb, cache, b, 1, true)? {
            Mapped::Block { physical, .. } => physical,
            Mapped::Hole => unreachable!("create=true never returns a hole"),
        };
        let block = if in_block == 0 && chunk == BS {
            cache.get_or_create(physical as u64)?
        } else {
            cache.read(physical as u64)?
        };
        for i in 0..chunk {
            block.set_byte(in_block + i, buf[done + i]);
        }
        cache.mark_dirty(&block);
        done += chunk;
    }
    let end = offset + done as u64;
    if end > inode.size {
        inode.size = end;
    }
    inode.dirty = true;
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VecBlockDevice;
    use crate::testutil::format_image;

    fn mounted(nr_blocks: u32) -> Filesystem {
        let dev = Arc::new(VecBlockDevice::new(2048));
        format_image(dev.as_ref(), nr_blocks, crate::TOTAL_INODES).unwrap();
        Filesystem::mount(dev, MountOptions::default()).unwrap()
    }

    #[test]
    fn create_write_read_round_trips() {
        let fs = mounted(64);
        let ino = fs.create(ROOT_INO, b"hello.txt", 0o644).unwrap();
        let n = fs.write(ino, 0, b"hello world").unwrap();
        assert_eq!(n, 11);
        let mut buf = [0u8; 11];
        assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn mkdir_then_lookup_then_rmdir() {
        let fs = mounted(64);
        let sub = fs.mkdir(ROOT_INO, b"sub", 0o755).unwrap();
        assert_eq!(fs.lookup(ROOT_INO, b"sub").unwrap(), sub);
        fs.rmdir(ROOT_INO, b"sub").unwrap();
        assert!(fs.lookup(ROOT_INO, b"sub").is_err());
    }

    #[test]
    fn rmdir_on_nonempty_directory_fails() {
        let fs = mounted(64);
        let sub = fs.mkdir(ROOT_INO, b"sub", 0o755).unwrap();
        fs.create(sub, b"f", 0o644).unwrap();
        let err = fs.rmdir(ROOT_INO, b"sub").unwrap_err();
        assert!(matches!(err, Error::NotEmpty));
    }

    #[test]
    fn hardlink_then_unlink_keeps_data_until_last_link_drops() {
        let fs = mounted(64);
        let a = fs.create(ROOT_INO, b"a", 0o644).unwrap();
        fs.write(a, 0, b"payload").unwrap();
        fs.link(ROOT_INO, b"b", a).unwrap();
        fs.unlink(ROOT_INO, b"a").unwrap();
        let b = fs.lookup(ROOT_INO, b"b").unwrap();
        assert_eq!(b, a);
        let mut buf = [0u8; 7];
        assert_eq!(fs.read(b, 0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn rename_across_directories_updates_dotdot_and_linkcounts() {
        let fs = mounted(256);
        let a = fs.mkdir(ROOT_INO, b"a", 0o755).unwrap();
        let b = fs.mkdir(ROOT_INO, b"b", 0o755).unwrap();
        fs.rename(ROOT_INO, b"a", b, b"c").unwrap();
        assert!(fs.lookup(ROOT_INO, b"a").is_err());
        let c = fs.lookup(b, b"c").unwrap();
        assert_eq!(c, a);
        let dotdot = fs.readlink_dotdot_for_test(c);
        assert_eq!(dotdot, b);
    }

    impl Filesystem {
        fn readlink_dotdot_for_test(&self, ino: u32) -> u32 {
            let handle = self.inodes.get(ino).unwrap();
            let mut inode = handle.write().unwrap();
            dirent::dotdot(&self.sb, &self.cache, &mut inode).unwrap()
        }
    }
}
