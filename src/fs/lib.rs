//! Read/write driver for ext2 filesystem images.
//!
//! The filesystem divides the storage device into several substructures:
//! - Block Group: described by the Block Group Descriptor Table (BGDT)
//! - Block: stored inside of block groups
//! - INode: represents a file in the filesystem
//!
//! The driver operates on a raw byte-addressable volume: it parses and
//! validates the superblock and the BGDT at open time, then navigates and
//! mutates the filesystem through inode numbers. Directories are ordinary
//! inodes whose content blocks hold variable-length entry records; files are
//! the ordered concatenation of the blocks reachable through the inode's
//! direct, singly, doubly and triply indirect pointers.
//!
//! There is exactly one writer and no journaling: an operation that mutates
//! several structures validates first, allocates next (rolling back on
//! failure), and persists every modified object before returning.

pub mod alloc;
pub mod bitmap;
pub mod dirent;
pub mod disk;
pub mod factory;
pub mod group;
pub mod inode;
pub mod path;
pub mod superblock;
pub mod util;

use crate::dirent::MAX_NAME_LEN;
use crate::dirent::TYPE_INDICATOR_DIRECTORY;
use crate::dirent::TYPE_INDICATOR_REGULAR;
use crate::group::BlockGroupDescriptor;
use crate::inode::INODE_TYPE_DIRECTORY;
use crate::inode::INODE_TYPE_REGULAR;
use crate::inode::Inode;
use crate::superblock::Superblock;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;

/// The inode of the root directory.
pub const ROOT_INODE: u32 = 2;

/// Returns the current timestamp in seconds since the Unix epoch.
fn now() -> u32 {
    util::get_timestamp().as_secs() as u32
}

/// An open ext2 filesystem instance.
///
/// The superblock and the group descriptor table are kept in memory for the
/// lifetime of the session and written back whenever a counter changes.
pub struct Ext2Fs {
    /// The device containing the filesystem.
    pub(crate) dev: File,
    /// The filesystem's superblock.
    pub superblock: Superblock,
    /// The in-memory copy of the group descriptor table.
    pub gdt: Vec<BlockGroupDescriptor>,
}

impl Ext2Fs {
    /// Opens the filesystem image at the given path for reading and writing.
    ///
    /// The superblock is validated before anything else is touched; an
    /// invalid volume is rejected.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut dev = OpenOptions::new().read(true).write(true).open(path)?;
        let superblock = Superblock::read(&mut dev)?;
        superblock.check()?;
        let gdt = BlockGroupDescriptor::read_table(&superblock, &mut dev)?;
        Ok(Self {
            dev,
            superblock,
            gdt,
        })
    }

    /// Reads block `n` into `buf`.
    pub fn read_block(&mut self, n: u32, buf: &mut [u8]) -> io::Result<()> {
        disk::read_block(&mut self.dev, &self.superblock, n, buf)
    }

    /// Writes `buf` to block `n`.
    pub fn write_block(&mut self, n: u32, buf: &[u8]) -> io::Result<()> {
        disk::write_block(&mut self.dev, &self.superblock, n, buf)
    }

    /// Persists the in-memory superblock.
    pub fn write_superblock(&mut self) -> io::Result<()> {
        self.superblock.write(&mut self.dev)
    }

    /// Persists the in-memory descriptor of group `i`.
    pub fn write_group_desc(&mut self, i: u32) -> io::Result<()> {
        self.gdt[i as usize].write(i, &self.superblock, &mut self.dev)
    }

    /// Reads inode `n` (1-based).
    pub fn read_inode(&mut self, n: u32) -> io::Result<Inode> {
        Inode::read(n, &self.superblock, &self.gdt, &mut self.dev)
    }

    /// Writes `inode` at index `n`.
    pub fn write_inode(&mut self, n: u32, inode: &Inode) -> io::Result<()> {
        inode.write(n, &self.superblock, &self.gdt, &mut self.dev)
    }

    /// Resolves the given path to an inode number, starting at `cwd` for
    /// relative paths.
    pub fn resolve(&mut self, cwd: u32, path: &str) -> io::Result<Option<u32>> {
        path::resolve(self, cwd, path)
    }

    /// Creates an empty regular file, or updates the timestamps of an
    /// existing one.
    pub fn touch(&mut self, cwd: u32, target: &str) -> io::Result<()> {
        let (parent_path, name) = path::split_parent(target);
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "missing file name"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "file name too long"));
        }
        let parent_no = self
            .resolve(cwd, parent_path)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        let mut parent = self.read_inode(parent_no)?;
        if !parent.is_directory() {
            return Err(Error::new(ErrorKind::InvalidInput, "not a directory"));
        }
        let timestamp = now();

        // The file already existing is not an error: its timestamps move
        if let Some(existing) = self.find_dir_entry(&parent, name)? {
            let mut inode = self.read_inode(existing)?;
            inode.atime = timestamp;
            inode.mtime = timestamp;
            return self.write_inode(existing, &inode);
        }

        let inode_no = self.alloc_inode()?;
        let mut inode = Inode::new(INODE_TYPE_REGULAR | 0o644, timestamp);
        inode.hard_links_count = 1;
        self.write_inode(inode_no, &inode)?;
        if let Err(e) = self.add_dir_entry(
            &mut parent,
            parent_no,
            inode_no,
            name,
            TYPE_INDICATOR_REGULAR,
        ) {
            self.free_inode(inode_no)?;
            return Err(e);
        }
        parent.mtime = timestamp;
        self.write_inode(parent_no, &parent)
    }

    /// Creates an empty directory.
    pub fn make_dir(&mut self, cwd: u32, target: &str) -> io::Result<()> {
        let (parent_path, name) = path::split_parent(target);
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "missing directory name"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "file name too long"));
        }
        let parent_no = self
            .resolve(cwd, parent_path)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        let mut parent = self.read_inode(parent_no)?;
        if !parent.is_directory() {
            return Err(Error::new(ErrorKind::InvalidInput, "not a directory"));
        }
        if self.find_dir_entry(&parent, name)?.is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, "file exists"));
        }
        let timestamp = now();
        let blk_size = self.superblock.get_block_size();

        let inode_no = self.alloc_inode()?;
        let block = match self.alloc_block(inode_no) {
            Ok(b) => b,
            Err(e) => {
                self.free_inode(inode_no)?;
                return Err(e);
            }
        };

        let mut buf = vec![0u8; blk_size as usize];
        dirent::init_dir_block(&mut buf, inode_no, parent_no);
        self.write_block(block, &buf)?;

        // Self-reference plus the `.` entry
        let mut inode = Inode::new(INODE_TYPE_DIRECTORY | 0o755, timestamp);
        inode.hard_links_count = 2;
        inode.size_low = blk_size;
        inode.used_sectors = blk_size / 512;
        inode.direct_block_ptrs = {
            let mut ptrs = inode.direct_block_ptrs;
            ptrs[0] = block;
            ptrs
        };
        self.write_inode(inode_no, &inode)?;

        if let Err(e) = self.add_dir_entry(
            &mut parent,
            parent_no,
            inode_no,
            name,
            TYPE_INDICATOR_DIRECTORY,
        ) {
            self.free_block(block)?;
            self.free_inode(inode_no)?;
            return Err(e);
        }
        // The new `..` entry is a back-reference to the parent
        parent.hard_links_count += 1;
        parent.mtime = timestamp;
        self.write_inode(parent_no, &parent)?;

        let grp = (inode_no - 1) / self.superblock.inodes_per_group;
        self.gdt[grp as usize].directories_number += 1;
        self.write_group_desc(grp)
    }

    /// Removes a regular file.
    ///
    /// When the link count drops to zero, every data block reachable through
    /// the pointer tree is released and the inode is freed.
    pub fn remove_file(&mut self, cwd: u32, target: &str) -> io::Result<()> {
        let (parent_path, name) = path::split_parent(target);
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "missing file name"));
        }
        let target_no = self
            .resolve(cwd, target)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        let mut inode = self.read_inode(target_no)?;
        if inode.is_directory() {
            return Err(Error::new(ErrorKind::InvalidInput, "is a directory"));
        }
        let parent_no = self
            .resolve(cwd, parent_path)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        let mut parent = self.read_inode(parent_no)?;

        self.remove_dir_entry(&parent, name)?;

        let timestamp = now();
        inode.hard_links_count -= 1;
        if inode.hard_links_count == 0 {
            self.release_content_blocks(&inode, target_no)?;
            inode.dtime = timestamp;
        }
        self.write_inode(target_no, &inode)?;
        if inode.hard_links_count == 0 {
            self.free_inode(target_no)?;
        }

        parent.atime = timestamp;
        parent.mtime = timestamp;
        self.write_inode(parent_no, &parent)
    }

    /// Removes an empty directory.
    pub fn remove_dir(&mut self, cwd: u32, target: &str) -> io::Result<()> {
        let (parent_path, name) = path::split_parent(target);
        if target == "/" || name.is_empty() || name == "." || name == ".." {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "invalid or protected directory",
            ));
        }
        let target_no = self
            .resolve(cwd, target)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        if target_no == ROOT_INODE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "invalid or protected directory",
            ));
        }
        let mut inode = self.read_inode(target_no)?;
        if !inode.is_directory() {
            return Err(Error::new(ErrorKind::InvalidInput, "not a directory"));
        }
        if !self.dir_is_empty(&inode)? {
            return Err(Error::other("directory not empty"));
        }
        let parent_no = self
            .resolve(cwd, parent_path)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        let mut parent = self.read_inode(parent_no)?;

        self.remove_dir_entry(&parent, name)?;

        // An empty directory owns a single data block
        let direct = inode.direct_block_ptrs;
        if direct[0] != 0 {
            self.free_block(direct[0])?;
        }
        let timestamp = now();
        inode.dtime = timestamp;
        inode.hard_links_count = 0;
        self.write_inode(target_no, &inode)?;
        self.free_inode(target_no)?;

        // The `..` back-reference disappears with the directory
        parent.hard_links_count -= 1;
        parent.mtime = timestamp;
        self.write_inode(parent_no, &parent)?;

        let grp = (target_no - 1) / self.superblock.inodes_per_group;
        self.gdt[grp as usize].directories_number -= 1;
        self.write_group_desc(grp)
    }

    /// Renames an entry of the directory `dir_no` in place.
    pub fn rename(&mut self, dir_no: u32, old: &str, new: &str) -> io::Result<()> {
        if new.is_empty() || new.contains('/') {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid file name"));
        }
        if new.len() > MAX_NAME_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "file name too long"));
        }
        let mut dir = self.read_inode(dir_no)?;
        if !dir.is_directory() {
            return Err(Error::new(ErrorKind::InvalidInput, "not a directory"));
        }
        let target_no = self
            .find_dir_entry(&dir, old)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        if self.find_dir_entry(&dir, new)?.is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, "file exists"));
        }
        self.rename_dir_entry(&dir, old, new)?;

        let timestamp = now();
        dir.mtime = timestamp;
        self.write_inode(dir_no, &dir)?;
        let mut target = self.read_inode(target_no)?;
        target.ctime = timestamp;
        self.write_inode(target_no, &target)
    }

    /// Reads the whole content of the regular file at the given path.
    pub fn read_file(&mut self, cwd: u32, target: &str) -> io::Result<Vec<u8>> {
        let target_no = self
            .resolve(cwd, target)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such file or directory"))?;
        let inode = self.read_inode(target_no)?;
        if inode.is_directory() {
            return Err(Error::new(ErrorKind::InvalidInput, "is a directory"));
        }
        if !inode.is_regular() {
            return Err(Error::new(ErrorKind::InvalidInput, "not a regular file"));
        }
        inode.read_content(&self.superblock, &mut self.dev)
    }

    /// Copies the regular file at `src` in the image to `dst` on the host
    /// filesystem. Returns the number of bytes written.
    pub fn copy_to_host(&mut self, cwd: u32, src: &str, dst: &Path) -> io::Result<u64> {
        let content = self.read_file(cwd, src)?;
        let mut out = File::create(dst)?;
        out.write_all(&content)?;
        Ok(content.len() as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::factory::Ext2Factory;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::process;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    static IMAGE_COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// A scratch filesystem image, removed from the host on drop.
    struct Scratch {
        fs: Ext2Fs,
        path: PathBuf,
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    /// Formats a fresh single-group image of `total_blocks` 1 KiB blocks.
    fn scratch(total_blocks: u32) -> Scratch {
        scratch_grouped(total_blocks, total_blocks, 128)
    }

    fn scratch_grouped(total_blocks: u32, blocks_per_group: u32, inodes_per_group: u32) -> Scratch {
        let path = env::temp_dir().join(format!(
            "e2sh-test-{}-{}.img",
            process::id(),
            IMAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let factory = Ext2Factory {
            len: Some(total_blocks as u64 * 1024),
            block_size: Some(1024),
            blocks_per_group: Some(blocks_per_group),
            inodes_per_group: Some(inodes_per_group),
            label: Some(String::from("scratch")),
            ..Default::default()
        };
        factory.create(&mut file).unwrap();
        drop(file);
        Scratch {
            fs: Ext2Fs::open(&path).unwrap(),
            path,
        }
    }

    /// Sums the free-object counters of the GDT and checks them against the
    /// superblock.
    fn check_counters(fs: &Ext2Fs) {
        let free_blocks: u32 = fs
            .gdt
            .iter()
            .map(|gd| gd.unallocated_blocks_number as u32)
            .sum();
        let free_inodes: u32 = fs
            .gdt
            .iter()
            .map(|gd| gd.unallocated_inodes_number as u32)
            .sum();
        assert_eq!(free_blocks, { fs.superblock.total_unallocated_blocks });
        assert_eq!(free_inodes, { fs.superblock.total_unallocated_inodes });
    }

    fn free_counts(fs: &Ext2Fs) -> (u32, u32) {
        (
            fs.superblock.total_unallocated_blocks,
            fs.superblock.total_unallocated_inodes,
        )
    }

    #[test]
    fn fresh_image() {
        let mut s = scratch(1024);
        check_counters(&s.fs);

        let mut file = OpenOptions::new().read(true).open(&s.path).unwrap();
        assert!(Ext2Factory::default().is_present(&mut file).unwrap());

        assert_eq!(s.fs.resolve(ROOT_INODE, "/").unwrap(), Some(ROOT_INODE));
        assert_eq!(s.fs.resolve(ROOT_INODE, "/lost+found").unwrap(), Some(11));
        assert_eq!(s.fs.resolve(ROOT_INODE, "missing").unwrap(), None);

        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        assert!(root.is_directory());
        assert_eq!({ root.hard_links_count }, 3);
        assert_eq!({ root.size_low }, 1024);

        let entries = s.fs.list_dir(&root).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "lost+found"]);
        // Both self-references point back to the root
        assert_eq!(entries[0].inode, ROOT_INODE);
        assert_eq!(entries[1].inode, ROOT_INODE);

        assert!(!s.fs.dir_is_empty(&root).unwrap());
        let lost_found = s.fs.read_inode(11).unwrap();
        assert!(s.fs.dir_is_empty(&lost_found).unwrap());
        assert_eq!({ s.fs.gdt[0].directories_number }, 2);
    }

    #[test]
    fn touch_then_remove_restores_counters() {
        let mut s = scratch(1024);
        let before = free_counts(&s.fs);

        s.fs.touch(ROOT_INODE, "/a.txt").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/a.txt").unwrap().unwrap();
        let inode = s.fs.read_inode(no).unwrap();
        assert!(inode.is_regular());
        assert_eq!({ inode.mode } & 0o7777, 0o644);
        assert_eq!({ inode.hard_links_count }, 1);
        assert_eq!({ inode.size_low }, 0);
        assert!({ inode.mtime } > 0);
        // A zero-length file costs one inode and no block
        assert_eq!(free_counts(&s.fs), (before.0, before.1 - 1));
        check_counters(&s.fs);

        s.fs.remove_file(ROOT_INODE, "/a.txt").unwrap();
        assert_eq!(s.fs.resolve(ROOT_INODE, "/a.txt").unwrap(), None);
        assert_eq!(free_counts(&s.fs), before);
        check_counters(&s.fs);

        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        let names: Vec<String> =
            s.fs.list_dir(&root)
                .unwrap()
                .into_iter()
                .map(|e| e.name)
                .collect();
        assert_eq!(names, [".", "..", "lost+found"]);
    }

    #[test]
    fn touch_existing_bumps_timestamps() {
        let mut s = scratch(1024);
        s.fs.touch(ROOT_INODE, "f").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "f").unwrap().unwrap();

        // Age the file, then touch it again
        let mut inode = s.fs.read_inode(no).unwrap();
        inode.atime = 1;
        inode.mtime = 1;
        s.fs.write_inode(no, &inode).unwrap();

        let before = free_counts(&s.fs);
        s.fs.touch(ROOT_INODE, "f").unwrap();
        assert_eq!(free_counts(&s.fs), before);
        let inode = s.fs.read_inode(no).unwrap();
        assert!({ inode.atime } > 1);
        assert!({ inode.mtime } > 1);

        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        let count =
            s.fs.list_dir(&root)
                .unwrap()
                .iter()
                .filter(|e| e.name == "f")
                .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn mkdir_rmdir_roundtrip() {
        let mut s = scratch(1024);
        let before = free_counts(&s.fs);
        let root_links = { s.fs.read_inode(ROOT_INODE).unwrap().hard_links_count };

        s.fs.make_dir(ROOT_INODE, "/d").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/d").unwrap().unwrap();
        let inode = s.fs.read_inode(no).unwrap();
        assert!(inode.is_directory());
        assert_eq!({ inode.hard_links_count }, 2);
        assert_eq!({ inode.size_low }, 1024);
        assert_eq!({ inode.used_sectors }, 2);
        // One inode and one data block were spent
        assert_eq!(free_counts(&s.fs), (before.0 - 1, before.1 - 1));
        assert_eq!({ s.fs.gdt[0].directories_number }, 3);

        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        assert_eq!({ root.hard_links_count }, root_links + 1);

        // The fresh directory block: `.` spans 12 bytes, `..` the rest
        let entries = s.fs.list_dir(&inode).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[0].inode, no);
        assert_eq!(entries[0].rec_len, 12);
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].inode, ROOT_INODE);
        assert_eq!(entries[1].rec_len, 1012);

        s.fs.remove_dir(ROOT_INODE, "/d").unwrap();
        assert_eq!(s.fs.resolve(ROOT_INODE, "/d").unwrap(), None);
        assert_eq!(free_counts(&s.fs), before);
        check_counters(&s.fs);
        assert_eq!({ s.fs.gdt[0].directories_number }, 2);
        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        assert_eq!({ root.hard_links_count }, root_links);
    }

    #[test]
    fn rmdir_rejections() {
        let mut s = scratch(1024);
        s.fs.make_dir(ROOT_INODE, "/c").unwrap();

        assert!(s.fs.remove_dir(ROOT_INODE, "/").is_err());
        assert!(s.fs.remove_dir(ROOT_INODE, "/c/..").is_err());
        assert!(s.fs.remove_dir(ROOT_INODE, "/c/.").is_err());

        // A non-empty directory stays
        s.fs.touch(ROOT_INODE, "/c/f").unwrap();
        assert!(s.fs.remove_dir(ROOT_INODE, "/c").is_err());
        s.fs.remove_file(ROOT_INODE, "/c/f").unwrap();
        s.fs.remove_dir(ROOT_INODE, "/c").unwrap();

        // rmdir on a regular file
        s.fs.touch(ROOT_INODE, "/f").unwrap();
        assert!(s.fs.remove_dir(ROOT_INODE, "/f").is_err());
    }

    #[test]
    fn nested_resolution() {
        let mut s = scratch(1024);
        s.fs.make_dir(ROOT_INODE, "/a").unwrap();
        s.fs.make_dir(ROOT_INODE, "/a/b").unwrap();
        s.fs.touch(ROOT_INODE, "/a/b/f").unwrap();

        let a = s.fs.resolve(ROOT_INODE, "/a").unwrap().unwrap();
        let b = s.fs.resolve(ROOT_INODE, "/a/b").unwrap().unwrap();
        let f = s.fs.resolve(ROOT_INODE, "/a/b/f").unwrap().unwrap();

        // Relative resolution starts at the given directory
        assert_eq!(s.fs.resolve(a, "b/f").unwrap(), Some(f));
        assert_eq!(s.fs.resolve(b, "f").unwrap(), Some(f));
        // `..` resolves through the ordinary directory entry
        assert_eq!(s.fs.resolve(b, "..").unwrap(), Some(a));
        assert_eq!(s.fs.resolve(b, "../..").unwrap(), Some(ROOT_INODE));
        assert_eq!(s.fs.resolve(b, "../../a/b").unwrap(), Some(b));
        // An absolute path ignores the starting inode
        assert_eq!(s.fs.resolve(b, "/a").unwrap(), Some(a));
        // Repeated slashes collapse
        assert_eq!(s.fs.resolve(ROOT_INODE, "/a//b///f").unwrap(), Some(f));
        // A file is not a valid intermediate component
        assert_eq!(s.fs.resolve(ROOT_INODE, "/a/b/f/x").unwrap(), None);

        // The parent directory's link count tracks its subdirectories
        let a_inode = s.fs.read_inode(a).unwrap();
        assert_eq!({ a_inode.hard_links_count }, 3);
    }

    /// Fills `count` data blocks with a recognizable pattern, returning the
    /// allocated block numbers and the expected content.
    fn fill_blocks(fs: &mut Ext2Fs, owner: u32, count: usize) -> (Vec<u32>, Vec<u8>) {
        let mut blocks = Vec::with_capacity(count);
        let mut content = Vec::with_capacity(count * 1024);
        for i in 0..count {
            let blk = fs.alloc_block(owner).unwrap();
            let buf = vec![(i % 251) as u8; 1024];
            fs.write_block(blk, &buf).unwrap();
            content.extend_from_slice(&buf);
            blocks.push(blk);
        }
        (blocks, content)
    }

    #[test]
    fn read_direct_blocks() {
        let mut s = scratch(1024);
        s.fs.touch(ROOT_INODE, "/f").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/f").unwrap().unwrap();

        let (blocks, content) = fill_blocks(&mut s.fs, no, 3);
        let mut inode = s.fs.read_inode(no).unwrap();
        inode.direct_block_ptrs = {
            let mut ptrs = inode.direct_block_ptrs;
            ptrs[..3].copy_from_slice(&blocks);
            ptrs
        };
        inode.size_low = 3000;
        inode.used_sectors = 6;
        s.fs.write_inode(no, &inode).unwrap();

        let read = s.fs.read_file(ROOT_INODE, "/f").unwrap();
        assert_eq!(read.len(), 3000);
        assert_eq!(read, content[..3000]);
    }

    #[test]
    fn read_indirect_blocks() {
        let mut s = scratch(1024);
        s.fs.touch(ROOT_INODE, "/big").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/big").unwrap().unwrap();

        // 12 direct + 256 single-indirect + 10 double-indirect data blocks
        let (blocks, content) = fill_blocks(&mut s.fs, no, 12 + 256 + 10);
        let l1 = s.fs.alloc_block(no).unwrap();
        disk::write_pointer_block(&mut s.fs.dev, &s.fs.superblock, l1, &blocks[12..268]).unwrap();

        let dbl_l1 = s.fs.alloc_block(no).unwrap();
        let dbl_l2 = s.fs.alloc_block(no).unwrap();
        let mut l2_ptrs = vec![0u32; 256];
        l2_ptrs[..10].copy_from_slice(&blocks[268..278]);
        disk::write_pointer_block(&mut s.fs.dev, &s.fs.superblock, dbl_l2, &l2_ptrs).unwrap();
        let mut l1_ptrs = vec![0u32; 256];
        l1_ptrs[0] = dbl_l2;
        disk::write_pointer_block(&mut s.fs.dev, &s.fs.superblock, dbl_l1, &l1_ptrs).unwrap();

        let size = (12 + 256 + 10) * 1024 - 100;
        let mut inode = s.fs.read_inode(no).unwrap();
        inode.direct_block_ptrs = {
            let mut ptrs = inode.direct_block_ptrs;
            ptrs.copy_from_slice(&blocks[..12]);
            ptrs
        };
        inode.singly_indirect_block_ptr = l1;
        inode.doubly_indirect_block_ptr = dbl_l1;
        inode.size_low = size as u32;
        s.fs.write_inode(no, &inode).unwrap();

        let read = s.fs.read_file(ROOT_INODE, "/big").unwrap();
        assert_eq!(read.len(), size);
        assert_eq!(read, content[..size]);

        // Releasing the file returns every block, pointer blocks included
        let before = free_counts(&s.fs);
        s.fs.remove_file(ROOT_INODE, "/big").unwrap();
        assert_eq!(
            free_counts(&s.fs),
            (before.0 + 278 + 3, before.1 + 1)
        );
        check_counters(&s.fs);
    }

    #[test]
    fn triple_indirect_lookup() {
        let mut s = scratch(1024);
        s.fs.touch(ROOT_INODE, "/huge").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/huge").unwrap().unwrap();

        // Build a minimal three-level chain: only the first slot of each
        // pointer block is live
        let data = s.fs.alloc_block(no).unwrap();
        let l3 = s.fs.alloc_block(no).unwrap();
        let l2 = s.fs.alloc_block(no).unwrap();
        let l1 = s.fs.alloc_block(no).unwrap();
        let mut ptrs = vec![0u32; 256];
        ptrs[0] = data;
        disk::write_pointer_block(&mut s.fs.dev, &s.fs.superblock, l3, &ptrs).unwrap();
        ptrs[0] = l3;
        disk::write_pointer_block(&mut s.fs.dev, &s.fs.superblock, l2, &ptrs).unwrap();
        ptrs[0] = l2;
        disk::write_pointer_block(&mut s.fs.dev, &s.fs.superblock, l1, &ptrs).unwrap();

        let mut inode = s.fs.read_inode(no).unwrap();
        inode.triply_indirect_block_ptr = l1;
        s.fs.write_inode(no, &inode).unwrap();

        // The first logical block of the triple-indirect range
        let first_l3_index = 12 + 256 + 256 * 256;
        let inode = s.fs.read_inode(no).unwrap();
        let resolved = inode
            .get_content_block(first_l3_index, &s.fs.superblock, &mut s.fs.dev)
            .unwrap();
        assert_eq!(resolved, Some(data));
        // A hole right after it
        let resolved = inode
            .get_content_block(first_l3_index + 1, &s.fs.superblock, &mut s.fs.dev)
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[test]
    fn directory_grows_a_new_block() {
        let mut s = scratch(1024);
        s.fs.make_dir(ROOT_INODE, "/big").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/big").unwrap().unwrap();

        // Entries named `g_NNNN` have a 16-byte footprint: 62 of them exhaust
        // the slack after `.` and `..`, the 63rd forces a second block
        for i in 0..62 {
            s.fs.touch(ROOT_INODE, &format!("/big/g_{i:04}")).unwrap();
            let inode = s.fs.read_inode(no).unwrap();
            assert_eq!({ inode.size_low }, 1024);
        }
        s.fs.touch(ROOT_INODE, "/big/g_0062").unwrap();

        let inode = s.fs.read_inode(no).unwrap();
        assert_eq!({ inode.size_low }, 2048);
        assert_eq!({ inode.used_sectors }, 4);
        let direct = inode.direct_block_ptrs;
        assert_ne!(direct[1], 0);

        // The overflow block holds a single entry spanning the whole block
        let entries = s.fs.list_dir(&inode).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.name, "g_0062");
        assert_eq!(last.rec_len, 1024);

        // Every entry is still reachable
        for i in 0..63 {
            assert!(
                s.fs.resolve(ROOT_INODE, &format!("/big/g_{i:04}"))
                    .unwrap()
                    .is_some()
            );
        }
        check_counters(&s.fs);
    }

    #[test]
    fn rename_in_place() {
        let mut s = scratch(1024);
        s.fs.touch(ROOT_INODE, "/x").unwrap();
        s.fs.touch(ROOT_INODE, "/z").unwrap();
        let x = s.fs.resolve(ROOT_INODE, "/x").unwrap().unwrap();

        s.fs.rename(ROOT_INODE, "x", "y").unwrap();
        assert_eq!(s.fs.resolve(ROOT_INODE, "/y").unwrap(), Some(x));
        assert_eq!(s.fs.resolve(ROOT_INODE, "/x").unwrap(), None);

        // Equal-length renames restore the directory block byte for byte
        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        let block = { root.direct_block_ptrs }[0];
        let mut before = vec![0u8; 1024];
        s.fs.read_block(block, &mut before).unwrap();
        s.fs.rename(ROOT_INODE, "y", "w").unwrap();
        s.fs.rename(ROOT_INODE, "w", "y").unwrap();
        let mut after = vec![0u8; 1024];
        s.fs.read_block(block, &mut after).unwrap();
        assert_eq!(before, after);

        // Renaming over an existing name is refused
        assert!(s.fs.rename(ROOT_INODE, "y", "z").is_err());
        // `x` was squeezed between other entries: a longer name cannot fit
        assert!(s.fs.rename(ROOT_INODE, "y", "a_much_longer_name").is_err());
        assert_eq!(s.fs.resolve(ROOT_INODE, "/y").unwrap(), Some(x));
        // Slashes are not allowed in the new name
        assert!(s.fs.rename(ROOT_INODE, "y", "a/b").is_err());
    }

    #[test]
    fn free_is_idempotent() {
        let mut s = scratch(1024);
        let blk = s.fs.alloc_block(ROOT_INODE).unwrap();
        let before = free_counts(&s.fs);

        s.fs.free_block(blk).unwrap();
        assert_eq!({ s.fs.superblock.total_unallocated_blocks }, before.0 + 1);
        // Freeing again only warns
        s.fs.free_block(blk).unwrap();
        assert_eq!({ s.fs.superblock.total_unallocated_blocks }, before.0 + 1);
        check_counters(&s.fs);

        let inode = s.fs.alloc_inode().unwrap();
        s.fs.free_inode(inode).unwrap();
        s.fs.free_inode(inode).unwrap();
        assert_eq!(free_counts(&s.fs), (before.0 + 1, before.1));
        check_counters(&s.fs);

        assert!(s.fs.free_block(0).is_err());
        assert!(s.fs.free_inode(0).is_err());
    }

    #[test]
    fn allocator_locality() {
        let mut s = scratch_grouped(2048, 1024, 128);
        assert_eq!(s.fs.gdt.len(), 2);

        // A block for the root lands in the root's own group
        let blk = s.fs.alloc_block(ROOT_INODE).unwrap();
        let grp = (blk - s.fs.superblock.first_data_block) / s.fs.superblock.blocks_per_group;
        assert_eq!(grp, 0);

        // Fill the first group's inodes; the next allocation spills over
        let mut last = 0;
        while last < 128 {
            last = s.fs.alloc_inode().unwrap();
        }
        let spilled = s.fs.alloc_inode().unwrap();
        assert!(spilled > 128);
        assert_eq!({ s.fs.gdt[0].unallocated_inodes_number }, 0);

        // And a block hinted at the spilled inode lands in group 1
        let blk = s.fs.alloc_block(spilled).unwrap();
        let grp = (blk - s.fs.superblock.first_data_block) / s.fs.superblock.blocks_per_group;
        assert_eq!(grp, 1);
        check_counters(&s.fs);
    }

    #[test]
    fn exhausting_inodes_fails_cleanly() {
        let mut s = scratch(256);
        let before_blocks = s.fs.superblock.total_unallocated_blocks;

        // 128 inodes per group, 11 reserved
        for i in 0..117 {
            s.fs.touch(ROOT_INODE, &format!("/f{i}")).unwrap();
        }
        let err = s.fs.touch(ROOT_INODE, "/one-too-many").unwrap_err();
        assert_eq!(err.to_string(), "no free inodes left");

        // The failed operation allocated nothing
        assert_eq!({ s.fs.superblock.total_unallocated_inodes }, 0);
        let root = s.fs.read_inode(ROOT_INODE).unwrap();
        assert!(s.fs.find_dir_entry(&root, "one-too-many").unwrap().is_none());
        // Only directory-growth blocks were spent
        let root_blocks = ({ root.size_low } / 1024 - 1) as u32;
        assert_eq!(
            { s.fs.superblock.total_unallocated_blocks },
            before_blocks - root_blocks
        );
        check_counters(&s.fs);
    }

    #[test]
    fn copy_out_roundtrip() {
        let mut s = scratch(1024);
        s.fs.touch(ROOT_INODE, "/data").unwrap();
        let no = s.fs.resolve(ROOT_INODE, "/data").unwrap().unwrap();

        let (blocks, content) = fill_blocks(&mut s.fs, no, 2);
        let mut inode = s.fs.read_inode(no).unwrap();
        inode.direct_block_ptrs = {
            let mut ptrs = inode.direct_block_ptrs;
            ptrs[..2].copy_from_slice(&blocks);
            ptrs
        };
        inode.size_low = 1500;
        s.fs.write_inode(no, &inode).unwrap();

        let dst = s.path.with_extension("out");
        let written = s.fs.copy_to_host(ROOT_INODE, "/data", &dst).unwrap();
        assert_eq!(written, 1500);
        let read = fs::read(&dst).unwrap();
        assert_eq!(read, content[..1500]);
        fs::remove_file(dst).unwrap();

        // Directories and missing files are refused
        assert!(s.fs.read_file(ROOT_INODE, "/lost+found").is_err());
        assert!(s.fs.read_file(ROOT_INODE, "/absent").is_err());

        // An empty file reads back empty
        s.fs.touch(ROOT_INODE, "/empty").unwrap();
        assert!(s.fs.read_file(ROOT_INODE, "/empty").unwrap().is_empty());
    }
}
