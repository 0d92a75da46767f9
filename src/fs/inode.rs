//! An inode represents a file in the filesystem. The name of the file is not
//! included in the inode but in the directory entry associated with it since
//! several entries can refer to the same inode (hard links).
//!
//! The access to an inode's data is divided into several parts, each
//! overflowing on the next when full:
//! - Direct Block Pointers: each inode has 12 of them
//! - Singly Indirect Block Pointer: points to a block filled with pointers to
//!   more data blocks
//! - Doubly Indirect Block Pointer: points to a block filled with pointers to
//!   Singly Indirect Block Pointers
//! - Triply Indirect Block Pointer: points to a block filled with pointers to
//!   Doubly Indirect Block Pointers

use crate::Ext2Fs;
use crate::disk;
use crate::group::BlockGroupDescriptor;
use crate::superblock::Superblock;
use crate::superblock::WRITE_REQUIRED_64_BITS;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Error;
use std::io::ErrorKind;

/// The maximum number of direct blocks for each inode.
pub const DIRECT_BLOCKS_COUNT: usize = 12;

/// INode type: FIFO
pub const INODE_TYPE_FIFO: u16 = 0x1000;
/// INode type: Char device
pub const INODE_TYPE_CHAR_DEVICE: u16 = 0x2000;
/// INode type: Directory
pub const INODE_TYPE_DIRECTORY: u16 = 0x4000;
/// INode type: Block device
pub const INODE_TYPE_BLOCK_DEVICE: u16 = 0x6000;
/// INode type: Regular file
pub const INODE_TYPE_REGULAR: u16 = 0x8000;
/// INode type: Symbolic link
pub const INODE_TYPE_SYMLINK: u16 = 0xa000;
/// INode type: Socket
pub const INODE_TYPE_SOCKET: u16 = 0xc000;

/// The on-disk inode structure.
///
/// Only the 128 legacy bytes are read and written; the tail of larger inode
/// records is left untouched on the disk.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Inode {
    /// Type and permissions.
    pub mode: u16,
    /// User ID.
    pub uid: u16,
    /// Lower 32 bits of size in bytes.
    pub size_low: u32,
    /// Timestamp of the last access.
    pub atime: u32,
    /// Timestamp of the last modification of the metadata.
    pub ctime: u32,
    /// Timestamp of the last modification of the content.
    pub mtime: u32,
    /// Timestamp of the deletion.
    pub dtime: u32,
    /// Group ID.
    pub gid: u16,
    /// The number of hard links to this inode.
    pub hard_links_count: u16,
    /// The number of 512-byte sectors used by this inode, not of filesystem
    /// blocks.
    pub used_sectors: u32,
    /// INode flags.
    pub flags: u32,
    /// OS-specific value.
    pub os_specific_0: u32,
    /// Direct block pointers.
    pub direct_block_ptrs: [u32; DIRECT_BLOCKS_COUNT],
    /// Singly indirect block pointer.
    pub singly_indirect_block_ptr: u32,
    /// Doubly indirect block pointer.
    pub doubly_indirect_block_ptr: u32,
    /// Triply indirect block pointer.
    pub triply_indirect_block_ptr: u32,
    /// Generation number.
    pub generation: u32,
    /// The file's ACL.
    pub extended_attributes_block: u32,
    /// Higher 32 bits of size in bytes for regular files.
    pub size_high: u32,
    /// Block address of fragment.
    pub fragment_addr: u32,
    /// OS-specific value.
    pub os_specific_1: [u8; 12],
}

impl Inode {
    /// Creates a zero-length inode of the given mode with every timestamp set
    /// to `timestamp`.
    pub fn new(mode: u16, timestamp: u32) -> Self {
        Self {
            mode,
            uid: 0,
            size_low: 0,
            atime: timestamp,
            ctime: timestamp,
            mtime: timestamp,
            dtime: 0,
            gid: 0,
            hard_links_count: 0,
            used_sectors: 0,
            flags: 0,
            os_specific_0: 0,
            direct_block_ptrs: [0; DIRECT_BLOCKS_COUNT],
            singly_indirect_block_ptr: 0,
            doubly_indirect_block_ptr: 0,
            triply_indirect_block_ptr: 0,
            generation: 0,
            extended_attributes_block: 0,
            size_high: 0,
            fragment_addr: 0,
            os_specific_1: [0; 12],
        }
    }

    /// Returns the offset of inode `i` on the disk in bytes.
    ///
    /// `i` is the inode's global index, starting at `1`.
    fn get_disk_offset(
        i: u32,
        superblock: &Superblock,
        gdt: &[BlockGroupDescriptor],
    ) -> io::Result<u64> {
        if i == 0 || i > superblock.total_inodes {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid inode number: {i}"),
            ));
        }
        let blk_size = superblock.get_block_size() as u64;
        let inode_size = superblock.get_inode_size() as u64;

        let grp = (i - 1) / superblock.inodes_per_group;
        let idx = (i - 1) % superblock.inodes_per_group;
        let table = gdt[grp as usize].inode_table_start_addr;
        Ok(table as u64 * blk_size + idx as u64 * inode_size)
    }

    /// Reads the `i`th inode from the given device. The index `i` starts at
    /// `1`.
    pub fn read(
        i: u32,
        superblock: &Superblock,
        gdt: &[BlockGroupDescriptor],
        dev: &mut File,
    ) -> io::Result<Self> {
        let off = Self::get_disk_offset(i, superblock, gdt)?;
        unsafe { disk::read_obj::<Self>(dev, off) }
    }

    /// Writes the inode at index `i` on the device.
    pub fn write(
        &self,
        i: u32,
        superblock: &Superblock,
        gdt: &[BlockGroupDescriptor],
        dev: &mut File,
    ) -> io::Result<()> {
        let off = Self::get_disk_offset(i, superblock, gdt)?;
        disk::write_obj::<Self>(dev, self, off)
    }

    /// Tells whether the inode is a directory.
    pub fn is_directory(&self) -> bool {
        self.mode & 0xf000 == INODE_TYPE_DIRECTORY
    }

    /// Tells whether the inode is a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode & 0xf000 == INODE_TYPE_REGULAR
    }

    /// Returns the size of the file in bytes.
    pub fn get_size(&self, superblock: &Superblock) -> u64 {
        let has_version = superblock.major_version >= 1;
        let has_feature = superblock.write_required_features & WRITE_REQUIRED_64_BITS != 0;
        if has_version && has_feature && self.is_regular() {
            ((self.size_high as u64) << 32) | (self.size_low as u64)
        } else {
            self.size_low as u64
        }
    }

    /// Resolves `depth` levels of indirection starting from the pointer block
    /// `blk` to find the subtree's `i`th data block.
    ///
    /// A zero pointer encountered at any level short-circuits the descent and
    /// the function returns None.
    fn resolve_indirections(
        depth: u32,
        blk: u32,
        mut i: u32,
        superblock: &Superblock,
        dev: &mut File,
    ) -> io::Result<Option<u32>> {
        let ptrs_per_blk = superblock.get_pointers_per_block();
        let blk_size = superblock.get_block_size() as u64;

        let mut b = blk;
        for level in (0..depth).rev() {
            if b == 0 {
                return Ok(None);
            }
            let stride = ptrs_per_blk.pow(level);
            let slot = i / stride;
            i %= stride;
            let off = b as u64 * blk_size + slot as u64 * size_of::<u32>() as u64;
            b = unsafe { disk::read_obj::<u32>(dev, off)? };
        }
        Ok((b != 0).then_some(b))
    }

    /// Returns the physical block holding the inode's `i`th content block.
    ///
    /// The lookup descends through all four levels of the pointer tree; if a
    /// zero pointer is found on the way, the function returns None.
    pub fn get_content_block(
        &self,
        i: u32,
        superblock: &Superblock,
        dev: &mut File,
    ) -> io::Result<Option<u32>> {
        let ptrs_per_blk = superblock.get_pointers_per_block() as u64;
        let direct = DIRECT_BLOCKS_COUNT as u64;
        let singly_end = direct + ptrs_per_blk;
        let doubly_end = singly_end + ptrs_per_blk * ptrs_per_blk;

        match i as u64 {
            n if n < direct => {
                let ptrs = self.direct_block_ptrs;
                let blk = ptrs[n as usize];
                Ok((blk != 0).then_some(blk))
            }
            n if n < singly_end => Self::resolve_indirections(
                1,
                self.singly_indirect_block_ptr,
                (n - direct) as u32,
                superblock,
                dev,
            ),
            n if n < doubly_end => Self::resolve_indirections(
                2,
                self.doubly_indirect_block_ptr,
                (n - singly_end) as u32,
                superblock,
                dev,
            ),
            n => Self::resolve_indirections(
                3,
                self.triply_indirect_block_ptr,
                (n - doubly_end) as u32,
                superblock,
                dev,
            ),
        }
    }

    /// Reads the whole content of the file.
    ///
    /// The content is the ordered concatenation of the inode's data blocks,
    /// truncated to the inode's size. A hole ends the stream.
    pub fn read_content(&self, superblock: &Superblock, dev: &mut File) -> io::Result<Vec<u8>> {
        let size = self.get_size(superblock) as usize;
        let blk_size = superblock.get_block_size() as usize;
        let mut content = vec![0u8; size];
        let mut buf = vec![0u8; blk_size];

        let mut copied = 0;
        let mut i = 0;
        while copied < size {
            let Some(blk) = self.get_content_block(i, superblock, dev)? else {
                break;
            };
            disk::read_block(dev, superblock, blk, &mut buf)?;
            let n = (size - copied).min(blk_size);
            content[copied..(copied + n)].copy_from_slice(&buf[..n]);
            copied += n;
            i += 1;
        }
        content.truncate(copied);
        Ok(content)
    }

    /// Collects the physical blocks holding the entries of a directory, in
    /// order.
    ///
    /// Zero pointers are skipped. The triple-indirect slot is not scanned:
    /// directories grown by this driver never reach it.
    pub fn collect_dir_blocks(
        &self,
        superblock: &Superblock,
        dev: &mut File,
    ) -> io::Result<Vec<u32>> {
        let direct = self.direct_block_ptrs;
        let mut blocks: Vec<u32> = direct.into_iter().filter(|b| *b != 0).collect();

        let singly = self.singly_indirect_block_ptr;
        if singly != 0 {
            let ptrs = disk::read_pointer_block(dev, superblock, singly)?;
            blocks.extend(ptrs.into_iter().filter(|b| *b != 0));
        }
        let doubly = self.doubly_indirect_block_ptr;
        if doubly != 0 {
            let l2_blocks = disk::read_pointer_block(dev, superblock, doubly)?;
            for l2 in l2_blocks.into_iter().filter(|b| *b != 0) {
                let ptrs = disk::read_pointer_block(dev, superblock, l2)?;
                blocks.extend(ptrs.into_iter().filter(|b| *b != 0));
            }
        }
        Ok(blocks)
    }
}

impl Ext2Fs {
    /// Links `new_block` into the pointer tree of the directory inode `dir`
    /// as its next data block.
    ///
    /// Pointer blocks are allocated on the way as needed (with `dir_no` as
    /// the locality hint) and accounted in `dir.used_sectors`; the caller
    /// accounts for the data block itself and persists the inode. Triple
    /// indirection is not supported on this path.
    pub(crate) fn attach_dir_block(
        &mut self,
        dir: &mut Inode,
        dir_no: u32,
        new_block: u32,
    ) -> io::Result<()> {
        let sectors_per_blk = self.superblock.get_block_size() / 512;
        let ptrs_per_blk = self.superblock.get_pointers_per_block() as usize;

        // First free direct slot
        let mut direct = dir.direct_block_ptrs;
        for i in 0..DIRECT_BLOCKS_COUNT {
            if direct[i] == 0 {
                direct[i] = new_block;
                dir.direct_block_ptrs = direct;
                return Ok(());
            }
        }

        // Single indirection
        if dir.singly_indirect_block_ptr == 0 {
            let l1 = self.alloc_block(dir_no)?;
            dir.singly_indirect_block_ptr = l1;
            dir.used_sectors += sectors_per_blk;
            let mut ptrs = vec![0u32; ptrs_per_blk];
            ptrs[0] = new_block;
            return disk::write_pointer_block(&mut self.dev, &self.superblock, l1, &ptrs);
        }
        let l1 = dir.singly_indirect_block_ptr;
        let mut ptrs = disk::read_pointer_block(&mut self.dev, &self.superblock, l1)?;
        if let Some(slot) = ptrs.iter().position(|p| *p == 0) {
            ptrs[slot] = new_block;
            return disk::write_pointer_block(&mut self.dev, &self.superblock, l1, &ptrs);
        }

        // Double indirection, first use: the whole {L1, L2} pair is created
        if dir.doubly_indirect_block_ptr == 0 {
            let l1 = self.alloc_block(dir_no)?;
            let l2 = match self.alloc_block(dir_no) {
                Ok(b) => b,
                Err(e) => {
                    self.free_block(l1)?;
                    return Err(e);
                }
            };
            dir.doubly_indirect_block_ptr = l1;
            dir.used_sectors += 2 * sectors_per_blk;

            let mut l2_ptrs = vec![0u32; ptrs_per_blk];
            l2_ptrs[0] = new_block;
            disk::write_pointer_block(&mut self.dev, &self.superblock, l2, &l2_ptrs)?;

            let mut l1_ptrs = vec![0u32; ptrs_per_blk];
            l1_ptrs[0] = l2;
            return disk::write_pointer_block(&mut self.dev, &self.superblock, l1, &l1_ptrs);
        }
        // Double indirection, L1 already present
        let l1 = dir.doubly_indirect_block_ptr;
        let mut l1_ptrs = disk::read_pointer_block(&mut self.dev, &self.superblock, l1)?;
        for i in 0..l1_ptrs.len() {
            if l1_ptrs[i] == 0 {
                // Free L1 slot: a fresh L2 is linked into it
                let l2 = self.alloc_block(dir_no)?;
                l1_ptrs[i] = l2;
                disk::write_pointer_block(&mut self.dev, &self.superblock, l1, &l1_ptrs)?;
                dir.used_sectors += sectors_per_blk;

                let mut l2_ptrs = vec![0u32; ptrs_per_blk];
                l2_ptrs[0] = new_block;
                return disk::write_pointer_block(&mut self.dev, &self.superblock, l2, &l2_ptrs);
            }
            let l2 = l1_ptrs[i];
            let mut l2_ptrs = disk::read_pointer_block(&mut self.dev, &self.superblock, l2)?;
            if let Some(slot) = l2_ptrs.iter().position(|p| *p == 0) {
                l2_ptrs[slot] = new_block;
                return disk::write_pointer_block(&mut self.dev, &self.superblock, l2, &l2_ptrs);
            }
        }

        Err(Error::other(
            "directory is full (triple indirection is not supported)",
        ))
    }

    /// Releases every block reachable through the pointer tree of `inode`:
    /// the data blocks behind the direct slots, then the single-indirect
    /// pointer block and its data blocks, then the double-indirect tree.
    ///
    /// A triple-indirect subtree is left allocated, with a warning.
    pub(crate) fn release_content_blocks(&mut self, inode: &Inode, inode_no: u32) -> io::Result<()> {
        let direct = inode.direct_block_ptrs;
        for blk in direct.into_iter().filter(|b| *b != 0) {
            self.free_block(blk)?;
        }

        let singly = inode.singly_indirect_block_ptr;
        if singly != 0 {
            let ptrs = disk::read_pointer_block(&mut self.dev, &self.superblock, singly)?;
            for blk in ptrs.into_iter().filter(|b| *b != 0) {
                self.free_block(blk)?;
            }
            self.free_block(singly)?;
        }

        let doubly = inode.doubly_indirect_block_ptr;
        if doubly != 0 {
            let l2_blocks = disk::read_pointer_block(&mut self.dev, &self.superblock, doubly)?;
            for l2 in l2_blocks.into_iter().filter(|b| *b != 0) {
                let ptrs = disk::read_pointer_block(&mut self.dev, &self.superblock, l2)?;
                for blk in ptrs.into_iter().filter(|b| *b != 0) {
                    self.free_block(blk)?;
                }
                self.free_block(l2)?;
            }
            self.free_block(doubly)?;
        }

        if inode.triply_indirect_block_ptr != 0 {
            eprintln!("warning: inode {inode_no}: triple-indirect blocks left allocated");
        }
        Ok(())
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            mode,
            uid,
            size_low,
            atime,
            ctime,
            mtime,
            dtime,
            gid,
            hard_links_count,
            used_sectors,
            flags,
            direct_block_ptrs,
            singly_indirect_block_ptr,
            doubly_indirect_block_ptr,
            triply_indirect_block_ptr,
            generation,
            extended_attributes_block,
            size_high,
            fragment_addr,
            ..
        } = *self;
        writeln!(fmt, "mode: {mode:#o}")?;
        writeln!(fmt, "uid: {uid}")?;
        writeln!(fmt, "gid: {gid}")?;
        writeln!(fmt, "size: {size_low}")?;
        writeln!(fmt, "access time: {atime}")?;
        writeln!(fmt, "change time: {ctime}")?;
        writeln!(fmt, "modification time: {mtime}")?;
        writeln!(fmt, "deletion time: {dtime}")?;
        writeln!(fmt, "hard links: {hard_links_count}")?;
        writeln!(fmt, "sectors used: {used_sectors}")?;
        writeln!(fmt, "flags: {flags:#x}")?;
        for (i, ptr) in direct_block_ptrs.iter().enumerate() {
            writeln!(fmt, "block[{i}]: {ptr}")?;
        }
        writeln!(fmt, "block[12] (single indirect): {singly_indirect_block_ptr}")?;
        writeln!(fmt, "block[13] (double indirect): {doubly_indirect_block_ptr}")?;
        writeln!(fmt, "block[14] (triple indirect): {triply_indirect_block_ptr}")?;
        writeln!(fmt, "generation: {generation}")?;
        writeln!(fmt, "file ACL: {extended_attributes_block}")?;
        writeln!(fmt, "directory ACL / size high: {size_high}")?;
        write!(fmt, "fragment address: {fragment_addr}")
    }
}
