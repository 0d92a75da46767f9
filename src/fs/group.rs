//! The Block Group Descriptor Table (BGDT) starts in the block right after
//! the one containing the superblock. It holds one descriptor per block
//! group, locating the group's bitmaps and its slice of the inode table.

use crate::disk;
use crate::superblock::Superblock;
use std::fmt;
use std::fs::File;
use std::io;

/// Structure representing a block group descriptor stored in the BGDT.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BlockGroupDescriptor {
    /// The block address of the block usage bitmap.
    pub block_usage_bitmap_addr: u32,
    /// The block address of the inode usage bitmap.
    pub inode_usage_bitmap_addr: u32,
    /// Starting block address of inode table.
    pub inode_table_start_addr: u32,
    /// Number of unallocated blocks in group.
    pub unallocated_blocks_number: u16,
    /// Number of unallocated inodes in group.
    pub unallocated_inodes_number: u16,
    /// Number of directories in group.
    pub directories_number: u16,

    /// Structure padding.
    _padding: [u8; 14],
}

impl BlockGroupDescriptor {
    /// Creates a descriptor for a group whose metadata lives at the given
    /// block addresses.
    pub fn new(
        block_usage_bitmap_addr: u32,
        inode_usage_bitmap_addr: u32,
        inode_table_start_addr: u32,
        unallocated_blocks_number: u16,
        unallocated_inodes_number: u16,
        directories_number: u16,
    ) -> Self {
        Self {
            block_usage_bitmap_addr,
            inode_usage_bitmap_addr,
            inode_table_start_addr,
            unallocated_blocks_number,
            unallocated_inodes_number,
            directories_number,

            _padding: [0; 14],
        }
    }

    /// Returns the offset of the `i`th block group descriptor on the disk in
    /// bytes.
    pub fn get_disk_offset(i: u32, superblock: &Superblock) -> u64 {
        let bgdt_block = (superblock.first_data_block + 1) as u64;
        bgdt_block * superblock.get_block_size() as u64 + i as u64 * size_of::<Self>() as u64
    }

    /// Reads the `i`th block group descriptor from the given device.
    pub fn read(i: u32, superblock: &Superblock, dev: &mut File) -> io::Result<Self> {
        unsafe { disk::read_obj::<Self>(dev, Self::get_disk_offset(i, superblock)) }
    }

    /// Writes the descriptor back at position `i` in the table.
    pub fn write(&self, i: u32, superblock: &Superblock, dev: &mut File) -> io::Result<()> {
        disk::write_obj::<Self>(dev, self, Self::get_disk_offset(i, superblock))
    }

    /// Reads the whole table from the given device.
    pub fn read_table(superblock: &Superblock, dev: &mut File) -> io::Result<Vec<Self>> {
        (0..superblock.get_groups_count())
            .map(|i| Self::read(i, superblock, dev))
            .collect()
    }
}

impl fmt::Display for BlockGroupDescriptor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            block_usage_bitmap_addr,
            inode_usage_bitmap_addr,
            inode_table_start_addr,
            unallocated_blocks_number,
            unallocated_inodes_number,
            directories_number,
            ..
        } = *self;
        writeln!(fmt, "block bitmap: {block_usage_bitmap_addr}")?;
        writeln!(fmt, "inode bitmap: {inode_usage_bitmap_addr}")?;
        writeln!(fmt, "inode table: {inode_table_start_addr}")?;
        writeln!(fmt, "free blocks: {unallocated_blocks_number}")?;
        writeln!(fmt, "free inodes: {unallocated_inodes_number}")?;
        write!(fmt, "directories: {directories_number}")
    }
}
