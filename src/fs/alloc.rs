//! Inode and data block allocation.
//!
//! Both allocators are first-fit scans of the per-group bitmaps. The bitmap
//! is persisted before the counters of the superblock and of the group
//! descriptor, and both counter copies are kept in sync with the disk.
//!
//! Freeing an object whose bit is already clear is not an error: a warning
//! is printed and the counters are left untouched.

use crate::Ext2Fs;
use crate::bitmap;
use crate::disk;
use std::io;
use std::io::Error;
use std::io::ErrorKind;

impl Ext2Fs {
    /// Allocates an inode and returns its global index (starting at `1`).
    ///
    /// The bitmap bit is set and the free-inode counters are decremented and
    /// persisted before the function returns.
    pub fn alloc_inode(&mut self) -> io::Result<u32> {
        if self.superblock.total_unallocated_inodes == 0 {
            return Err(Error::other("no free inodes left"));
        }
        let mut bitmap = vec![0u8; self.superblock.get_block_size() as usize];
        for grp in 0..self.gdt.len() {
            if self.gdt[grp].unallocated_inodes_number == 0 {
                continue;
            }
            let bitmap_addr = self.gdt[grp].inode_usage_bitmap_addr;
            disk::read_block(&mut self.dev, &self.superblock, bitmap_addr, &mut bitmap)?;
            let Some(j) = bitmap::find_clear(&bitmap, self.superblock.inodes_per_group) else {
                continue;
            };
            bitmap::set(&mut bitmap, j);
            disk::write_block(&mut self.dev, &self.superblock, bitmap_addr, &bitmap)?;

            self.superblock.total_unallocated_inodes -= 1;
            self.gdt[grp].unallocated_inodes_number -= 1;
            self.write_superblock()?;
            self.write_group_desc(grp as u32)?;

            return Ok(grp as u32 * self.superblock.inodes_per_group + j + 1);
        }
        Err(Error::other(
            "superblock reports free inodes but the bitmaps are full",
        ))
    }

    /// Releases the inode with the given global index.
    pub fn free_inode(&mut self, inode_no: u32) -> io::Result<()> {
        if inode_no == 0 || inode_no > self.superblock.total_inodes {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid inode number: {inode_no}"),
            ));
        }
        let grp = (inode_no - 1) / self.superblock.inodes_per_group;
        let j = (inode_no - 1) % self.superblock.inodes_per_group;

        let bitmap_addr = self.gdt[grp as usize].inode_usage_bitmap_addr;
        let mut bitmap = vec![0u8; self.superblock.get_block_size() as usize];
        disk::read_block(&mut self.dev, &self.superblock, bitmap_addr, &mut bitmap)?;
        if !bitmap::is_set(&bitmap, j) {
            eprintln!("warning: inode {inode_no} was already free");
            return Ok(());
        }
        bitmap::clear(&mut bitmap, j);
        disk::write_block(&mut self.dev, &self.superblock, bitmap_addr, &bitmap)?;

        self.superblock.total_unallocated_inodes += 1;
        self.gdt[grp as usize].unallocated_inodes_number += 1;
        self.write_superblock()?;
        self.write_group_desc(grp)
    }

    /// Allocates a data block and returns its physical number.
    ///
    /// `inode_no` is the inode that will own the block; its group is tried
    /// first so that a file's blocks stay close to its inode.
    pub fn alloc_block(&mut self, inode_no: u32) -> io::Result<u32> {
        if self.superblock.total_unallocated_blocks == 0 {
            return Err(Error::other("no free blocks left"));
        }
        let preferred = (inode_no - 1) / self.superblock.inodes_per_group;
        if let Some(blk) = self.alloc_block_in_group(preferred)? {
            return Ok(blk);
        }
        for grp in 0..self.superblock.get_groups_count() {
            if let Some(blk) = self.alloc_block_in_group(grp)? {
                return Ok(blk);
            }
        }
        Err(Error::other(
            "superblock reports free blocks but the bitmaps are full",
        ))
    }

    /// Tries to allocate a block in group `grp`; returns None if the group
    /// has none left.
    fn alloc_block_in_group(&mut self, grp: u32) -> io::Result<Option<u32>> {
        if self.gdt[grp as usize].unallocated_blocks_number == 0 {
            return Ok(None);
        }
        let bitmap_addr = self.gdt[grp as usize].block_usage_bitmap_addr;
        let mut bitmap = vec![0u8; self.superblock.get_block_size() as usize];
        disk::read_block(&mut self.dev, &self.superblock, bitmap_addr, &mut bitmap)?;
        let Some(j) = bitmap::find_clear(&bitmap, self.superblock.blocks_per_group) else {
            return Ok(None);
        };
        bitmap::set(&mut bitmap, j);
        disk::write_block(&mut self.dev, &self.superblock, bitmap_addr, &bitmap)?;

        self.superblock.total_unallocated_blocks -= 1;
        self.gdt[grp as usize].unallocated_blocks_number -= 1;
        self.write_superblock()?;
        self.write_group_desc(grp)?;

        Ok(Some(
            grp * self.superblock.blocks_per_group + self.superblock.first_data_block + j,
        ))
    }

    /// Releases the data block with the given physical number.
    pub fn free_block(&mut self, blk: u32) -> io::Result<()> {
        if blk < self.superblock.first_data_block || blk >= self.superblock.total_blocks {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid block number: {blk}"),
            ));
        }
        let grp = (blk - self.superblock.first_data_block) / self.superblock.blocks_per_group;
        let j = (blk - self.superblock.first_data_block) % self.superblock.blocks_per_group;

        let bitmap_addr = self.gdt[grp as usize].block_usage_bitmap_addr;
        let mut bitmap = vec![0u8; self.superblock.get_block_size() as usize];
        disk::read_block(&mut self.dev, &self.superblock, bitmap_addr, &mut bitmap)?;
        if !bitmap::is_set(&bitmap, j) {
            eprintln!("warning: block {blk} was already free");
            return Ok(());
        }
        bitmap::clear(&mut bitmap, j);
        disk::write_block(&mut self.dev, &self.superblock, bitmap_addr, &bitmap)?;

        self.superblock.total_unallocated_blocks += 1;
        self.gdt[grp as usize].unallocated_blocks_number += 1;
        self.write_superblock()?;
        self.write_group_desc(grp)
    }
}
