//! Creation of a fresh ext2 filesystem on a device.
//!
//! The resulting volume is minimal but complete: superblock, BGDT, one
//! block bitmap, inode bitmap and inode table slice per group, a root
//! directory holding `lost+found`, and counters that exactly match the
//! bitmaps.

use crate::ROOT_INODE;
use crate::bitmap;
use crate::dirent;
use crate::disk;
use crate::group::BlockGroupDescriptor;
use crate::inode::INODE_TYPE_DIRECTORY;
use crate::inode::Inode;
use crate::superblock::EXT2_SIGNATURE;
use crate::superblock::REQUIRED_FEATURE_DIRECTORY_TYPE;
use crate::superblock::SUPERBLOCK_OFFSET;
use crate::superblock::Superblock;
use crate::util::ceil_division;
use crate::util::get_timestamp;
use crate::util::log2;
use std::fs::File;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use uuid::Uuid;

/// The default block size in bytes.
const DEFAULT_BLOCK_SIZE: u64 = 1024;
/// The default number of inodes per group.
const DEFAULT_INODES_PER_GROUP: u32 = 1024;
/// The default number of blocks per group.
const DEFAULT_BLOCKS_PER_GROUP: u32 = 8192;

/// The default number of mounts before a fsck pass is required.
const DEFAULT_FSCK_MOUNT_COUNT: u16 = 1024;
/// The default interval in seconds before a fsck pass is required.
const DEFAULT_FSCK_INTERVAL: u32 = 2678400;

/// Filesystem state: the filesystem is clean
const FS_STATE_CLEAN: u16 = 1;
/// Error handle action: mount as read-only
const ERR_ACTION_READ_ONLY: u16 = 2;

/// The inode of the `lost+found` directory, which is also the last reserved
/// inode.
const LOST_FOUND_INODE: u32 = 11;

/// Copies `src` into a zero-padded array of `N` bytes, truncating if needed.
fn to_fixed<const N: usize>(src: Option<&String>) -> [u8; N] {
    let mut buf = [0; N];
    if let Some(src) = src {
        let src = src.as_bytes();
        let len = src.len().min(N);
        buf[..len].copy_from_slice(&src[..len]);
    }
    buf
}

/// A factory to create an `ext2` filesystem.
#[derive(Default)]
pub struct Ext2Factory {
    /// The length of the filesystem in bytes.
    pub len: Option<u64>,

    /// The block size in bytes.
    pub block_size: Option<u64>,

    /// The number of inodes per group.
    pub inodes_per_group: Option<u32>,
    /// The number of blocks per group.
    pub blocks_per_group: Option<u32>,

    /// The ID of the filesystem.
    pub fs_id: Option<[u8; 16]>,
    /// The name of the filesystem.
    pub label: Option<String>,

    /// The path the filesystem was last mounted to.
    pub last_mount_path: Option<String>,
}

impl Ext2Factory {
    /// Tells whether an ext2 filesystem is present on the given device.
    pub fn is_present(&self, dev: &mut File) -> io::Result<bool> {
        let superblock = Superblock::read(dev)?;
        Ok(superblock.signature == EXT2_SIGNATURE)
    }

    /// Creates the filesystem on the given device.
    pub fn create(&self, dev: &mut File) -> io::Result<()> {
        let timestamp = get_timestamp().as_secs() as u32;

        let len = match self.len {
            Some(len) => {
                dev.set_len(len)?;
                len
            }
            None => dev.metadata()?.len(),
        };
        let block_size = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        if !block_size.is_power_of_two() || block_size < 1024 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid block size: {block_size}"),
            ));
        }
        let block_size_log = log2(block_size).unwrap() as u32;

        let total_blocks = (len / block_size) as u32;
        let blocks_per_group = self.blocks_per_group.unwrap_or(DEFAULT_BLOCKS_PER_GROUP);
        let inodes_per_group = self.inodes_per_group.unwrap_or(DEFAULT_INODES_PER_GROUP);
        // The driver reads each bitmap as a single block
        if blocks_per_group as u64 > block_size * 8 || inodes_per_group as u64 > block_size * 8 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "group quotas exceed the capacity of one bitmap block",
            ));
        }
        let groups_count = ceil_division(total_blocks, blocks_per_group);
        let total_inodes = inodes_per_group * groups_count;
        let first_data_block = (SUPERBLOCK_OFFSET / block_size) as u32;

        // Layout: superblock, BGDT, then every group's metadata back to back,
        // then the two bootstrap directory blocks
        let bgdt_block = first_data_block + 1;
        let bgdt_size = ceil_division(
            groups_count * size_of::<BlockGroupDescriptor>() as u32,
            block_size as u32,
        );
        let inode_table_size = ceil_division(
            inodes_per_group * size_of::<Inode>() as u32,
            block_size as u32,
        );
        let metadata_size = 2 + inode_table_size;
        let root_dir_block = bgdt_block + bgdt_size + groups_count * metadata_size;
        let lost_found_block = root_dir_block + 1;
        let data_start = lost_found_block + 1;
        if data_start >= total_blocks {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "device is too small for the requested geometry",
            ));
        }

        let superblock_group = (SUPERBLOCK_OFFSET / block_size) as u32 / blocks_per_group;
        let filesystem_id = self
            .fs_id
            .unwrap_or_else(|| *Uuid::new_v4().as_bytes());

        let mut superblock = Superblock {
            total_inodes,
            total_blocks,
            superuser_blocks: 0,
            total_unallocated_blocks: 0,
            total_unallocated_inodes: 0,
            first_data_block,
            block_size_log: block_size_log - 10,
            fragment_size_log: block_size_log - 10,
            blocks_per_group,
            fragments_per_group: blocks_per_group,
            inodes_per_group,
            last_mount_timestamp: 0,
            last_write_timestamp: timestamp,
            mount_count_since_fsck: 0,
            mount_count_before_fsck: DEFAULT_FSCK_MOUNT_COUNT,
            signature: EXT2_SIGNATURE,
            fs_state: FS_STATE_CLEAN,
            error_action: ERR_ACTION_READ_ONLY,
            minor_version: 1,
            last_fsck_timestamp: timestamp,
            fsck_interval: DEFAULT_FSCK_INTERVAL,
            os_id: 0,
            major_version: 1,
            uid_reserved: 0,
            gid_reserved: 0,

            first_non_reserved_inode: LOST_FOUND_INODE,
            inode_size: size_of::<Inode>() as u16,
            superblock_group: superblock_group as u16,
            optional_features: 0,
            required_features: REQUIRED_FEATURE_DIRECTORY_TYPE,
            write_required_features: 0,
            filesystem_id,
            volume_name: to_fixed::<16>(self.label.as_ref()),
            last_mount_path: to_fixed::<64>(self.last_mount_path.as_ref()),
            compression_algorithms: 0,
            files_preallocate_count: 0,
            directories_preallocate_count: 0,
            _unused: 0,
            journal_id: [0; 16],
            journal_inode: 0,
            journal_device: 0,
            orphan_inode_head: 0,

            _padding: [0; 788],
        };

        // Write block groups
        let zero_block = vec![0u8; block_size as usize];
        let mut gdt = Vec::with_capacity(groups_count as usize);
        for g in 0..groups_count {
            let metadata_off = bgdt_block + bgdt_size + g * metadata_size;
            let block_bitmap_addr = metadata_off;
            let inode_bitmap_addr = metadata_off + 1;
            let inode_table_addr = metadata_off + 2;

            // Block bitmap: metadata prefix and tail bits past the end of the
            // volume are marked used
            let mut bm = zero_block.clone();
            let mut used_blocks = 0u32;
            for j in 0..blocks_per_group {
                let blk = g * blocks_per_group + first_data_block + j;
                if blk < data_start || blk >= total_blocks {
                    bitmap::set(&mut bm, j);
                    used_blocks += 1;
                }
            }
            disk::write_block(dev, &superblock, block_bitmap_addr, &bm)?;

            // Inode bitmap: the reserved inodes live in the first group
            let mut ibm = zero_block.clone();
            let mut used_inodes = 0u32;
            for j in 0..inodes_per_group {
                let inode = g * inodes_per_group + j + 1;
                if inode <= LOST_FOUND_INODE {
                    bitmap::set(&mut ibm, j);
                    used_inodes += 1;
                }
            }
            disk::write_block(dev, &superblock, inode_bitmap_addr, &ibm)?;

            for b in 0..inode_table_size {
                disk::write_block(dev, &superblock, inode_table_addr + b, &zero_block)?;
            }

            let directories = if g == 0 { 2 } else { 0 };
            let gd = BlockGroupDescriptor::new(
                block_bitmap_addr,
                inode_bitmap_addr,
                inode_table_addr,
                (blocks_per_group - used_blocks) as u16,
                (inodes_per_group - used_inodes) as u16,
                directories,
            );
            gd.write(g, &superblock, dev)?;

            superblock.total_unallocated_blocks += blocks_per_group - used_blocks;
            superblock.total_unallocated_inodes += inodes_per_group - used_inodes;
            gdt.push(gd);
        }

        // Root directory: itself, its parent (itself) and `lost+found`
        let mut buf = zero_block.clone();
        dirent::init_dir_block(&mut buf, ROOT_INODE, ROOT_INODE);
        dirent::insert_in_block(
            &mut buf,
            LOST_FOUND_INODE,
            "lost+found",
            dirent::TYPE_INDICATOR_DIRECTORY,
        );
        disk::write_block(dev, &superblock, root_dir_block, &buf)?;

        let mut root = Inode::new(INODE_TYPE_DIRECTORY | 0o755, timestamp);
        root.hard_links_count = 3;
        root.size_low = block_size as u32;
        root.used_sectors = (block_size / 512) as u32;
        root.direct_block_ptrs = {
            let mut ptrs = root.direct_block_ptrs;
            ptrs[0] = root_dir_block;
            ptrs
        };
        root.write(ROOT_INODE, &superblock, &gdt, dev)?;

        let mut buf = zero_block;
        dirent::init_dir_block(&mut buf, LOST_FOUND_INODE, ROOT_INODE);
        disk::write_block(dev, &superblock, lost_found_block, &buf)?;

        let mut lost_found = Inode::new(INODE_TYPE_DIRECTORY | 0o700, timestamp);
        lost_found.hard_links_count = 2;
        lost_found.size_low = block_size as u32;
        lost_found.used_sectors = (block_size / 512) as u32;
        lost_found.direct_block_ptrs = {
            let mut ptrs = lost_found.direct_block_ptrs;
            ptrs[0] = lost_found_block;
            ptrs
        };
        lost_found.write(LOST_FOUND_INODE, &superblock, &gdt, dev)?;

        superblock.write(dev)
    }
}
