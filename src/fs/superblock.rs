//! The superblock is the volume header, located at a fixed byte offset from
//! the beginning of the device. Everything else is found from it.

use crate::disk;
use crate::util::ceil_division;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use uuid::Uuid;

/// The offset of the superblock from the beginning of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// The filesystem's signature.
pub const EXT2_SIGNATURE: u16 = 0xef53;

/// Optional feature: Preallocation of a specified number of blocks for each
/// new directory
pub const OPTIONAL_FEATURE_DIRECTORY_PREALLOCATION: u32 = 0x1;
/// Optional feature: AFS server
pub const OPTIONAL_FEATURE_AFS: u32 = 0x2;
/// Optional feature: Journal
pub const OPTIONAL_FEATURE_JOURNAL: u32 = 0x4;
/// Optional feature: Inodes have extended attributes
pub const OPTIONAL_FEATURE_INODE_EXTENDED: u32 = 0x8;
/// Optional feature: Filesystem can resize itself for larger partitions
pub const OPTIONAL_FEATURE_RESIZE: u32 = 0x10;
/// Optional feature: Directories use hash index
pub const OPTIONAL_FEATURE_HASH_INDEX: u32 = 0x20;

/// Required feature: Compression
pub const REQUIRED_FEATURE_COMPRESSION: u32 = 0x1;
/// Required feature: Directory entries have a type field
pub const REQUIRED_FEATURE_DIRECTORY_TYPE: u32 = 0x2;
/// Required feature: Filesystem needs to replay its journal
pub const REQUIRED_FEATURE_JOURNAL_REPLAY: u32 = 0x4;
/// Required feature: Filesystem uses a journal device
pub const REQUIRED_FEATURE_JOURNAL_DEVICE: u32 = 0x8;

/// Write-required feature: Sparse superblocks and group descriptor tables
pub const WRITE_REQUIRED_SPARSE_SUPERBLOCKS: u32 = 0x1;
/// Write-required feature: Filesystem uses a 64-bit file size
pub const WRITE_REQUIRED_64_BITS: u32 = 0x2;
/// Write-required feature: Directory contents are stored in the form of a
/// binary tree
pub const WRITE_REQUIRED_DIRECTORY_BINARY_TREE: u32 = 0x4;

/// The smallest supported block size in bytes.
const MIN_BLOCK_SIZE: u32 = 1024;
/// The largest supported block size in bytes.
const MAX_BLOCK_SIZE: u32 = 65536;
/// The size of an inode record before the dynamic revision.
const GOOD_OLD_INODE_SIZE: u16 = 128;

/// The ext2 superblock structure.
#[repr(C, packed)]
pub struct Superblock {
    /// Total number of inodes in the filesystem.
    pub total_inodes: u32,
    /// Total number of blocks in the filesystem.
    pub total_blocks: u32,
    /// Number of blocks reserved for the superuser.
    pub superuser_blocks: u32,
    /// Total number of unallocated blocks.
    pub total_unallocated_blocks: u32,
    /// Total number of unallocated inodes.
    pub total_unallocated_inodes: u32,
    /// The first data block, which is also the block containing the
    /// superblock.
    pub first_data_block: u32,
    /// log2(block_size) - 10
    pub block_size_log: u32,
    /// log2(fragment_size) - 10
    pub fragment_size_log: u32,
    /// The number of blocks per block group.
    pub blocks_per_group: u32,
    /// The number of fragments per block group.
    pub fragments_per_group: u32,
    /// The number of inodes per block group.
    pub inodes_per_group: u32,
    /// The timestamp of the last mount operation.
    pub last_mount_timestamp: u32,
    /// The timestamp of the last write operation.
    pub last_write_timestamp: u32,
    /// The number of mounts since the last consistency check.
    pub mount_count_since_fsck: u16,
    /// The number of mounts allowed before a consistency check must be done.
    pub mount_count_before_fsck: u16,
    /// The ext2 signature.
    pub signature: u16,
    /// The filesystem's state.
    pub fs_state: u16,
    /// The action to perform when an error is detected.
    pub error_action: u16,
    /// The minor version.
    pub minor_version: u16,
    /// The timestamp of the last consistency check.
    pub last_fsck_timestamp: u32,
    /// The interval between mandatory consistency checks.
    pub fsck_interval: u32,
    /// The id of the operating system from which the filesystem was created.
    pub os_id: u32,
    /// The major version.
    pub major_version: u32,
    /// The UID of the user that can use reserved blocks.
    pub uid_reserved: u16,
    /// The GID of the group that can use reserved blocks.
    pub gid_reserved: u16,

    // Extended superblock fields

    /// The first non reserved inode.
    pub first_non_reserved_inode: u32,
    /// The size of the inode structure in bytes.
    pub inode_size: u16,
    /// The block group containing the superblock.
    pub superblock_group: u16,
    /// Optional features for the implementation to support.
    pub optional_features: u32,
    /// Required features for the implementation to support.
    pub required_features: u32,
    /// Required features for the implementation to support for writing.
    pub write_required_features: u32,
    /// The filesystem id.
    pub filesystem_id: [u8; 16],
    /// The volume name.
    pub volume_name: [u8; 16],
    /// The path the volume was last mounted to.
    pub last_mount_path: [u8; 64],
    /// Used compression algorithms.
    pub compression_algorithms: u32,
    /// The number of blocks to preallocate for files.
    pub files_preallocate_count: u8,
    /// The number of blocks to preallocate for directories.
    pub directories_preallocate_count: u8,
    /// Unused.
    pub _unused: u16,
    /// The journal ID.
    pub journal_id: [u8; 16],
    /// The journal inode.
    pub journal_inode: u32,
    /// The journal device.
    pub journal_device: u32,
    /// The head of orphan inodes list.
    pub orphan_inode_head: u32,

    /// Structure padding.
    pub _padding: [u8; 788],
}

impl Superblock {
    /// Creates a new instance by reading from the given device.
    pub fn read(dev: &mut File) -> io::Result<Self> {
        unsafe { disk::read_obj::<Self>(dev, SUPERBLOCK_OFFSET) }
    }

    /// Writes the superblock on the device.
    pub fn write(&self, dev: &mut File) -> io::Result<()> {
        disk::write_obj::<Self>(dev, self, SUPERBLOCK_OFFSET)
    }

    /// Returns the size of a block in bytes.
    pub fn get_block_size(&self) -> u32 {
        1024 << self.block_size_log
    }

    /// Returns the number of block pointers a single block can hold.
    pub fn get_pointers_per_block(&self) -> u32 {
        self.get_block_size() / size_of::<u32>() as u32
    }

    /// Returns the size of an inode record in bytes.
    pub fn get_inode_size(&self) -> usize {
        if self.major_version >= 1 {
            self.inode_size as _
        } else {
            GOOD_OLD_INODE_SIZE as _
        }
    }

    /// Returns the number of block groups.
    pub fn get_groups_count(&self) -> u32 {
        ceil_division(self.total_blocks, self.blocks_per_group)
    }

    /// Returns the volume name, stripped of trailing NUL bytes.
    pub fn get_volume_name(&self) -> String {
        let name = self.volume_name;
        let len = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        String::from_utf8_lossy(&name[..len]).into_owned()
    }

    /// Checks the superblock for validity.
    ///
    /// An error here means the volume cannot be an ext2 filesystem the driver
    /// is able to operate on; startup aborts.
    pub fn check(&self) -> io::Result<()> {
        let invalid = |msg: String| Err(Error::new(ErrorKind::InvalidData, msg));
        let Self {
            total_inodes,
            total_blocks,
            total_unallocated_blocks,
            total_unallocated_inodes,
            blocks_per_group,
            inodes_per_group,
            signature,
            major_version,
            inode_size,
            ..
        } = *self;

        if signature != EXT2_SIGNATURE {
            return invalid(format!(
                "invalid signature (expected {EXT2_SIGNATURE:#x}, found {signature:#x})"
            ));
        }
        if total_unallocated_blocks > total_blocks {
            return invalid(format!(
                "free blocks count ({total_unallocated_blocks}) exceeds total blocks count \
                 ({total_blocks})"
            ));
        }
        if total_unallocated_inodes > total_inodes {
            return invalid(format!(
                "free inodes count ({total_unallocated_inodes}) exceeds total inodes count \
                 ({total_inodes})"
            ));
        }
        if blocks_per_group == 0 || inodes_per_group == 0 {
            return invalid("blocks per group or inodes per group is zero".into());
        }
        // Both quotas must describe the same number of groups
        let groups_from_blocks = ceil_division(total_blocks, blocks_per_group);
        let groups_from_inodes = ceil_division(total_inodes, inodes_per_group);
        if groups_from_blocks != groups_from_inodes {
            return invalid(format!(
                "inconsistent groups count (from blocks: {groups_from_blocks}, from inodes: \
                 {groups_from_inodes})"
            ));
        }
        let blk_size = self.get_block_size();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blk_size) {
            return invalid(format!("invalid block size ({blk_size} bytes)"));
        }
        if major_version >= 1
            && (inode_size < GOOD_OLD_INODE_SIZE || !inode_size.is_power_of_two())
        {
            return invalid(format!("invalid inode size ({inode_size} bytes)"));
        }
        Ok(())
    }
}

impl fmt::Display for Superblock {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Copy packed fields to locals to take references for formatting
        let Self {
            total_inodes,
            total_blocks,
            superuser_blocks,
            total_unallocated_blocks,
            total_unallocated_inodes,
            first_data_block,
            block_size_log,
            fragment_size_log,
            blocks_per_group,
            fragments_per_group,
            inodes_per_group,
            last_mount_timestamp,
            last_write_timestamp,
            mount_count_since_fsck,
            mount_count_before_fsck,
            signature,
            fs_state,
            error_action,
            minor_version,
            last_fsck_timestamp,
            fsck_interval,
            os_id,
            major_version,
            uid_reserved,
            gid_reserved,
            first_non_reserved_inode,
            inode_size,
            filesystem_id,
            ..
        } = *self;

        writeln!(fmt, "inodes count: {total_inodes}")?;
        writeln!(fmt, "blocks count: {total_blocks}")?;
        writeln!(fmt, "reserved blocks count: {superuser_blocks}")?;
        writeln!(fmt, "free blocks count: {total_unallocated_blocks}")?;
        writeln!(fmt, "free inodes count: {total_unallocated_inodes}")?;
        writeln!(fmt, "first data block: {first_data_block}")?;
        writeln!(fmt, "block size: {} (log: {block_size_log})", self.get_block_size())?;
        writeln!(
            fmt,
            "fragment size: {} (log: {fragment_size_log})",
            1024u64 << fragment_size_log
        )?;
        writeln!(fmt, "blocks per group: {blocks_per_group}")?;
        writeln!(fmt, "fragments per group: {fragments_per_group}")?;
        writeln!(fmt, "inodes per group: {inodes_per_group}")?;
        writeln!(fmt, "last mount time: {last_mount_timestamp}")?;
        writeln!(fmt, "last write time: {last_write_timestamp}")?;
        writeln!(fmt, "mount count: {mount_count_since_fsck}")?;
        writeln!(fmt, "max mount count: {mount_count_before_fsck}")?;
        writeln!(fmt, "signature: {signature:#x}")?;
        writeln!(fmt, "state: {fs_state}")?;
        writeln!(fmt, "error action: {error_action}")?;
        writeln!(fmt, "revision: {major_version}.{minor_version}")?;
        writeln!(fmt, "last check time: {last_fsck_timestamp}")?;
        writeln!(fmt, "check interval: {fsck_interval}")?;
        writeln!(fmt, "creator OS: {os_id}")?;
        writeln!(fmt, "reserved blocks uid: {uid_reserved}")?;
        writeln!(fmt, "reserved blocks gid: {gid_reserved}")?;
        writeln!(fmt, "first non-reserved inode: {first_non_reserved_inode}")?;
        writeln!(fmt, "inode size: {inode_size}")?;
        writeln!(fmt, "filesystem id: {}", Uuid::from_bytes(filesystem_id))?;
        write!(fmt, "volume name: {}", self.get_volume_name())
    }
}
