//! Positioned I/O against the backing device.
//!
//! Every on-disk structure is a `#[repr(C, packed)]` record; reads and writes
//! go through one seek followed by one contiguous transfer. A partial
//! transfer is a failure, there is no retry.

use crate::superblock::Superblock;
use std::fs::File;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::mem::MaybeUninit;
use std::slice;

/// Reads an object of the given type at `offset` bytes on the device.
///
/// # Safety
///
/// The caller must ensure that any bit pattern read from the device is a
/// valid value of `T`.
pub unsafe fn read_obj<T>(dev: &mut File, offset: u64) -> io::Result<T> {
    let mut obj = MaybeUninit::<T>::uninit();
    let slice =
        unsafe { slice::from_raw_parts_mut(obj.as_mut_ptr() as *mut u8, size_of::<T>()) };
    dev.seek(SeekFrom::Start(offset))?;
    dev.read_exact(slice)?;
    Ok(unsafe { obj.assume_init() })
}

/// Writes the object `obj` at `offset` bytes on the device.
pub fn write_obj<T>(dev: &mut File, obj: &T, offset: u64) -> io::Result<()> {
    let slice = unsafe { slice::from_raw_parts(obj as *const T as *const u8, size_of::<T>()) };
    dev.seek(SeekFrom::Start(offset))?;
    dev.write_all(slice)
}

/// Reads block `n` into `buf`, whose length must equal the block size.
pub fn read_block(dev: &mut File, superblock: &Superblock, n: u32, buf: &mut [u8]) -> io::Result<()> {
    let blk_size = superblock.get_block_size() as u64;
    debug_assert_eq!(buf.len() as u64, blk_size);
    if n >= superblock.total_blocks {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("read of block {n} out of bounds"),
        ));
    }
    dev.seek(SeekFrom::Start(n as u64 * blk_size))?;
    dev.read_exact(buf)
}

/// Writes `buf` to block `n`; the same length contract as [`read_block`]
/// applies.
///
/// Writing to block zero or past the end of the volume is a programming
/// error and is rejected.
pub fn write_block(dev: &mut File, superblock: &Superblock, n: u32, buf: &[u8]) -> io::Result<()> {
    let blk_size = superblock.get_block_size() as u64;
    debug_assert_eq!(buf.len() as u64, blk_size);
    if n == 0 || n >= superblock.total_blocks {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("write to block {n} out of bounds"),
        ));
    }
    dev.seek(SeekFrom::Start(n as u64 * blk_size))?;
    dev.write_all(buf)
}

/// Reads a block of pointers and returns them as host integers.
pub fn read_pointer_block(dev: &mut File, superblock: &Superblock, n: u32) -> io::Result<Vec<u32>> {
    let mut buf = vec![0u8; superblock.get_block_size() as usize];
    read_block(dev, superblock, n, &mut buf)?;
    Ok(buf
        .chunks_exact(size_of::<u32>())
        .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
        .collect())
}

/// Writes a block of pointers previously read with [`read_pointer_block`].
pub fn write_pointer_block(
    dev: &mut File,
    superblock: &Superblock,
    n: u32,
    ptrs: &[u32],
) -> io::Result<()> {
    let buf: Vec<u8> = ptrs.iter().flat_map(|p| p.to_ne_bytes()).collect();
    write_block(dev, superblock, n, &buf)
}
