//! Path handling.
//!
//! A path is a `/`-separated string. A leading slash restarts resolution at
//! the root inode; otherwise the caller-supplied inode is the starting
//! point. `.` and `..` are ordinary entries of every directory and resolve
//! through the same lookup as any other component.

use crate::Ext2Fs;
use crate::ROOT_INODE;
use std::io;

/// Resolves the given path to an inode number.
///
/// `cwd` is the inode of the current directory, used as the starting point
/// for relative paths.
///
/// Returns None when a component is missing or is not a directory.
pub fn resolve(fs: &mut Ext2Fs, cwd: u32, path: &str) -> io::Result<Option<u32>> {
    if path == "/" {
        return Ok(Some(ROOT_INODE));
    }
    let mut cur = if path.starts_with('/') { ROOT_INODE } else { cwd };
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let inode = fs.read_inode(cur)?;
        if !inode.is_directory() {
            return Ok(None);
        }
        match fs.find_dir_entry(&inode, component)? {
            Some(next) => cur = next,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

/// Splits a path into its parent directory and its last component.
///
/// Trailing slashes are ignored. The parent of a bare name is the empty
/// path, which [`resolve`] maps to the starting inode itself.
pub fn split_parent(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[(i + 1)..]),
        None => ("", path),
    }
}

/// Computes the absolute path obtained by walking `arg` from the absolute
/// directory path `cur`.
///
/// This is a purely textual operation used to keep the displayed working
/// directory in sync with the resolved one: `.` components are dropped,
/// `..` pops the last component (stopping at the root) and repeated slashes
/// collapse.
pub fn canonicalize(cur: &str, arg: &str) -> String {
    let mut components: Vec<&str> = if arg.starts_with('/') {
        Vec::new()
    } else {
        cur.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
    };
    for component in arg.split('/').filter(|c| !c.is_empty()) {
        match component {
            "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    if components.is_empty() {
        return String::from("/");
    }
    let mut res = String::new();
    for c in components {
        res.push('/');
        res.push_str(c);
    }
    res
}
