//! `e2sh` is an interactive shell to inspect and modify an ext2 filesystem
//! image.
//!
//! The shell keeps a current directory (an inode number together with the
//! displayed absolute path) and hands each command line to the corresponding
//! filesystem operation.

mod prompt;

use crate::prompt::prompt;
use e2fs::Ext2Fs;
use e2fs::ROOT_INODE;
use e2fs::inode::INODE_TYPE_BLOCK_DEVICE;
use e2fs::inode::INODE_TYPE_CHAR_DEVICE;
use e2fs::inode::INODE_TYPE_DIRECTORY;
use e2fs::inode::INODE_TYPE_FIFO;
use e2fs::inode::INODE_TYPE_SOCKET;
use e2fs::inode::INODE_TYPE_SYMLINK;
use e2fs::path;
use e2fs::util::ByteSize;
use std::env;
use std::env::ArgsOs;
use std::fmt;
use std::io;
use std::io::Write;
use std::mem::MaybeUninit;
use std::path::Path;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The list of filesystem images.
    images: Vec<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            _ => res.images.push(PathBuf::from(arg)),
        }
    }
    res
}

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

/// Prints command usage.
fn print_usage() {
    eprintln!("e2sh: bad usage");
    eprintln!("Try 'e2sh --help' for more information.");
}

/// Prints command help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" e2sh [options] <image>");
    println!();
    println!("Opens an interactive shell on an ext2 filesystem image.");
    println!();
    println!("Options:");
    println!(" -h, --help\tPrints help.");
}

/// Prints help for the shell's internal commands.
fn print_cmd_help() {
    println!();
    println!("Help:");
    println!();
    println!("  Navigation");
    println!("   ls [path]           list a directory");
    println!("   cd <path>           change the current directory");
    println!("   pwd                 print the current directory");
    println!();
    println!("  Files");
    println!("   cat <path>          print the content of a file");
    println!("   attr <path>         print the attributes of a file");
    println!("   touch <path>        create a file, or update its timestamps");
    println!("   rm <path>           remove a file");
    println!("   mkdir <path>        create a directory");
    println!("   rmdir <path>        remove an empty directory");
    println!("   rename <old> <new>  rename an entry of the current directory");
    println!("   cp <src> <dst>      copy a file out of the image to the host");
    println!();
    println!("  Debug");
    println!("   info                print a summary of the filesystem");
    println!("   print superblock    dump the superblock");
    println!("   print inode <n>     dump an inode");
    println!("   print groups        dump the group descriptor table");
    println!();
    println!("  Misc");
    println!("   help                print this menu");
    println!("   exit | quit         leave the shell");
    println!();
}

/// Renders a timestamp as a local date.
fn format_timestamp(ts: u32) -> String {
    let t = ts as libc::time_t;
    let mut tm = unsafe { MaybeUninit::<libc::tm>::zeroed().assume_init() };
    let mut buf = [0u8; 64];
    let len = unsafe {
        libc::localtime_r(&t, &mut tm);
        libc::strftime(
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            c"%Y-%m-%d %H:%M".as_ptr(),
            &tm,
        )
    };
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Renders an inode mode as an `ls -l` style permission string.
fn format_permissions(mode: u16) -> String {
    let mut s = String::with_capacity(10);
    s.push(match mode & 0xf000 {
        INODE_TYPE_DIRECTORY => 'd',
        INODE_TYPE_SYMLINK => 'l',
        INODE_TYPE_CHAR_DEVICE => 'c',
        INODE_TYPE_BLOCK_DEVICE => 'b',
        INODE_TYPE_FIFO => 'p',
        INODE_TYPE_SOCKET => 's',
        _ => '-',
    });
    for shift in [6, 3, 0] {
        let bits = mode >> shift;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

/// Prints a summary of the filesystem.
fn print_info(fs: &Ext2Fs) {
    let sb = &fs.superblock;
    let blk_size = sb.get_block_size() as u64;
    let total_blocks = sb.total_blocks as u64;
    let free_blocks = sb.total_unallocated_blocks;
    let free_inodes = sb.total_unallocated_inodes;
    println!("{:<16}: {}", "Volume name", sb.get_volume_name());
    println!("{:<16}: {} bytes", "Image size", total_blocks * blk_size);
    println!(
        "{:<16}: {}",
        "Free space",
        ByteSize(free_blocks as u64 * blk_size)
    );
    println!("{:<16}: {free_inodes}", "Free inodes");
    println!("{:<16}: {free_blocks}", "Free blocks");
    println!("{:<16}: {blk_size} bytes", "Block size");
    println!("{:<16}: {} bytes", "Inode size", sb.get_inode_size());
    println!("{:<16}: {}", "Groups count", sb.get_groups_count());
}

/// Dumps the inode whose number is given as a decimal string.
fn print_inode(fs: &mut Ext2Fs, arg: &str) {
    let Ok(n) = arg.parse::<u32>() else {
        eprintln!("print: invalid inode number `{arg}`");
        return;
    };
    match fs.read_inode(n) {
        Ok(inode) => {
            println!("inode {n}:");
            println!("{inode}");
        }
        Err(e) => eprintln!("print: inode {n}: {e}"),
    }
}

/// Dumps the group descriptor table.
fn print_groups(fs: &Ext2Fs) {
    for (i, gd) in fs.gdt.iter().enumerate() {
        println!("group {i}:");
        println!("{gd}");
        println!();
    }
}

/// The `ls` command.
fn list(fs: &mut Ext2Fs, cwd: u32, target: &str) {
    let inode_no = match fs.resolve(cwd, target) {
        Ok(Some(n)) => n,
        Ok(None) => {
            eprintln!("ls: {target}: no such file or directory");
            return;
        }
        Err(e) => {
            eprintln!("ls: {target}: {e}");
            return;
        }
    };
    let inode = match fs.read_inode(inode_no) {
        Ok(inode) => inode,
        Err(e) => {
            eprintln!("ls: {target}: {e}");
            return;
        }
    };
    if !inode.is_directory() {
        println!("{target}");
        return;
    }
    match fs.list_dir(&inode) {
        Ok(entries) => {
            for e in entries {
                println!(
                    "{}  (inode: {}, rec_len: {}, name_len: {}, type: {})",
                    e.name,
                    e.inode,
                    e.rec_len,
                    e.name.len(),
                    e.file_type
                );
            }
        }
        Err(e) => eprintln!("ls: {target}: {e}"),
    }
}

/// The `cat` command.
fn cat(fs: &mut Ext2Fs, cwd: u32, target: &str) {
    match fs.read_file(cwd, target) {
        Ok(content) => {
            let _ = io::stdout().write_all(&content);
        }
        Err(e) => eprintln!("cat: {target}: {e}"),
    }
}

/// The `attr` command.
fn print_attr(fs: &mut Ext2Fs, cwd: u32, target: &str) {
    let inode_no = match fs.resolve(cwd, target) {
        Ok(Some(n)) => n,
        Ok(None) => {
            eprintln!("attr: {target}: no such file or directory");
            return;
        }
        Err(e) => {
            eprintln!("attr: {target}: {e}");
            return;
        }
    };
    let inode = match fs.read_inode(inode_no) {
        Ok(inode) => inode,
        Err(e) => {
            eprintln!("attr: {target}: {e}");
            return;
        }
    };
    let mode = inode.mode;
    let uid = inode.uid;
    let gid = inode.gid;
    let mtime = inode.mtime;
    let size = inode.get_size(&fs.superblock);
    println!("{:<12}: {}", "Permissions", format_permissions(mode));
    println!("{:<12}: {uid}", "UID");
    println!("{:<12}: {gid}", "GID");
    println!("{:<12}: {} ({size} bytes)", "Size", ByteSize(size));
    println!("{:<12}: {}", "Modified", format_timestamp(mtime));
}

/// The `cd` command.
fn change_dir(fs: &mut Ext2Fs, cwd: &mut u32, cwd_path: &mut String, target: &str) {
    let inode_no = match fs.resolve(*cwd, target) {
        Ok(Some(n)) => n,
        Ok(None) => {
            eprintln!("cd: {target}: no such file or directory");
            return;
        }
        Err(e) => {
            eprintln!("cd: {target}: {e}");
            return;
        }
    };
    match fs.read_inode(inode_no) {
        Ok(inode) if inode.is_directory() => {
            *cwd = inode_no;
            *cwd_path = path::canonicalize(cwd_path, target);
        }
        Ok(_) => eprintln!("cd: {target}: not a directory"),
        Err(e) => eprintln!("cd: {target}: {e}"),
    }
}

/// The `rename` command.
///
/// The old name may contain spaces: the candidate name grows token by token
/// until a lookup in the current directory succeeds; the rest of the input is
/// the new name.
fn rename(fs: &mut Ext2Fs, cwd: u32, args: &[&str]) {
    let dir = match fs.read_inode(cwd) {
        Ok(inode) => inode,
        Err(e) => {
            eprintln!("rename: {e}");
            return;
        }
    };
    let mut split = None;
    for k in 1..args.len() {
        let candidate = args[..k].join(" ");
        match fs.find_dir_entry(&dir, &candidate) {
            Ok(Some(_)) => {
                split = Some(k);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("rename: {e}");
                return;
            }
        }
    }
    let k = split.unwrap_or(args.len() - 1);
    let old = args[..k].join(" ");
    let new = args[k..].join(" ");
    if let Err(e) = fs.rename(cwd, &old, &new) {
        eprintln!("rename: {old}: {e}");
    }
}

/// Handles a command line; returns `false` when the shell must exit.
fn handle_cmd(line: &str, fs: &mut Ext2Fs, cwd: &mut u32, cwd_path: &mut String) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((cmd, args)) = tokens.split_first() else {
        return true;
    };
    match *cmd {
        "info" => match args {
            [] => print_info(fs),
            _ => eprintln!("usage: info"),
        },

        "print" => match args {
            ["superblock"] => println!("{}", fs.superblock),
            ["inode", n] => print_inode(fs, n),
            ["groups"] => print_groups(fs),
            _ => eprintln!("usage: print superblock | print inode <n> | print groups"),
        },

        "ls" => match args {
            [] => list(fs, *cwd, "."),
            [target] => list(fs, *cwd, target),
            _ => eprintln!("usage: ls [path]"),
        },

        "cd" => match args {
            [target] => change_dir(fs, cwd, cwd_path, target),
            _ => eprintln!("usage: cd <path>"),
        },

        "pwd" => match args {
            [] => println!("{cwd_path}"),
            _ => eprintln!("usage: pwd"),
        },

        "cat" => match args {
            [target] => cat(fs, *cwd, target),
            _ => eprintln!("usage: cat <path>"),
        },

        "attr" => match args {
            [target] => print_attr(fs, *cwd, target),
            _ => eprintln!("usage: attr <path>"),
        },

        "touch" => match args {
            [target] => {
                if let Err(e) = fs.touch(*cwd, target) {
                    eprintln!("touch: {target}: {e}");
                }
            }
            _ => eprintln!("usage: touch <path>"),
        },

        "rm" => match args {
            [target] => {
                if let Err(e) = fs.remove_file(*cwd, target) {
                    eprintln!("rm: {target}: {e}");
                }
            }
            _ => eprintln!("usage: rm <path>"),
        },

        "mkdir" => match args {
            [target] => {
                if let Err(e) = fs.make_dir(*cwd, target) {
                    eprintln!("mkdir: {target}: {e}");
                }
            }
            _ => eprintln!("usage: mkdir <path>"),
        },

        "rmdir" => match args {
            [target] => {
                if let Err(e) = fs.remove_dir(*cwd, target) {
                    eprintln!("rmdir: {target}: {e}");
                }
            }
            _ => eprintln!("usage: rmdir <path>"),
        },

        "rename" => {
            if args.len() >= 2 {
                rename(fs, *cwd, args);
            } else {
                eprintln!("usage: rename <old> <new>");
            }
        }

        "cp" => match args {
            [src, dst] => {
                if let Err(e) = fs.copy_to_host(*cwd, src, Path::new(dst)) {
                    eprintln!("cp: {src}: {e}");
                }
            }
            _ => eprintln!("usage: cp <src> <dst>"),
        },

        "help" => print_cmd_help(),

        "exit" | "quit" => return false,

        _ => eprintln!("{cmd}: unknown command (type 'help' for the list)"),
    }
    true
}

fn main() {
    let mut args = env::args_os();
    args.next();
    let args = parse_args(args);
    if args.help {
        print_help();
        return;
    }
    // Exactly one image
    let [image] = args.images.as_slice() else {
        print_usage();
        exit(1);
    };
    let mut fs = Ext2Fs::open(image)
        .unwrap_or_else(|e| error("e2sh", format_args!("{}: {e}", image.display())));

    let mut cwd = ROOT_INODE;
    let mut cwd_path = String::from("/");
    while let Some(line) = prompt(format_args!("[{cwd_path}]> ")) {
        if !handle_cmd(line.trim(), &mut fs, &mut cwd, &mut cwd_path) {
            break;
        }
    }
}
