/*
 * This file is part of catar.
 *
 * catar is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * catar is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * catar. If not, see <https://www.gnu.org/licenses/>.
 */

//! One frame of the traversal stack: an open filesystem object plus
//! whatever has lazily been read out of it (directory entries, a
//! symlink target, a block device's byte size).

use crate::error::{Error, Result};
use crate::record::mode_bits;
use crate::state::State;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

/// A file descriptor that is never closed by [`Node::free`], a concession
/// for callers that hand the encoder stdin/stdout/stderr as its base fd.
const RESERVED_FDS: [RawFd; 3] = [0, 1, 2];

/// Mirrors `struct linux_dirent64` from `getdents64(2)`.
#[repr(C)]
struct LinuxDirent64Header {
    d_ino: u64,
    d_off: u64,
    d_reclen: u16,
    d_type: u8,
}

/// The type bits of a dirent as reported by `d_type`, read before the
/// child is ever opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentType {
    Directory,
    Regular,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Unknown,
}

impl DirentType {
    fn from_d_type(d_type: u8) -> Self {
        match d_type {
            libc::DT_DIR => DirentType::Directory,
            libc::DT_REG => DirentType::Regular,
            libc::DT_LNK => DirentType::Symlink,
            libc::DT_BLK => DirentType::BlockDevice,
            libc::DT_CHR => DirentType::CharDevice,
            libc::DT_FIFO => DirentType::Fifo,
            libc::DT_SOCK => DirentType::Socket,
            _ => DirentType::Unknown,
        }
    }
}

/// One entry of a directory's contents, as discovered by [`Node::read_dirents`].
///
/// `name` keeps the raw bytes `getdents64` returned, not a UTF-8 `String`:
/// the emitted ENTRY name is a bit-exact contract (§4.5/§8), so a
/// non-UTF-8 filename must round-trip unchanged rather than being mangled
/// by a lossy conversion.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub name: OsString,
    pub dtype: DirentType,
}

/// The kind of filesystem object a [`Node`] wraps, derived from its
/// `st_mode` once stat'd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Regular,
    Directory,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Symlink,
}

impl Kind {
    pub fn from_mode(mode: u64) -> Option<Self> {
        match mode & mode_bits::S_IFMT {
            mode_bits::S_IFREG => Some(Kind::Regular),
            mode_bits::S_IFDIR => Some(Kind::Directory),
            mode_bits::S_IFBLK => Some(Kind::BlockDevice),
            mode_bits::S_IFCHR => Some(Kind::CharDevice),
            mode_bits::S_IFIFO => Some(Kind::Fifo),
            mode_bits::S_IFSOCK => Some(Kind::Socket),
            mode_bits::S_IFLNK => Some(Kind::Symlink),
            _ => None,
        }
    }

    pub fn is_openable(&self) -> bool {
        matches!(self, Kind::Regular | Kind::Directory)
    }
}

/// A `fstat`/`fstatat` snapshot, trimmed to the fields the record
/// serializers need.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mode: u64,
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    pub mtime_ns: u64,
    pub rdev_major: u64,
    pub rdev_minor: u64,
}

/// One frame of the traversal stack.
pub struct Node {
    /// Owned descriptor; present only for regular files and directories,
    /// plus the base node when it is a block device.
    pub fd: Option<RawFd>,
    pub kind: Kind,
    pub stat: Stat,
    /// Index, within the *parent's* dirents, of the entry that produced
    /// this node. `0` for the root.
    pub parent_dirent_idx: usize,
    /// This node's own name as a dirent of its parent; `None` for the root.
    /// Raw bytes, not lossily converted (see [`Dirent::name`]).
    pub name: Option<OsString>,
    /// This node's position in the archive-emission state machine.
    /// Meaningful only while `kind` is being processed by the encoder.
    pub state: State,

    dirents: Option<Vec<Dirent>>,
    /// Index of the dirent currently being emitted/entered.
    pub dirent_idx: usize,

    symlink_target: Option<OsString>,
    device_size: Option<u64>,
}

impl Node {
    /// Wraps an already-open, already-`fstat`'d descriptor.
    pub fn new(fd: RawFd, stat: Stat, kind: Kind) -> Self {
        Node {
            fd: Some(fd),
            kind,
            stat,
            parent_dirent_idx: 0,
            name: None,
            state: State::default(),
            dirents: None,
            dirent_idx: 0,
            symlink_target: None,
            device_size: None,
        }
    }

    /// Wraps a child that was only `fstatat`'d, never opened (symlinks,
    /// FIFOs, sockets, device nodes when the parent held the fd).
    pub fn new_unopened(stat: Stat, kind: Kind) -> Self {
        Node {
            fd: None,
            kind,
            stat,
            parent_dirent_idx: 0,
            name: None,
            state: State::default(),
            dirents: None,
            dirent_idx: 0,
            symlink_target: None,
            device_size: None,
        }
    }

    /// Reads this directory's contents via `getdents64(2)`, filtering `.`
    /// and `..` and sorting by byte-wise `strcmp` of the name. Idempotent.
    pub fn read_dirents(&mut self) -> Result<&[Dirent]> {
        if self.dirents.is_none() {
            let fd = self
                .fd
                .ok_or(Error::InvalidArgument("node has no descriptor to read"))?;
            let entries = read_dirents_raw(fd)?;
            self.dirents = Some(entries);
        }
        Ok(self.dirents.as_deref().unwrap())
    }

    pub fn dirents(&self) -> Option<&[Dirent]> {
        self.dirents.as_deref()
    }

    /// Queries a block device for its size, via the 512-byte-sector
    /// `BLKGETSIZE` ioctl. Idempotent. Valid only on block devices.
    pub fn read_device_size(&mut self) -> Result<u64> {
        if self.kind != Kind::BlockDevice {
            return Err(Error::InvalidArgument(
                "device size queried on a non-block-device node",
            ));
        }
        if let Some(size) = self.device_size {
            return Ok(size);
        }
        let fd = self
            .fd
            .ok_or(Error::InvalidArgument("block device node has no descriptor"))?;
        let sectors = blkgetsize(fd)?;
        let size = sectors.saturating_mul(512);
        self.device_size = Some(size);
        Ok(size)
    }

    /// Resolves a symlink's target relative to `parent_fd`, with a
    /// doubling buffer starting at 16 bytes so truncation is never
    /// silently possible. Idempotent. Keeps the target's raw bytes: the
    /// SYMLINK trailer is a bit-exact contract, so a non-UTF-8 target
    /// must not be lossily mangled.
    pub fn read_symlink_target(&mut self, parent_fd: RawFd, name: &OsStr) -> Result<&OsStr> {
        if self.kind != Kind::Symlink {
            return Err(Error::InvalidArgument(
                "symlink target read on a non-symlink node",
            ));
        }
        if self.symlink_target.is_none() {
            let target = readlinkat_grow(parent_fd, name)?;
            self.symlink_target = Some(target);
        }
        Ok(self.symlink_target.as_deref().unwrap())
    }

    /// Returns the symlink target if it has already been resolved by
    /// [`Node::read_symlink_target`].
    pub fn symlink_target(&self) -> Option<&OsStr> {
        self.symlink_target.as_deref()
    }

    /// Closes the owned descriptor (unless reserved), and drops every
    /// lazily-populated cache. Safe to call more than once.
    pub fn free(&mut self) {
        if let Some(fd) = self.fd.take() {
            if !RESERVED_FDS.contains(&fd) {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        self.dirents = None;
        self.dirent_idx = 0;
        self.symlink_target = None;
        self.device_size = None;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.free();
    }
}

fn read_dirents_raw(fd: RawFd) -> Result<Vec<Dirent>> {
    const BUF_SIZE: usize = 32 * 1024;
    let mut buf = vec![0u8; BUF_SIZE];
    let mut entries = Vec::new();
    loop {
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        if n == 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let header = unsafe { &*(buf.as_ptr().add(off) as *const LinuxDirent64Header) };
            let name_ptr = unsafe { buf.as_ptr().add(off + std::mem::size_of::<LinuxDirent64Header>()) };
            let name_bytes = unsafe { CStr::from_ptr(name_ptr as *const i8) }.to_bytes();
            let name = OsStr::from_bytes(name_bytes).to_os_string();
            if name != OsStr::new(".") && name != OsStr::new("..") {
                entries.push(Dirent {
                    name,
                    dtype: DirentType::from_d_type(header.d_type),
                });
            }
            off += header.d_reclen as usize;
        }
    }
    entries.sort_unstable_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    Ok(entries)
}

fn blkgetsize(fd: RawFd) -> Result<u64> {
    // `BLKGETSIZE`: _IO(0x12, 96), returns the device size in 512-byte
    // sectors as an `unsigned long`.
    const BLKGETSIZE: libc::c_ulong = 0x1260;
    let mut sectors: libc::c_ulong = 0;
    let res = unsafe { libc::ioctl(fd, BLKGETSIZE, &mut sectors as *mut libc::c_ulong) };
    if res < 0 {
        return Err(Error::last_os_error());
    }
    Ok(sectors as u64)
}

fn readlinkat_grow(parent_fd: RawFd, name: &OsStr) -> Result<OsString> {
    let cname =
        CString::new(name.as_bytes()).map_err(|_| Error::InvalidArgument("name contains NUL"))?;
    let mut cap = 16usize;
    loop {
        let mut buf = vec![0u8; cap];
        let n = unsafe {
            libc::readlinkat(
                parent_fd,
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        let n = n as usize;
        if n < cap {
            buf.truncate(n);
            return Ok(OsStr::from_bytes(&buf).to_os_string());
        }
        cap *= 2;
    }
}
