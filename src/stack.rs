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

//! The bounded depth-first traversal stack.
//!
//! The stack is an array of [`Node`]s with a `node_idx` cursor marking
//! the *current* node; entries above it are children that have been
//! prepared (`init_child`/`open_child`) but not necessarily entered yet.
//! This gives deterministic LIFO teardown and lets a directory's "open,
//! emit ENTRY, then decide whether to descend" pattern initialize and
//! later discard a sibling without ever entering it.

use crate::error::{Error, Result};
use crate::flags::{FeatureFlags, WITH_DEVICE_NODES, WITH_FIFOS, WITH_SOCKETS, WITH_SYMLINKS};
use crate::node::{Dirent, DirentType, Kind, Node, Stat};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

/// Compile-time ceiling on traversal depth. Exceeding it fails the whole
/// operation rather than growing unbounded.
pub const NODES_MAX: usize = 128;

/// The bounded traversal stack.
pub struct Stack {
    nodes: Vec<Node>,
    pub node_idx: usize,
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            nodes: Vec::new(),
            node_idx: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn current(&self) -> &Node {
        &self.nodes[self.node_idx]
    }

    pub fn current_mut(&mut self) -> &mut Node {
        &mut self.nodes[self.node_idx]
    }

    pub fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    /// Populates the root node from an externally supplied descriptor.
    /// Allowed only while the stack is empty; rejects anything that is
    /// not a regular file, directory, or block device.
    pub fn set_base(&mut self, fd: RawFd) -> Result<()> {
        if !self.nodes.is_empty() {
            return Err(Error::Busy);
        }
        let stat = fstat_fd(fd)?;
        let kind = Kind::from_mode(stat.mode)
            .ok_or(Error::UnsupportedNodeKind("base descriptor has an unrecognized mode"))?;
        if !matches!(kind, Kind::Regular | Kind::Directory | Kind::BlockDevice) {
            return Err(Error::UnsupportedNodeKind(
                "base descriptor must be a regular file, directory, or block device",
            ));
        }
        self.nodes.push(Node::new(fd, stat, kind));
        self.node_idx = 0;
        Ok(())
    }

    /// Discards any stale nodes deeper than the current index (siblings
    /// prepared but never entered), then checks the depth ceiling.
    pub fn init_child(&mut self) -> Result<()> {
        self.nodes.truncate(self.node_idx + 1);
        if self.nodes.len() >= NODES_MAX {
            return Err(Error::DepthExceeded(NODES_MAX));
        }
        Ok(())
    }

    /// Opens the dirent at `dirent_idx` of the current (directory) node
    /// and pushes the resulting [`Node`] above it. Must be preceded by a
    /// successful [`Stack::init_child`].
    pub fn open_child(&mut self, dirent_idx: usize, flags: &FeatureFlags) -> Result<()> {
        let parent_fd = self
            .current()
            .fd
            .ok_or(Error::InvalidArgument("current node has no descriptor"))?;
        let dirent = self
            .current()
            .dirents()
            .and_then(|d| d.get(dirent_idx))
            .ok_or(Error::InvalidArgument("dirent index out of range"))?
            .clone();
        let (fd, stat, kind) = open_child_raw(parent_fd, &dirent, flags)?;
        let mut node = match fd {
            Some(fd) => Node::new(fd, stat, kind),
            None => Node::new_unopened(stat, kind),
        };
        node.parent_dirent_idx = dirent_idx;
        node.name = Some(dirent.name.clone());
        if kind == Kind::Symlink {
            node.read_symlink_target(parent_fd, &dirent.name)?;
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Advances `node_idx` onto the node most recently prepared by
    /// [`Stack::open_child`]. Requires that node to be a regular file or
    /// directory with a valid descriptor.
    pub fn enter_child(&mut self) -> Result<()> {
        let next_idx = self.node_idx + 1;
        let next = self
            .nodes
            .get(next_idx)
            .ok_or(Error::InvalidArgument("no prepared child to enter"))?;
        if !next.kind.is_openable() || next.fd.is_none() {
            return Err(Error::InvalidArgument(
                "child is not an openable regular file or directory",
            ));
        }
        self.node_idx = next_idx;
        Ok(())
    }

    /// Decrements `node_idx`, returning whether the stack had anywhere to
    /// rise to.
    pub fn leave_child(&mut self) -> bool {
        if self.node_idx == 0 {
            return false;
        }
        self.node_idx -= 1;
        true
    }

    /// Frees and drops every node above the current index.
    pub fn forget_children(&mut self) {
        self.nodes.truncate(self.node_idx + 1);
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

fn fstat_fd(fd: RawFd) -> Result<Stat> {
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut st) < 0 {
            return Err(Error::last_os_error());
        }
        Ok(stat_from_libc(&st))
    }
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CString) -> Result<Stat> {
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        let res = libc::fstatat(
            parent_fd,
            name.as_ptr(),
            &mut st,
            libc::AT_SYMLINK_NOFOLLOW,
        );
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(stat_from_libc(&st))
    }
}

fn stat_from_libc(st: &libc::stat) -> Stat {
    Stat {
        mode: st.st_mode as u64,
        size: st.st_size as u64,
        uid: st.st_uid as u64,
        gid: st.st_gid as u64,
        mtime_ns: (st.st_mtime as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(st.st_mtime_nsec as u64),
        rdev_major: unsafe { libc::major(st.st_rdev as libc::dev_t) } as u64,
        rdev_minor: unsafe { libc::minor(st.st_rdev as libc::dev_t) } as u64,
    }
}

/// Opens or stats one child of `parent_fd`, per §4.3:
/// - DIR/REG dirents are opened directly with
///   `O_RDONLY|O_CLOEXEC|O_NOCTTY|O_NOFOLLOW` (+`O_DIRECTORY`), then
///   `fstat`'d to confirm the type; `O_NOFOLLOW` defends against a race
///   where a plain-typed dirent becomes a symlink between `readdir` and
///   `open`.
/// - anything else is `fstatat(AT_SYMLINK_NOFOLLOW)`'d first; if that
///   reveals a regular file or directory after all, it is then opened
///   the same way. Otherwise it is left unopened — its stat is enough.
fn open_child_raw(
    parent_fd: RawFd,
    dirent: &Dirent,
    flags: &FeatureFlags,
) -> Result<(Option<RawFd>, Stat, Kind)> {
    let cname = CString::new(dirent.name.as_bytes())
        .map_err(|_| Error::InvalidArgument("dirent name contains NUL"))?;
    match dirent.dtype {
        DirentType::Directory | DirentType::Regular => {
            let (fd, stat, kind) = open_regular_or_dir(parent_fd, &cname, dirent.dtype)?;
            Ok((Some(fd), stat, kind))
        }
        _ => {
            let stat = fstatat_nofollow(parent_fd, &cname)?;
            let kind = Kind::from_mode(stat.mode)
                .ok_or(Error::UnsupportedNodeKind("child has an unrecognized mode"))?;
            check_kind_allowed(kind, flags)?;
            match kind {
                Kind::Directory | Kind::Regular => {
                    let (fd, stat, kind) = open_regular_or_dir(parent_fd, &cname, dirent.dtype)?;
                    Ok((Some(fd), stat, kind))
                }
                _ => Ok((None, stat, kind)),
            }
        }
    }
}

fn open_regular_or_dir(
    parent_fd: RawFd,
    cname: &CString,
    hint: DirentType,
) -> Result<(RawFd, Stat, Kind)> {
    let mut oflags = libc::O_RDONLY | libc::O_CLOEXEC | libc::O_NOCTTY | libc::O_NOFOLLOW;
    if hint == DirentType::Directory {
        oflags |= libc::O_DIRECTORY;
    }
    let fd = unsafe { libc::openat(parent_fd, cname.as_ptr(), oflags) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let stat = match fstat_fd(fd) {
        Ok(s) => s,
        Err(e) => {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
    };
    let kind = Kind::from_mode(stat.mode);
    match kind {
        Some(Kind::Directory) | Some(Kind::Regular) => Ok((fd, stat, kind.unwrap())),
        _ => {
            unsafe {
                libc::close(fd);
            }
            Err(Error::UnsupportedNodeKind(
                "dirent type changed between readdir and open",
            ))
        }
    }
}

/// Rejects a child kind the active feature flags do not allow.
fn check_kind_allowed(kind: Kind, flags: &FeatureFlags) -> Result<()> {
    let ok = match kind {
        Kind::Regular | Kind::Directory => true,
        Kind::Symlink => flags.contains(WITH_SYMLINKS),
        Kind::BlockDevice | Kind::CharDevice => flags.contains(WITH_DEVICE_NODES),
        Kind::Fifo => flags.contains(WITH_FIFOS),
        Kind::Socket => flags.contains(WITH_SOCKETS),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::ProtocolNotSupported(match kind {
            Kind::Symlink => "symlink present but WITH_SYMLINKS is not set",
            Kind::BlockDevice | Kind::CharDevice => {
                "device node present but WITH_DEVICE_NODES is not set"
            }
            Kind::Fifo => "FIFO present but WITH_FIFOS is not set",
            Kind::Socket => "socket present but WITH_SOCKETS is not set",
            _ => unreachable!(),
        }))
    }
}
