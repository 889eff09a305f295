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

//! The resumable, pull-mode state machine that drives a whole encode.
//!
//! `step` is the only thing that moves the machine forward. It always
//! acknowledges whatever `get_data` last handed out (advancing
//! `archive_offset`/`payload_offset` by `step_size`, then clearing it)
//! before computing what comes next. The caller is the scheduler: there
//! is no internal timer or thread, just syscalls performed synchronously
//! inside `step`.

use crate::error::{Error, Result};
use crate::flags::FeatureFlags;
use crate::node::{DirentType, Kind, Node};
use crate::record::{self, EntryFields};
use crate::stack::Stack;
use crate::state::{Signal, State};
use log::{debug, trace};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

/// Bytes read from a regular file or block device per `step`. Large
/// enough to amortize the syscall, small enough to keep the staging
/// buffer bounded regardless of file size.
const PAYLOAD_CHUNK_SIZE: u64 = 64 * 1024;

/// What processing the current leaf (regular file/block device)
/// produced.
enum LeafOutcome {
    Data,
    Finished,
}

/// What processing the current directory produced.
enum DirOutcome {
    Data,
    NextFile,
    /// Traversal descended into a newly-entered child; the caller loop
    /// should re-dispatch on the new current node.
    Descended,
    Finished,
}

/// Turns a filesystem subtree, single regular file, or block device
/// into a deterministic stream of framed catar records.
pub struct Encoder {
    flags: FeatureFlags,
    stack: Stack,
    staging: Vec<u8>,
    step_size: u64,
    archive_offset: u64,
    payload_offset: u64,
    finished: bool,
    /// Whether the most recent `step` left a record staged for `get_data`.
    /// Cleared at the start of every `step`, so a `get_data` called before
    /// the first `step`, or after one that returned `Finished`, is a
    /// sequence violation rather than a silent empty read.
    data_staged: bool,
}

impl Encoder {
    /// Creates an encoder with no feature flags and no base descriptor.
    pub fn new() -> Self {
        Encoder {
            flags: FeatureFlags::default(),
            stack: Stack::new(),
            staging: Vec::new(),
            step_size: 0,
            archive_offset: 0,
            payload_offset: 0,
            finished: false,
            data_staged: false,
        }
    }

    /// Validates and normalizes `raw`, storing the canonical word.
    pub fn set_feature_flags(&mut self, raw: u64) -> Result<()> {
        self.flags = FeatureFlags::new(raw)?;
        Ok(())
    }

    /// The canonical (post-normalization) feature-flag word.
    pub fn get_feature_flags(&self) -> u64 {
        self.flags.bits()
    }

    /// Installs `fd` as the root node. May be called at most once.
    pub fn set_base_fd(&mut self, fd: RawFd) -> Result<()> {
        self.stack.set_base(fd)?;
        self.payload_offset = 0;
        Ok(())
    }

    /// Advances the state machine by one step, first acknowledging
    /// whatever was staged by the previous step.
    pub fn step(&mut self) -> Result<Signal> {
        self.archive_offset += self.step_size;
        self.payload_offset += self.step_size;
        self.step_size = 0;
        self.staging.clear();
        self.data_staged = false;

        if self.finished {
            return Ok(Signal::Finished);
        }
        if self.stack.is_empty() {
            return Err(Error::InvalidArgument(
                "step called before a base descriptor was set",
            ));
        }

        loop {
            let kind = self.stack.current().kind;
            match kind {
                Kind::Regular | Kind::BlockDevice => match self.step_leaf()? {
                    LeafOutcome::Data => {
                        self.data_staged = true;
                        return Ok(Signal::Data);
                    }
                    LeafOutcome::Finished => {
                        if let Some(sig) = self.bubble_up()? {
                            return Ok(sig);
                        }
                        continue;
                    }
                },
                Kind::Directory => match self.step_directory()? {
                    DirOutcome::Data => {
                        self.data_staged = true;
                        return Ok(Signal::Data);
                    }
                    DirOutcome::NextFile => {
                        self.data_staged = true;
                        return Ok(Signal::NextFile);
                    }
                    DirOutcome::Descended => continue,
                    DirOutcome::Finished => {
                        if let Some(sig) = self.bubble_up()? {
                            return Ok(sig);
                        }
                        continue;
                    }
                },
                _ => {
                    return Err(Error::UnsupportedNodeKind(
                        "current node kind cannot be driven by step",
                    ))
                }
            }
        }
    }

    /// Rises to the parent of the current node. Returns `Ok(None)` when
    /// there was a parent to rise to (the directory loop should
    /// continue); returns `Ok(Some(Signal::Finished))`, terminal and
    /// sticky, once the root itself is exhausted.
    fn bubble_up(&mut self) -> Result<Option<Signal>> {
        if !self.stack.leave_child() {
            self.stack.forget_children();
            self.finished = true;
            trace!("archive complete, {} bytes", self.archive_offset);
            return Ok(Some(Signal::Finished));
        }
        self.stack.current_mut().state = State::PostChild;
        Ok(None)
    }

    fn step_leaf(&mut self) -> Result<LeafOutcome> {
        let total_size = {
            let node = self.stack.current_mut();
            match node.kind {
                Kind::Regular => node.stat.size,
                Kind::BlockDevice => node.read_device_size()?,
                _ => unreachable!("step_leaf only called for regular files and block devices"),
            }
        };
        if self.payload_offset >= total_size {
            return Ok(LeafOutcome::Finished);
        }
        let remaining = total_size - self.payload_offset;
        let want = remaining.min(PAYLOAD_CHUNK_SIZE) as usize;
        let fd = self
            .stack
            .current()
            .fd
            .ok_or(Error::InvalidArgument("leaf node has no descriptor"))?;
        let mut buf = vec![0u8; want];
        pread_exact(fd, &mut buf, self.payload_offset)?;
        self.staging = buf;
        self.step_size = want as u64;
        Ok(LeafOutcome::Data)
    }

    fn step_directory(&mut self) -> Result<DirOutcome> {
        self.stack.current_mut().read_dirents()?;
        let state = self.stack.current().state;
        match state {
            State::Init => {
                self.staging = record::hello(&self.flags);
                self.step_size = self.staging.len() as u64;
                self.stack.current_mut().state = State::Hello;
                Ok(DirOutcome::Data)
            }
            State::Entry => {
                let dirent_idx = self.stack.current().dirent_idx;
                let dtype = self.stack.current().dirents().unwrap()[dirent_idx].dtype;
                if matches!(dtype, DirentType::Directory | DirentType::Regular) {
                    self.stack.enter_child()?;
                    self.payload_offset = 0;
                    // HELLO is an archive-global header, not a per-directory
                    // one (§4.5): only the root ever runs the Init->Hello
                    // transition that emits it. A directory entered as a
                    // child starts directly at child enumeration; its
                    // header is the ENTRY its parent already emitted.
                    let entered_is_dir = self.stack.current().kind == Kind::Directory;
                    self.stack.current_mut().state = if entered_is_dir {
                        State::Hello
                    } else {
                        State::Init
                    };
                    debug!("descend into {:?}", self.stack.current().name);
                    Ok(DirOutcome::Descended)
                } else {
                    self.stack.current_mut().state = State::PostChild;
                    Ok(DirOutcome::Descended)
                }
            }
            State::PostChild => {
                self.stack.current_mut().dirent_idx += 1;
                self.stack.current_mut().state = State::Hello;
                Ok(DirOutcome::Descended)
            }
            State::Hello => {
                let no_more = {
                    let node = self.stack.current();
                    node.dirent_idx >= node.dirents().unwrap().len()
                };
                if no_more {
                    self.staging = record::goodbye();
                    self.step_size = self.staging.len() as u64;
                    self.stack.current_mut().state = State::Goodbye;
                    Ok(DirOutcome::Data)
                } else {
                    let dirent_idx = self.stack.current().dirent_idx;
                    self.stack.init_child()?;
                    self.stack.open_child(dirent_idx, &self.flags)?;
                    self.stage_entry_record()?;
                    self.stack.current_mut().state = State::Entry;
                    Ok(DirOutcome::NextFile)
                }
            }
            State::Goodbye => {
                self.stack.current_mut().state = State::Eof;
                Ok(DirOutcome::Finished)
            }
            State::Eof => Ok(DirOutcome::Finished),
        }
    }

    /// Builds the ENTRY record (+ type-specific trailer) for the child
    /// most recently pushed by `open_child`, and stages it.
    fn stage_entry_record(&mut self) -> Result<()> {
        let child_idx = self.stack.node_idx + 1;
        let (name, mode, uid, gid, mtime_ns, kind, size, rdev_major, rdev_minor) = {
            let child = self
                .stack
                .node(child_idx)
                .expect("open_child just pushed this node");
            let name = child
                .name
                .clone()
                .expect("open_child always sets the child's name");
            reject_sentinel_ids(child.stat.uid, child.stat.gid)?;
            let is_symlink = child.kind == Kind::Symlink;
            let is_dir = child.kind == Kind::Directory;
            let mode = record::encode_mode(is_symlink, child.stat.mode, is_dir, &self.flags);
            let (uid, gid) = record::encode_uid_gid(child.stat.uid, child.stat.gid, &self.flags)?;
            let mtime_ns = record::truncate_mtime(child.stat.mtime_ns, self.flags.time_granularity_ns());
            (
                name,
                mode,
                uid,
                gid,
                mtime_ns,
                child.kind,
                child.stat.size,
                child.stat.rdev_major,
                child.stat.rdev_minor,
            )
        };
        let mut buf = record::entry(&EntryFields {
            name: name.as_bytes(),
            mode,
            uid,
            gid,
            mtime_ns,
        });
        match kind {
            Kind::Regular => buf.extend(record::payload_trailer(size)),
            Kind::Symlink => {
                let target = self
                    .stack
                    .node(child_idx)
                    .and_then(Node::symlink_target)
                    .map(|t| t.as_bytes().to_vec())
                    .unwrap_or_default();
                buf.extend(record::symlink_trailer(&target));
            }
            Kind::BlockDevice | Kind::CharDevice => {
                buf.extend(record::device_trailer(rdev_major, rdev_minor));
            }
            Kind::Directory | Kind::Fifo | Kind::Socket => {}
        }
        self.step_size = buf.len() as u64;
        self.staging = buf;
        Ok(())
    }

    /// The bytes currently staged. Idempotent until the next `step`. Fails
    /// with `SequenceViolation` if called before the first `step`, or
    /// after a `step` that returned `Finished` with nothing newly staged.
    pub fn get_data(&self) -> Result<&[u8]> {
        if !self.data_staged {
            return Err(Error::SequenceViolation(
                "get_data called with no record staged",
            ));
        }
        Ok(&self.staging)
    }

    /// Joins dirent names from the root downward with `/`. Fails when
    /// the base itself is not a directory — a single-file or
    /// block-device archive has no path to report.
    ///
    /// Includes the child staged one above `node_idx` (the same child
    /// [`Encoder::current_mode`] reaches), so a path reported alongside
    /// `NextFile` reflects the child just announced, not just the
    /// directory currently being enumerated.
    pub fn current_path(&self) -> Result<String> {
        if self.stack.node(0).map(|n| n.kind) != Some(Kind::Directory) {
            return Err(Error::InvalidArgument("not a directory"));
        }
        let upper = if self.stack.node(self.stack.node_idx + 1).is_some() {
            self.stack.node_idx + 1
        } else {
            self.stack.node_idx
        };
        let mut parts = Vec::new();
        for idx in 1..=upper {
            if let Some(node) = self.stack.node(idx) {
                if let Some(name) = &node.name {
                    // Names are kept as raw bytes for the wire format (see
                    // `record::EntryFields`); this display-only path is the
                    // one place a lossy conversion is acceptable.
                    parts.push(name.to_string_lossy().into_owned());
                }
            }
        }
        Ok(parts.join("/"))
    }

    /// The mode of the child currently being emitted (while an ENTRY is
    /// staged but not yet entered), else the mode of the current node.
    pub fn current_mode(&self) -> u64 {
        let node = match self.stack.node(self.stack.node_idx + 1) {
            Some(child) => child,
            None => self.stack.current(),
        };
        let is_symlink = node.kind == Kind::Symlink;
        let is_dir = node.kind == Kind::Directory;
        record::encode_mode(is_symlink, node.stat.mode, is_dir, &self.flags)
    }

    /// Position inside the current leaf's payload (regular file or
    /// block device only).
    pub fn current_payload_offset(&self) -> u64 {
        self.payload_offset
    }

    /// Cumulative bytes emitted into the archive so far.
    pub fn current_archive_offset(&self) -> u64 {
        self.archive_offset
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn reject_sentinel_ids(uid: u64, gid: u64) -> Result<()> {
    let is_sentinel = |v: u64| v == u16::MAX as u64 || v == u32::MAX as u64;
    if is_sentinel(uid) || is_sentinel(gid) {
        return Err(Error::InvalidArgument(
            "uid or gid equals a reserved sentinel value",
        ));
    }
    Ok(())
}

/// Reads exactly `buf.len()` bytes at `offset` via `pread`. A short read
/// is treated as an I/O error rather than retried: the stat-reported
/// size is a contract the filesystem is expected to honor.
fn pread_exact(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(Error::last_os_error());
    }
    if n as usize != buf.len() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read: fewer bytes than the stat-reported size",
        )));
    }
    Ok(())
}
