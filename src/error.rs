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

//! Error taxonomy for the encoder.
//!
//! Every fallible entry point returns [`Result<T>`]. Errors are not retried
//! internally and do not roll back encoder state; once one is returned, the
//! caller should drop the [`crate::Encoder`] rather than keep stepping it.

use std::io;
use thiserror::Error;

/// Result alias for fallible encoder operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The abstract error kinds an [`crate::Encoder`] can report.
#[derive(Debug, Error)]
pub enum Error {
    /// Null handle, out-of-range value, or a call made in the wrong state.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `set_base_fd` called after the root node was already installed.
    #[error("encoder is busy: base descriptor already set")]
    Busy,

    /// The base or a child is not one of regular/directory/block/char/fifo/
    /// socket/symlink, or the active feature flags forbid its kind.
    #[error("unsupported node kind: {0}")]
    UnsupportedNodeKind(&'static str),

    /// The feature-flag word contains bits outside the defined union.
    #[error("unsupported feature flag bits: {0:#x}")]
    UnsupportedFeatureFlag(u64),

    /// The tree requires a field the active flags exclude (wide uid/gid,
    /// symlinks, device nodes, FIFOs, sockets).
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(&'static str),

    /// Traversal would exceed the fixed node-stack depth.
    #[error("depth exceeded: tree is deeper than the {0}-node stack")]
    DepthExceeded(usize),

    /// `get_data` called with nothing staged, or in a state where the
    /// current node kind cannot produce the requested record.
    #[error("sequence violation: {0}")]
    SequenceViolation(&'static str),

    /// An underlying syscall failed; the OS error is preserved.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps the last OS error as an [`Error::Io`], the way
    /// `inttest::util` turns a negative `libc` return code into an
    /// [`io::Error`].
    pub(crate) fn last_os_error() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}
