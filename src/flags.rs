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

//! Feature-flag word: the 64-bit switchboard selecting which optional
//! fields appear in emitted records.

use crate::error::{Error, Result};

/// Narrow ownership-field width (16-bit uid/gid).
pub const WITH_UID_GID_16BIT: u64 = 1 << 0;
/// Wide ownership-field width (32-bit uid/gid). Supersedes the 16-bit bit.
pub const WITH_UID_GID_32BIT: u64 = 1 << 1;
/// Nanosecond-resolution mtimes.
pub const WITH_TIMES_NSEC: u64 = 1 << 2;
/// Microsecond-resolution mtimes.
pub const WITH_TIMES_USEC: u64 = 1 << 3;
/// One-second-resolution mtimes.
pub const WITH_TIMES_SEC: u64 = 1 << 4;
/// Two-second-resolution mtimes (FAT-style).
pub const WITH_TIMES_2SEC: u64 = 1 << 5;
/// Full permission bits (`S_IFMT | 07777`).
pub const WITH_PERMISSIONS: u64 = 1 << 6;
/// Collapsed read-only/read-write permission bit.
pub const WITH_READONLY: u64 = 1 << 7;
/// Symbolic links may appear as children.
pub const WITH_SYMLINKS: u64 = 1 << 8;
/// Block/char device nodes may appear as children.
pub const WITH_DEVICE_NODES: u64 = 1 << 9;
/// FIFOs may appear as children.
pub const WITH_FIFOS: u64 = 1 << 10;
/// Sockets may appear as children.
pub const WITH_SOCKETS: u64 = 1 << 11;

/// The union of every bit this crate recognizes; anything outside this
/// mask is rejected by [`FeatureFlags::new`].
const KNOWN_MASK: u64 = WITH_UID_GID_16BIT
    | WITH_UID_GID_32BIT
    | WITH_TIMES_NSEC
    | WITH_TIMES_USEC
    | WITH_TIMES_SEC
    | WITH_TIMES_2SEC
    | WITH_PERMISSIONS
    | WITH_READONLY
    | WITH_SYMLINKS
    | WITH_DEVICE_NODES
    | WITH_FIFOS
    | WITH_SOCKETS;

/// A validated, normalized feature-flag word plus its derived time
/// granularity.
///
/// Construction rejects unknown bits; after that, precedence rules are
/// applied atomically so that the stored word is always canonical — the
/// getter never hands back the raw, pre-normalization input.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    canonical: u64,
    granularity_ns: u64,
}

impl FeatureFlags {
    /// Validates `raw` and normalizes it per the precedence rules:
    /// 32-bit uid/gid supersedes 16-bit; finer time resolution supersedes
    /// coarser; full permissions supersede the collapsed read-only bit.
    pub fn new(raw: u64) -> Result<Self> {
        let unknown = raw & !KNOWN_MASK;
        if unknown != 0 {
            return Err(Error::UnsupportedFeatureFlag(unknown));
        }
        let mut canonical = raw;
        if canonical & WITH_UID_GID_32BIT != 0 {
            canonical &= !WITH_UID_GID_16BIT;
        }
        if canonical & WITH_PERMISSIONS != 0 {
            canonical &= !WITH_READONLY;
        }
        let granularity_ns = if canonical & WITH_TIMES_NSEC != 0 {
            canonical &= !(WITH_TIMES_USEC | WITH_TIMES_SEC | WITH_TIMES_2SEC);
            1
        } else if canonical & WITH_TIMES_USEC != 0 {
            canonical &= !(WITH_TIMES_SEC | WITH_TIMES_2SEC);
            1_000
        } else if canonical & WITH_TIMES_SEC != 0 {
            canonical &= !WITH_TIMES_2SEC;
            1_000_000_000
        } else if canonical & WITH_TIMES_2SEC != 0 {
            2_000_000_000
        } else {
            0
        };
        Ok(Self {
            canonical,
            granularity_ns,
        })
    }

    /// The canonical, post-normalization flag word.
    pub fn bits(&self) -> u64 {
        self.canonical
    }

    /// The derived mtime truncation granularity, in nanoseconds (0 if no
    /// time bit is set).
    pub fn time_granularity_ns(&self) -> u64 {
        self.granularity_ns
    }

    pub fn contains(&self, bit: u64) -> bool {
        self.canonical & bit != 0
    }
}
