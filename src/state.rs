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

//! The per-node state and the signal vocabulary the encoder hands back
//! to its caller.
//!
//! A node's [`State`] is meaningful only in light of its kind: a
//! regular file or block device only ever occupies `Init` (while
//! payload remains) and `Eof`; a directory cycles through all six.

/// One node's position in the archive-emission state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Init,
    Hello,
    Entry,
    PostChild,
    Goodbye,
    Eof,
}

/// What a successful [`crate::Encoder::step`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The archive is complete. Sticky: every step after the first one
    /// that returns this also returns this.
    Finished,
    /// A record (or payload chunk) is staged; call `get_data` to pull it.
    Data,
    /// Traversal advanced to a new child; `current_path`/`current_mode`
    /// now reflect it, and a record describing it is staged.
    NextFile,
}
