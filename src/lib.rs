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

//! A streaming, pull-mode encoder for the catar content-defined archive
//! format.
//!
//! [`Encoder`] turns a live filesystem subtree — or a single regular
//! file, or a block device — into a deterministic byte stream of framed
//! records. It never buffers the whole archive: each [`Encoder::step`]
//! produces at most one record or payload chunk, which the caller pulls
//! through [`Encoder::get_data`] and acknowledges by calling `step`
//! again.
//!
//! Out of scope, by design: block-level chunking, the catalogue/index,
//! compression, network transport, and decoding — all live elsewhere in
//! the wider project this crate's archives feed.

mod encoder;
mod error;
mod flags;
mod node;
mod record;
mod stack;
mod state;

pub use encoder::Encoder;
pub use error::{Error, Result};
pub use flags::{
    FeatureFlags, WITH_DEVICE_NODES, WITH_FIFOS, WITH_PERMISSIONS, WITH_READONLY, WITH_SOCKETS,
    WITH_SYMLINKS, WITH_TIMES_2SEC, WITH_TIMES_NSEC, WITH_TIMES_SEC, WITH_TIMES_USEC,
    WITH_UID_GID_16BIT, WITH_UID_GID_32BIT,
};
pub use stack::NODES_MAX;
pub use state::Signal;
