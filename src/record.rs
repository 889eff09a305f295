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

//! Bit-exact byte layout of the records that make up a catar archive.
//!
//! All integers are little-endian. Every record starts with the 16-byte
//! framing header `{type: u64, size: u64}`, `size` counting the header
//! itself.

use crate::error::{Error, Result};
use crate::flags::{FeatureFlags, WITH_PERMISSIONS, WITH_READONLY, WITH_UID_GID_16BIT, WITH_UID_GID_32BIT};

/// Size in bytes of the `{type, size}` framing header shared by every
/// record.
pub const HEADER_SIZE: u64 = 16;

/// Record type: directory/archive root marker.
pub const CA_FORMAT_HELLO: u64 = 0x1396_fabf_4041_0c30;
/// Record type: one child directory entry.
pub const CA_FORMAT_ENTRY: u64 = 0x1396_fabf_4032_0c30;
/// Record type: raw file payload announcement.
pub const CA_FORMAT_PAYLOAD: u64 = 0x1396_fabf_4033_0c30;
/// Record type: symlink target.
pub const CA_FORMAT_SYMLINK: u64 = 0x1396_fabf_4034_0c30;
/// Record type: device major/minor.
pub const CA_FORMAT_DEVICE: u64 = 0x1396_fabf_4035_0c30;
/// Record type: end-of-directory marker.
pub const CA_FORMAT_GOODBYE: u64 = 0x1396_fabf_4036_0c30;

/// Magic stored in HELLO's `uuid_part2` field, identifying the catar
/// format to a downstream decoder.
pub const CATAR_FORMAT_MAGIC: u64 = 0x9411_3577_a3c4_ca72;

/// File type bits recognized in ENTRY's `mode` field (POSIX `S_IFMT`
/// family).
pub mod mode_bits {
    pub const S_IFMT: u64 = 0o170000;
    pub const S_IFSOCK: u64 = 0o140000;
    pub const S_IFLNK: u64 = 0o120000;
    pub const S_IFREG: u64 = 0o100000;
    pub const S_IFBLK: u64 = 0o060000;
    pub const S_IFDIR: u64 = 0o040000;
    pub const S_IFCHR: u64 = 0o020000;
    pub const S_IFIFO: u64 = 0o010000;
}

fn push_header(buf: &mut Vec<u8>, record_type: u64, size: u64) {
    buf.extend_from_slice(&record_type.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
}

/// Serializes the once-per-archive HELLO record (32 bytes total).
pub fn hello(flags: &FeatureFlags) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    push_header(&mut buf, CA_FORMAT_HELLO, 32);
    buf.extend_from_slice(&CATAR_FORMAT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&flags.bits().to_le_bytes());
    buf
}

/// Encodes a child's mode field per §4.5:
/// - symlinks are forced to `S_IFLNK | 0777`
/// - `WITH_PERMISSIONS` keeps the type bits and the low 12 permission bits
/// - else `WITH_READONLY` collapses to a binary read-only/read-write mode
/// - else only the type bits survive
pub fn encode_mode(is_symlink: bool, raw_mode: u64, is_dir: bool, flags: &FeatureFlags) -> u64 {
    use mode_bits::*;
    if is_symlink {
        return S_IFLNK | 0o777;
    }
    let type_bits = raw_mode & S_IFMT;
    if flags.contains(WITH_PERMISSIONS) {
        type_bits | (raw_mode & 0o7777)
    } else if flags.contains(WITH_READONLY) {
        let owner_write = raw_mode & 0o200 != 0;
        let perm = match (is_dir, owner_write) {
            (true, true) => 0o777,
            (true, false) => 0o555,
            (false, true) => 0o666,
            (false, false) => 0o444,
        };
        type_bits | perm
    } else {
        type_bits
    }
}

/// Encodes a child's uid/gid pair per §4.5's width rules, rejecting
/// values that cannot fit in the active width.
pub fn encode_uid_gid(uid: u64, gid: u64, flags: &FeatureFlags) -> Result<(u64, u64)> {
    if flags.contains(WITH_UID_GID_16BIT) {
        if uid > u16::MAX as u64 || gid > u16::MAX as u64 {
            return Err(Error::ProtocolNotSupported(
                "uid/gid exceed 16-bit width under WITH_UID_GID_16BIT",
            ));
        }
        Ok((uid, gid))
    } else if flags.contains(WITH_UID_GID_32BIT) {
        Ok((uid, gid))
    } else {
        Ok((0, 0))
    }
}

/// Truncates `mtime_ns` down to the active time granularity. A
/// granularity of 0 (no time bit set) truncates to 0.
pub fn truncate_mtime(mtime_ns: u64, granularity_ns: u64) -> u64 {
    if granularity_ns == 0 {
        0
    } else {
        (mtime_ns / granularity_ns) * granularity_ns
    }
}

/// Fields needed to serialize one ENTRY record, already resolved by the
/// caller (mode/uid/gid/mtime encoding rules already applied).
///
/// `name` is the dirent's raw bytes, not a UTF-8 `&str`: the emitted name
/// is a bit-exact contract (§4.5/§8), so a non-UTF-8 filename must
/// round-trip through this serializer unchanged.
pub struct EntryFields<'a> {
    pub name: &'a [u8],
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub mtime_ns: u64,
}

/// Serializes an ENTRY record: header, mode/flags/uid/gid/mtime, then the
/// null-terminated name. Size is `offsetof(name) + strlen(name) + 1`.
pub fn entry(fields: &EntryFields) -> Vec<u8> {
    const FIXED_FIELDS: u64 = 8 * 5; // mode, flags, uid, gid, mtime
    let name_len = fields.name.len() as u64;
    let size = HEADER_SIZE + FIXED_FIELDS + name_len + 1;
    let mut buf = Vec::with_capacity(size as usize);
    push_header(&mut buf, CA_FORMAT_ENTRY, size);
    buf.extend_from_slice(&fields.mode.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // flags: reserved
    buf.extend_from_slice(&fields.uid.to_le_bytes());
    buf.extend_from_slice(&fields.gid.to_le_bytes());
    buf.extend_from_slice(&fields.mtime_ns.to_le_bytes());
    buf.extend_from_slice(fields.name);
    buf.push(0);
    buf
}

/// Serializes the PAYLOAD trailer: framing header only, `size` covering
/// the header plus the file bytes that will follow as raw payload
/// (emitted separately, not by this function).
pub fn payload_trailer(payload_len: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    push_header(&mut buf, CA_FORMAT_PAYLOAD, HEADER_SIZE + payload_len);
    buf
}

/// Serializes the SYMLINK trailer: header + null-terminated target. Raw
/// bytes, not a UTF-8 `&str` — same bit-exact-contract reasoning as
/// [`EntryFields::name`].
pub fn symlink_trailer(target: &[u8]) -> Vec<u8> {
    let size = HEADER_SIZE + target.len() as u64 + 1;
    let mut buf = Vec::with_capacity(size as usize);
    push_header(&mut buf, CA_FORMAT_SYMLINK, size);
    buf.extend_from_slice(target);
    buf.push(0);
    buf
}

/// Serializes the DEVICE trailer: header + `major: u64` + `minor: u64`.
pub fn device_trailer(major: u64, minor: u64) -> Vec<u8> {
    let size = HEADER_SIZE + 16;
    let mut buf = Vec::with_capacity(size as usize);
    push_header(&mut buf, CA_FORMAT_DEVICE, size);
    buf.extend_from_slice(&major.to_le_bytes());
    buf.extend_from_slice(&minor.to_le_bytes());
    buf
}

/// Serializes the GOODBYE record: header + a single-entry table equal to
/// the header's own size (this encoder does not populate a real
/// per-child offset index — see the format's open question).
pub fn goodbye() -> Vec<u8> {
    let size = HEADER_SIZE + 8;
    let mut buf = Vec::with_capacity(size as usize);
    push_header(&mut buf, CA_FORMAT_GOODBYE, size);
    buf.extend_from_slice(&size.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{FeatureFlags, WITH_PERMISSIONS, WITH_UID_GID_32BIT};

    #[test]
    fn hello_is_32_bytes() {
        let flags = FeatureFlags::new(WITH_UID_GID_32BIT).unwrap();
        let bytes = hello(&flags);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..8], &CA_FORMAT_HELLO.to_le_bytes());
        assert_eq!(&bytes[8..16], &32u64.to_le_bytes());
    }

    #[test]
    fn entry_size_matches_name() {
        let fields = EntryFields {
            name: b"a",
            mode: 0o100644,
            uid: 0,
            gid: 0,
            mtime_ns: 0,
        };
        let bytes = entry(&fields);
        assert_eq!(bytes.len(), 16 + 40 + 1 + 1);
        let size = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        assert_eq!(size, bytes.len() as u64);
    }

    #[test]
    fn symlink_mode_ignores_permission_bits() {
        let flags = FeatureFlags::new(WITH_PERMISSIONS).unwrap();
        let mode = encode_mode(true, 0o100644, false, &flags);
        assert_eq!(mode, mode_bits::S_IFLNK | 0o777);
    }

    #[test]
    fn readonly_collapses_directory_permissions() {
        let flags = FeatureFlags::new(crate::flags::WITH_READONLY).unwrap();
        let writable_dir = encode_mode(false, mode_bits::S_IFDIR | 0o755, true, &flags);
        assert_eq!(writable_dir, mode_bits::S_IFDIR | 0o777);
        let readonly_dir = encode_mode(false, mode_bits::S_IFDIR | 0o555, true, &flags);
        assert_eq!(readonly_dir, mode_bits::S_IFDIR | 0o555);
    }

    #[test]
    fn uid_gid_16bit_rejects_overflow() {
        let flags = FeatureFlags::new(crate::flags::WITH_UID_GID_16BIT).unwrap();
        let err = encode_uid_gid(70_000, 0, &flags).unwrap_err();
        assert!(matches!(err, Error::ProtocolNotSupported(_)));
    }

    #[test]
    fn mtime_truncation() {
        let ns = 1_500_000_123;
        assert_eq!(truncate_mtime(ns, 1), ns);
        assert_eq!(truncate_mtime(ns, 1_000_000_000), 1_000_000_000);
        assert_eq!(truncate_mtime(ns, 2_000_000_000), 0);
        assert_eq!(truncate_mtime(ns, 0), 0);
    }

    #[test]
    fn no_flags_means_zero_uid_gid() {
        let flags = FeatureFlags::new(0).unwrap();
        assert_eq!(encode_uid_gid(12, 34, &flags).unwrap(), (0, 0));
    }

    #[test]
    fn goodbye_table_entry_equals_header_size() {
        let bytes = goodbye();
        assert_eq!(bytes.len(), 24);
        let size = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let table0 = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        assert_eq!(size, table0);
    }
}
