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

//! End-to-end coverage of the encoder driven against a real filesystem
//! tree under a temporary directory.

use catar::{
    Encoder, Error, Signal, WITH_DEVICE_NODES, WITH_FIFOS, WITH_PERMISSIONS, WITH_SYMLINKS,
    WITH_TIMES_NSEC, WITH_UID_GID_16BIT, WITH_UID_GID_32BIT,
};
use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::io::IntoRawFd;
use tempfile::tempdir;

/// Drains an encoder to completion, returning the concatenated archive
/// bytes. Acknowledges every step by calling `step` again, as the pull
/// protocol requires.
fn drain(enc: &mut Encoder) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let sig = enc.step().expect("step should not fail");
        match sig {
            Signal::Finished => break,
            Signal::Data | Signal::NextFile => {
                out.extend_from_slice(enc.get_data().expect("data should be staged"));
            }
        }
    }
    out
}

fn open_dir(path: &std::path::Path) -> fs::File {
    fs::File::open(path).unwrap()
}

#[test]
fn empty_directory_emits_only_hello_and_goodbye() {
    let dir = tempdir().unwrap();
    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let bytes = drain(&mut enc);
    assert_eq!(bytes.len(), 32 + 24);
    assert_eq!(enc.current_archive_offset(), bytes.len() as u64);
}

#[test]
fn nested_directory_emits_exactly_one_hello_record() {
    // HELLO is archive-global (§4.5: "directory root, once per encoder"),
    // not per-directory: a subdirectory's header is the ENTRY its parent
    // already emitted. Pin the exact byte count for a tree one level
    // deep so a second, spurious HELLO for `sub` cannot sneak back in.
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd())
        .unwrap();

    let archive = drain(&mut enc);
    // root HELLO (32) + root ENTRY("sub"): 16 header + 40 fixed fields +
    // "sub" (3) + NUL (1) = 60, directories carry no trailer + `sub`'s
    // GOODBYE (24, no HELLO of its own) + root's GOODBYE (24).
    assert_eq!(archive.len(), 32 + 60 + 24 + 24);
}

#[test]
fn two_files_are_emitted_in_sorted_order_with_payloads() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("b"), b"").unwrap();
    fs::write(dir.path().join("a"), b"xyz").unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(WITH_PERMISSIONS | WITH_UID_GID_32BIT | WITH_TIMES_NSEC)
        .unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let mut paths_seen = Vec::new();
    loop {
        let sig = enc.step().unwrap();
        if sig == Signal::NextFile {
            paths_seen.push(enc.current_path().unwrap());
        }
        if sig == Signal::Finished {
            break;
        }
    }
    assert_eq!(paths_seen, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn payload_bytes_round_trip_for_a_single_file() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"xyz").unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let archive = drain(&mut enc);
    assert!(archive.windows(3).any(|w| w == b"xyz"));
}

#[test]
fn re_encoding_the_same_tree_is_byte_identical() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"hello").unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub").join("b"), b"world").unwrap();

    let encode_once = || {
        let mut enc = Encoder::new();
        enc.set_feature_flags(WITH_PERMISSIONS | WITH_UID_GID_32BIT)
            .unwrap();
        enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
        drain(&mut enc)
    };
    assert_eq!(encode_once(), encode_once());
}

#[test]
fn archive_offset_is_monotonically_nondecreasing() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), vec![7u8; 200_000]).unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let mut last = 0u64;
    loop {
        let sig = enc.step().unwrap();
        let now = enc.current_archive_offset();
        assert!(now >= last);
        last = now;
        if sig == Signal::Finished {
            break;
        }
    }
}

#[test]
fn symlink_without_flag_fails_protocol_not_supported() {
    let dir = tempdir().unwrap();
    symlink("target", dir.path().join("l")).unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let err = loop {
        match enc.step() {
            Ok(Signal::Finished) => panic!("expected failure before completion"),
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::ProtocolNotSupported(_)));
}

#[test]
fn symlink_with_flag_is_forced_to_0777_mode() {
    let dir = tempdir().unwrap();
    symlink("target", dir.path().join("l")).unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(WITH_SYMLINKS | WITH_PERMISSIONS)
        .unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let mut saw_symlink = false;
    loop {
        let sig = enc.step().unwrap();
        if sig == Signal::NextFile && enc.current_path().unwrap() == "l" {
            saw_symlink = true;
            assert_eq!(enc.current_mode() & 0o777, 0o777);
        }
        if sig == Signal::Finished {
            break;
        }
    }
    assert!(saw_symlink);
}

#[test]
fn uid_gid_16bit_flag_passes_through_the_current_process_owner() {
    // The sandboxed test runner's own uid/gid own every file it creates,
    // and in practice fit comfortably under 16 bits, so this mostly
    // verifies the flag is wired through rather than rejected spuriously.
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a"), b"x").unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(WITH_UID_GID_16BIT).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
    let archive = drain(&mut enc);
    assert!(!archive.is_empty());
}

#[test]
fn fifo_is_rejected_without_with_fifos_and_accepted_with_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("p");
    let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
    let res = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    assert_eq!(res, 0, "mkfifo should succeed in a scratch tempdir");

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
    let err = loop {
        match enc.step() {
            Ok(Signal::Finished) => panic!("expected failure before completion"),
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::ProtocolNotSupported(_)));

    let mut enc = Encoder::new();
    enc.set_feature_flags(WITH_FIFOS).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
    let archive = drain(&mut enc);
    assert!(!archive.is_empty());
}

#[test]
fn char_device_node_emits_device_trailer_with_major_minor() {
    // mknod(2) for a device node needs CAP_MKNOD; skip quietly under an
    // unprivileged test runner rather than failing the whole suite.
    let dir = tempdir().unwrap();
    let path = dir.path().join("dev0");
    let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
    let rdev = unsafe { libc::makedev(1, 5) }; // major 1 / minor 5 = /dev/zero on Linux
    let res = unsafe { libc::mknod(cpath.as_ptr(), libc::S_IFCHR | 0o600, rdev) };
    if res != 0 {
        eprintln!("skipping char_device_node test: mknod requires CAP_MKNOD");
        return;
    }

    let mut enc = Encoder::new();
    enc.set_feature_flags(WITH_DEVICE_NODES).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let mut saw_device = false;
    loop {
        let sig = enc.step().unwrap();
        if sig == Signal::NextFile && enc.current_path().unwrap() == "dev0" {
            saw_device = true;
        }
        if sig == Signal::Finished {
            break;
        }
    }
    assert!(saw_device);
}

#[test]
fn get_data_before_any_step_is_a_sequence_violation() {
    let dir = tempdir().unwrap();
    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let err = enc.get_data().unwrap_err();
    assert!(matches!(err, Error::SequenceViolation(_)));
}

#[test]
fn get_data_after_finished_is_a_sequence_violation() {
    let dir = tempdir().unwrap();
    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
    drain(&mut enc);

    let err = enc.get_data().unwrap_err();
    assert!(matches!(err, Error::SequenceViolation(_)));
}

#[test]
fn single_regular_file_as_base_has_no_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("solo");
    fs::write(&path, b"payload").unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(&path).into_raw_fd()).unwrap();

    assert!(enc.current_path().is_err());
    let archive = drain(&mut enc);
    assert!(archive.windows(7).any(|w| w == b"payload"));
}

#[test]
fn finished_signal_is_sticky() {
    let dir = tempdir().unwrap();
    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let bytes = drain(&mut enc);
    assert!(!bytes.is_empty());
    for _ in 0..3 {
        assert_eq!(enc.step().unwrap(), Signal::Finished);
    }
}

#[test]
fn set_base_fd_twice_is_rejected() {
    let dir = tempdir().unwrap();
    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
    let err = enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap_err();
    assert!(matches!(err, Error::Busy));
}

#[test]
fn deeply_nested_tree_within_the_depth_ceiling_succeeds() {
    let dir = tempdir().unwrap();
    let mut cur = dir.path().to_path_buf();
    for i in 0..20 {
        cur = cur.join(format!("d{i}"));
        fs::create_dir(&cur).unwrap();
    }
    fs::write(cur.join("leaf"), b"deep").unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();
    let archive = drain(&mut enc);
    assert!(archive.windows(4).any(|w| w == b"deep"));
}

#[test]
fn dot_and_dotdot_are_never_emitted_as_entries() {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();

    let mut enc = Encoder::new();
    enc.set_feature_flags(0).unwrap();
    enc.set_base_fd(open_dir(dir.path()).into_raw_fd()).unwrap();

    let mut names = Vec::new();
    loop {
        let sig = enc.step().unwrap();
        if sig == Signal::NextFile {
            names.push(enc.current_path().unwrap());
        }
        if sig == Signal::Finished {
            break;
        }
    }
    assert!(!names.iter().any(|n| n == "." || n == ".."));
}
