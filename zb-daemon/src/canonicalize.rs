// SPDX-License-Identifier: MIT

//! Output canonicalization.
//!
//! Before an output is hashed and moved into the store, its metadata is
//! normalized so the bytes on disk are a pure function of the build:
//!
//! * mtimes (and atimes) are pinned to epoch + 1 second;
//! * setuid/setgid bits are cleared, as are group/world write bits;
//! * regular files with identical contents are deduplicated into hard
//!   links within the output.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use zb_store_core::hash::{Hash, HashAlgorithm};

/// The canonical timestamp, one second past the epoch so tools that
/// treat 0 as "missing" stay happy.
const CANONICAL_MTIME: i64 = 1;

/// Set atime and mtime without following symlinks, matching
/// `utimensat(…, AT_SYMLINK_NOFOLLOW)`.
#[allow(unsafe_code)]
fn set_timestamp(path: &Path, seconds: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
    ];
    // SAFETY: c_path is a valid NUL-terminated string and times is a
    // valid two-element array. AT_SYMLINK_NOFOLLOW keeps symlinks
    // themselves untouched.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Canonicalize all metadata under `path` recursively, deduplicating
/// identical regular files into hard links.
pub fn canonicalize_tree(path: &Path) -> io::Result<()> {
    let mut seen: HashMap<(bool, Hash), PathBuf> = HashMap::new();
    canonicalize_inner(path, &mut seen)
}

fn canonicalize_inner(path: &Path, seen: &mut HashMap<(bool, Hash), PathBuf>) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;

    if meta.is_symlink() {
        // Symlinks have no permissions of their own; leave the target
        // bytes exactly as written.
        return Ok(());
    }

    if meta.is_file() {
        dedup_file(path, &meta, seen)?;
    }

    // Clear setuid/setgid/sticky and group/world write bits; keep the
    // owner-executable bit as the builder left it.
    let mode = meta.permissions().mode();
    let new_mode = mode & !0o7022;
    if new_mode != mode {
        fs::set_permissions(path, fs::Permissions::from_mode(new_mode))?;
    }

    set_timestamp(path, CANONICAL_MTIME)?;

    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            canonicalize_inner(&entry?.path(), seen)?;
        }
        // The directory mtime changed while we rewrote its children.
        set_timestamp(path, CANONICAL_MTIME)?;
    }

    Ok(())
}

fn dedup_file(
    path: &Path,
    meta: &fs::Metadata,
    seen: &mut HashMap<(bool, Hash), PathBuf>,
) -> io::Result<()> {
    let executable = meta.permissions().mode() & 0o100 != 0;
    let digest = hash_file(path)?;

    match seen.get(&(executable, digest.clone())) {
        None => {
            seen.insert((executable, digest), path.to_owned());
        }
        Some(original) if fs::symlink_metadata(original)?.ino() == meta.ino() => {}
        Some(original) => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tmp = path.with_file_name(format!(".{file_name}.zb-dedup"));
            fs::hard_link(original, &tmp)?;
            fs::rename(&tmp, path)?;
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> io::Result<Hash> {
    let mut hasher = zb_store_core::hash::Hasher::new(HashAlgorithm::Sha256);
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};

    use super::canonicalize_tree;

    #[test]
    fn timestamps_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        fs::create_dir(&root).unwrap();
        let file = root.join("tool");
        fs::write(&file, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o6777)).unwrap();

        canonicalize_tree(&root).unwrap();

        let meta = fs::metadata(&file).unwrap();
        assert_eq!(meta.mtime(), 1);
        let mode = meta.permissions().mode() & 0o7777;
        assert_eq!(mode & 0o7022, 0, "setuid/setgid/write bits cleared, got {mode:o}");
        assert_ne!(mode & 0o100, 0, "owner-executable preserved");
        assert_eq!(fs::metadata(&root).unwrap().mtime(), 1);
    }

    #[test]
    fn identical_files_are_hard_linked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a"), "same contents").unwrap();
        fs::write(root.join("b"), "same contents").unwrap();
        fs::write(root.join("c"), "different").unwrap();

        canonicalize_tree(&root).unwrap();

        let a = fs::metadata(root.join("a")).unwrap();
        let b = fs::metadata(root.join("b")).unwrap();
        let c = fs::metadata(root.join("c")).unwrap();
        assert_eq!(a.ino(), b.ino(), "identical files share an inode");
        assert_ne!(a.ino(), c.ino());
        assert_eq!(fs::read(root.join("b")).unwrap(), b"same contents");
    }

    #[test]
    fn executable_bit_splits_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("script"), "payload").unwrap();
        fs::set_permissions(root.join("script"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(root.join("data"), "payload").unwrap();

        canonicalize_tree(&root).unwrap();

        let script = fs::metadata(root.join("script")).unwrap();
        let data = fs::metadata(root.join("data")).unwrap();
        assert_ne!(script.ino(), data.ino(), "mode difference prevents dedup");
    }

    #[test]
    fn symlinks_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink("missing-target", root.join("link")).unwrap();
        canonicalize_tree(&root).unwrap();
        assert_eq!(
            fs::read_link(root.join("link")).unwrap().to_str().unwrap(),
            "missing-target"
        );
    }
}
