// SPDX-License-Identifier: MIT

//! Materialize an archive onto the filesystem.
//!
//! The reader already rejects hostile entry names (`.`, `..`, slashes,
//! NUL) and misordered directories, so restoration is a straight walk.
//! Files are created with mode 0o666 or 0o777 (executable) before any
//! later canonicalization pass tightens them.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::reader::{self, Node};

/// Read one archive from `source` and materialize it at `path`, which
/// must not yet exist.
pub fn restore(source: &mut reader::Source<'_>, path: &Path) -> io::Result<()> {
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("restore target {} already exists", path.display()),
        ));
    }
    let node = reader::open(source)?;
    restore_node(node, path)
}

fn restore_node(node: Node<'_, '_>, path: &Path) -> io::Result<()> {
    match node {
        Node::Symlink { target } => {
            #[cfg(unix)]
            {
                use std::ffi::OsStr;
                use std::os::unix::ffi::OsStrExt as _;
                std::os::unix::fs::symlink(OsStr::from_bytes(&target), path)
            }
            #[cfg(not(unix))]
            {
                let _ = target;
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "symlinks are not supported on this platform",
                ))
            }
        }
        Node::File {
            executable,
            mut contents,
        } => {
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                options.mode(if executable { 0o777 } else { 0o666 });
            }
            #[cfg(not(unix))]
            let _ = executable;

            let file = options.open(path)?;
            let mut writer = io::BufWriter::new(file);
            io::copy(&mut contents, &mut writer)?;
            let mut file = writer.into_inner()?;
            io::Write::flush(&mut file)
        }
        Node::Directory(mut dir) => {
            fs::create_dir(path)?;
            while let Some(entry) = dir.next()? {
                #[cfg(unix)]
                let name = {
                    use std::ffi::OsStr;
                    use std::os::unix::ffi::OsStrExt as _;
                    OsStr::from_bytes(&entry.name).to_owned()
                };
                #[cfg(not(unix))]
                let name = std::ffi::OsString::from(String::from_utf8_lossy(&entry.name).into_owned());

                restore_node(entry.node, &path.join(&name))?;
            }
            Ok(())
        }
    }
}

/// Drain one archive from `source` without materializing it, e.g. to
/// advance an export stream past a rejected object.
pub fn skip(source: &mut reader::Source<'_>) -> io::Result<()> {
    let node = reader::open(source)?;
    skip_node(node)
}

fn skip_node(node: Node<'_, '_>) -> io::Result<()> {
    match node {
        Node::Symlink { .. } => Ok(()),
        Node::File { mut contents, .. } => {
            io::copy(&mut contents, &mut io::sink())?;
            Ok(())
        }
        Node::Directory(mut dir) => {
            while let Some(entry) = dir.next()? {
                skip_node(entry.node)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::dump::dump_path;

    /// dump → restore → dump reproduces the archive byte for byte.
    #[test]
    fn roundtrip() {
        let scratch = tempfile::tempdir().unwrap();
        let original = scratch.path().join("original");
        fs::create_dir(&original).unwrap();
        fs::write(original.join("file"), "contents\n").unwrap();
        fs::create_dir(original.join("sub")).unwrap();
        fs::write(original.join("sub").join("nested"), "deep").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("file", original.join("link")).unwrap();

        let mut archive = Vec::new();
        dump_path(&original, &mut archive).unwrap();

        let restored = scratch.path().join("restored");
        let mut source: &[u8] = &archive;
        super::restore(&mut source, &restored).unwrap();
        assert!(source.is_empty());

        let mut second = Vec::new();
        dump_path(&restored, &mut second).unwrap();
        assert_eq!(archive, second);
    }

    #[test]
    fn refuses_existing_target() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("f");
        fs::write(&file, "x").unwrap();

        let mut archive = Vec::new();
        dump_path(&file, &mut archive).unwrap();
        let mut source: &[u8] = &archive;
        super::restore(&mut source, &file).unwrap_err();
    }

    #[test]
    fn skip_consumes_exactly_one_archive() {
        let scratch = tempfile::tempdir().unwrap();
        let file = scratch.path().join("f");
        fs::write(&file, "payload").unwrap();

        let mut archive = Vec::new();
        dump_path(&file, &mut archive).unwrap();
        archive.extend_from_slice(b"TRAILER");

        let mut source: &[u8] = &archive;
        super::skip(&mut source).unwrap();
        assert_eq!(source, b"TRAILER");
    }
}
