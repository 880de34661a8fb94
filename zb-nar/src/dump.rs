// SPDX-License-Identifier: MIT

//! Serialize a filesystem tree into an archive.
//!
//! Directory entries are emitted in byte order of their names, so the
//! archive bytes depend only on tree contents, never on readdir order.

use std::fs;
use std::io::{self, BufReader, Write};
use std::path::Path;

use crate::writer::{self, Node};

/// Serialize the filesystem tree rooted at `path` into `sink`.
pub fn dump_path<W: Write>(path: &Path, sink: &mut W) -> io::Result<()> {
    let node = writer::open(sink)?;
    dump_node(path, node)
}

fn dump_node<W: Write>(path: &Path, node: Node<'_, W>) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        node.symlink(target.as_os_str().as_encoded_bytes())
    } else if file_type.is_file() {
        let executable = is_executable(&meta);
        let file = fs::File::open(path)?;
        node.file(executable, meta.len(), &mut BufReader::new(file))
    } else if file_type.is_dir() {
        let mut names: Vec<std::ffi::OsString> = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<_>>()?;
        names.sort_by(|a, b| a.as_encoded_bytes().cmp(b.as_encoded_bytes()));

        let mut dir = node.directory()?;
        for name in names {
            let entry = dir.entry(name.as_encoded_bytes())?;
            dump_node(&path.join(&name), entry)?;
            dir.close_entry()?;
        }
        dir.close()
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file, directory, or symlink", path.display()),
        ))
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    meta.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}
