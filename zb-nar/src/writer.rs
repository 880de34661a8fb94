// SPDX-License-Identifier: MIT

//! Streaming NAR encoder.
//!
//! ```rust
//! let mut sink: Vec<u8> = Vec::new();
//! let node = zb_nar::writer::open(&mut sink)?;
//! node.file(false, 3, &mut std::io::Cursor::new(b"hi\n"))?;
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! Directory entries must be added in strictly ascending name order and
//! the caller must invoke [Directory::close]; violations are reported as
//! `InvalidInput` errors rather than silently producing a corrupt
//! archive.

use std::io::{self, BufRead, Write};

use crate::wire;

/// Start an archive, returning the root node to be filled in.
pub fn open<W: Write>(writer: &mut W) -> io::Result<Node<'_, W>> {
    wire::write_bytes(writer, wire::MAGIC)?;
    Ok(Node { writer })
}

/// A single unwritten node. Consuming methods turn it into a symlink,
/// a regular file, or a directory.
#[derive(Debug)]
pub struct Node<'a, W: Write> {
    writer: &'a mut W,
}

impl<'a, W: Write> Node<'a, W> {
    fn token(&mut self, s: &[u8]) -> io::Result<()> {
        wire::write_bytes(self.writer, s)
    }

    fn open_type(&mut self, kind: &[u8]) -> io::Result<()> {
        self.token(b"(")?;
        self.token(b"type")?;
        self.token(kind)
    }

    /// Write this node as a symlink.
    pub fn symlink(mut self, target: &[u8]) -> io::Result<()> {
        if target.is_empty() || target.len() > wire::MAX_TARGET_LEN || target.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid symlink target",
            ));
        }
        self.open_type(b"symlink")?;
        self.token(b"target")?;
        wire::write_bytes(self.writer, target)?;
        self.token(b")")
    }

    /// Write this node as a regular file of exactly `size` bytes drawn
    /// from `contents`.
    pub fn file(mut self, executable: bool, size: u64, contents: &mut dyn BufRead) -> io::Result<()> {
        self.open_type(b"regular")?;
        if executable {
            self.token(b"executable")?;
            self.token(b"")?;
        }
        self.token(b"contents")?;
        wire::write_u64(self.writer, size)?;

        let mut remaining = size;
        while remaining > 0 {
            let chunk = contents.fill_buf()?;
            if chunk.is_empty() {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let n = remaining.min(chunk.len() as u64) as usize;
            self.writer.write_all(&chunk[..n])?;
            contents.consume(n);
            remaining -= n as u64;
        }
        if contents.fill_buf().map(|b| !b.is_empty())? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file contents longer than declared size",
            ));
        }

        wire::write_padding(self.writer, size)?;
        self.token(b")")
    }

    /// Write this node as a directory and return a builder for its
    /// entries.
    pub fn directory(mut self) -> io::Result<Directory<'a, W>> {
        self.open_type(b"directory")?;
        Ok(Directory {
            node: self,
            prev_name: Vec::new(),
        })
    }
}

/// Builder for the entries of a directory node.
pub struct Directory<'a, W: Write> {
    node: Node<'a, W>,
    prev_name: Vec<u8>,
}

impl<W: Write> Directory<'_, W> {
    /// Begin an entry. Names must be valid, unique, and strictly
    /// ascending.
    pub fn entry(&mut self, name: &[u8]) -> io::Result<Node<'_, W>> {
        if name.is_empty()
            || name.len() > wire::MAX_NAME_LEN
            || name.contains(&0)
            || name.contains(&b'/')
            || name == b"."
            || name == b".."
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid directory entry name",
            ));
        }
        if !self.prev_name.is_empty() && self.prev_name.as_slice() >= name {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "directory entries out of order",
            ));
        }

        self.node.token(b"entry")?;
        self.node.token(b"(")?;
        self.node.token(b"name")?;
        wire::write_bytes(self.node.writer, name)?;
        self.node.token(b"node")?;

        self.prev_name = name.to_vec();
        Ok(Node {
            writer: &mut *self.node.writer,
        })
    }

    /// Close the entry begun by the previous [Directory::entry] call.
    /// Must be called once per entry, after its node is written.
    pub fn close_entry(&mut self) -> io::Result<()> {
        self.node.token(b")")
    }

    /// Terminate the directory node.
    pub fn close(mut self) -> io::Result<()> {
        self.node.token(b")")
    }
}
