// SPDX-License-Identifier: MIT

//! Streaming NAR decoder.
//!
//! The reader yields a tree of [Node]s mirroring the writer's API.
//! File contents are exposed through a bounded [FileReader] so archives
//! never have to fit in memory. Consumers must drain every file and
//! directory completely before moving on; any error abandons the whole
//! archive.

use std::io::{self, Read};

use crate::wire;

pub type Source<'r> = dyn Read + Send + 'r;

/// Open an archive and return its root node.
pub fn open<'a, 'r>(source: &'a mut Source<'r>) -> io::Result<Node<'a, 'r>> {
    wire::expect_token(source, wire::MAGIC)?;
    read_node(source)
}

pub enum Node<'a, 'r> {
    Symlink {
        target: Vec<u8>,
    },
    File {
        executable: bool,
        contents: FileReader<'a, 'r>,
    },
    Directory(DirReader<'a, 'r>),
}

impl std::fmt::Debug for Node<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Symlink { target } => f.debug_struct("Symlink").field("target", target).finish(),
            Node::File { executable, .. } => f
                .debug_struct("File")
                .field("executable", executable)
                .finish_non_exhaustive(),
            Node::Directory(_) => f.debug_tuple("Directory").finish_non_exhaustive(),
        }
    }
}

fn read_node<'a, 'r>(source: &'a mut Source<'r>) -> io::Result<Node<'a, 'r>> {
    wire::expect_token(source, b"(")?;
    wire::expect_token(source, b"type")?;

    let kind = wire::read_bytes(source, 9)?;
    match kind.as_slice() {
        b"symlink" => {
            wire::expect_token(source, b"target")?;
            let target = wire::read_bytes(source, wire::MAX_TARGET_LEN)?;
            if target.is_empty() || target.contains(&0) {
                return Err(io::ErrorKind::InvalidData.into());
            }
            wire::expect_token(source, b")")?;
            Ok(Node::Symlink { target })
        }
        b"regular" => {
            let mut executable = false;
            let mut tok = wire::read_bytes(source, 10)?;
            if tok == b"executable" {
                executable = true;
                wire::expect_token(source, b"")?;
                tok = wire::read_bytes(source, 10)?;
            }
            if tok != b"contents" {
                return Err(io::ErrorKind::InvalidData.into());
            }
            let len = wire::read_u64(source)?;
            FileReader::new(source, len).map(|contents| Node::File {
                executable,
                contents,
            })
        }
        b"directory" => Ok(Node::Directory(DirReader::new(source))),
        _ => Err(io::ErrorKind::InvalidData.into()),
    }
}

/// Bounded reader over one file's contents. The terminating padding and
/// parenthesis are consumed when the last byte is read, so a fully
/// drained [FileReader] leaves the source positioned at the next node.
pub struct FileReader<'a, 'r> {
    source: &'a mut Source<'r>,
    remaining: u64,
    /// Original length modulo 8, for the trailing padding.
    pad: u8,
}

impl<'a, 'r> FileReader<'a, 'r> {
    fn new(source: &'a mut Source<'r>, len: u64) -> io::Result<Self> {
        let mut reader = FileReader {
            source,
            remaining: len,
            pad: (len & 7) as u8,
        };
        // Zero-length files have no read to trigger the epilogue.
        if len == 0 {
            reader.finish()?;
        }
        Ok(reader)
    }

    pub fn len(&self) -> u64 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.pad != 0 {
            let mut buf = [0u8; 8];
            let n = 8 - self.pad as usize;
            self.source.read_exact(&mut buf[..n])?;
            if buf[..n].iter().any(|b| *b != 0) {
                return Err(io::ErrorKind::InvalidData.into());
            }
        }
        wire::expect_token(self.source, b")")
    }
}

impl Read for FileReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.finish()?;
        }
        Ok(n)
    }
}

/// Iterator-like access to a directory's entries.
pub struct DirReader<'a, 'r> {
    source: &'a mut Source<'r>,
    prev_name: Vec<u8>,
}

pub struct Entry<'a, 'r> {
    pub name: Vec<u8>,
    pub node: Node<'a, 'r>,
}

impl std::fmt::Debug for Entry<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

impl<'a, 'r> DirReader<'a, 'r> {
    fn new(source: &'a mut Source<'r>) -> Self {
        DirReader {
            source,
            prev_name: Vec::new(),
        }
    }

    /// The next entry, or `None` at the end of the directory. Not an
    /// `Iterator`: each yielded node borrows the reader and must be
    /// fully consumed first.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> io::Result<Option<Entry<'_, 'r>>> {
        // Terminator of the entry we yielded last time.
        if !self.prev_name.is_empty() {
            wire::expect_token(self.source, b")")?;
        }

        let tok = wire::read_bytes(self.source, 5)?;
        match tok.as_slice() {
            b")" => Ok(None),
            b"entry" => {
                wire::expect_token(self.source, b"(")?;
                wire::expect_token(self.source, b"name")?;
                let name = wire::read_bytes(self.source, wire::MAX_NAME_LEN)?;

                if name.is_empty()
                    || name.contains(&0)
                    || name.contains(&b'/')
                    || name == b"."
                    || name == b".."
                {
                    return Err(io::ErrorKind::InvalidData.into());
                }
                if !self.prev_name.is_empty() && self.prev_name >= name {
                    return Err(io::ErrorKind::InvalidData.into());
                }
                self.prev_name = name.clone();

                wire::expect_token(self.source, b"node")?;
                let node = read_node(self.source)?;
                Ok(Some(Entry { name, node }))
            }
            _ => Err(io::ErrorKind::InvalidData.into()),
        }
    }
}
