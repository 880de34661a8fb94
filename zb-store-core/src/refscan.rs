// SPDX-License-Identifier: MIT

//! Streaming reference scanning.
//!
//! Two collaborating primitives used while canonicalizing a freshly
//! built output:
//!
//! * [HashModuloReader] wraps a byte stream and replaces every
//!   occurrence of one fixed byte string with a same-sized replacement
//!   (typically zeros), recording the match offsets. The scheduler uses
//!   it to hash an output *modulo its own store path*, so a
//!   self-referential artifact does not trivially hash itself.
//! * [RefFinder] is a `Write` sink that records which of a set of
//!   search strings occur in the bytes written through it. Every search
//!   string is indexed both as UTF-8 and as UTF-16LE, because PE
//!   binaries and Windows pathnames embed store paths in wide
//!   characters.
//!
//! Both treat their input strictly as a stream: occurrences may
//! straddle arbitrary read or write boundaries, down to one byte at a
//! time.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use thiserror::Error;

#[derive(Debug, Eq, PartialEq, Error)]
pub enum RefScanError {
    #[error("replacement length {replace} differs from search length {search}")]
    LengthMismatch { search: usize, replace: usize },
    #[error("search string is empty")]
    EmptySearch,
}

/// A reader that substitutes `search` with `replace` (same length) in
/// the bytes flowing through it and remembers where the matches were.
#[derive(Debug)]
pub struct HashModuloReader<R> {
    inner: R,
    search: Vec<u8>,
    replace: Vec<u8>,
    /// Bytes read from `inner` but not yet emitted. The prefix up to
    /// `scanned` has been checked for matches (with replacements
    /// already applied in place).
    carry: Vec<u8>,
    scanned: usize,
    /// Absolute stream offset of `carry[0]`.
    base: u64,
    offsets: Vec<u64>,
    eof: bool,
}

impl<R: Read> HashModuloReader<R> {
    pub fn new(inner: R, search: &[u8], replace: &[u8]) -> Result<Self, RefScanError> {
        if search.is_empty() {
            return Err(RefScanError::EmptySearch);
        }
        if search.len() != replace.len() {
            return Err(RefScanError::LengthMismatch {
                search: search.len(),
                replace: replace.len(),
            });
        }
        Ok(HashModuloReader {
            inner,
            search: search.to_vec(),
            replace: replace.to_vec(),
            carry: Vec::new(),
            scanned: 0,
            base: 0,
            offsets: Vec::new(),
            eof: false,
        })
    }

    /// Offsets (in the output stream, which is positionally identical
    /// to the input stream) of every replaced occurrence, in order.
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.offsets.iter().copied()
    }

    /// True if at least one occurrence was replaced so far.
    pub fn matched(&self) -> bool {
        !self.offsets.is_empty()
    }

    /// Scan unexamined carry bytes. A window may only be confirmed once
    /// it fits entirely inside the buffered data, so short of EOF the
    /// final `len - 1` bytes stay unscanned.
    fn scan(&mut self) {
        let len = self.search.len();
        let limit = if self.eof {
            self.carry.len()
        } else {
            // Windows starting here still fit completely in carry.
            self.carry.len().saturating_sub(len - 1)
        };

        let mut pos = self.scanned;
        while pos < limit {
            if self.carry.len() - pos >= len && self.carry[pos..pos + len] == self.search[..] {
                self.offsets.push(self.base + pos as u64);
                self.carry[pos..pos + len].copy_from_slice(&self.replace);
                // Non-overlapping: resume past the replaced bytes.
                pos += len;
            } else {
                pos += 1;
            }
        }
        self.scanned = pos;
    }

    /// Number of carry bytes that are final and may be handed out.
    /// Scanned bytes are final: positions before the scan limit were
    /// tested, and positions inside a replaced match are consumed by
    /// the non-overlap rule.
    fn emittable(&self) -> usize {
        self.scanned
    }
}

impl<R: Read> Read for HashModuloReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let ready = self.emittable();
            if ready > 0 {
                let n = ready.min(buf.len());
                buf[..n].copy_from_slice(&self.carry[..n]);
                self.carry.drain(..n);
                self.scanned -= n;
                self.base += n as u64;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }

            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                // A partial match at EOF is not a match; flush as-is.
                self.eof = true;
            } else {
                self.carry.extend_from_slice(&chunk[..n]);
            }
            self.scan();
        }
    }
}

const TRIE_ROOT: usize = 0;

#[derive(Default)]
struct TrieNode {
    children: Vec<(u8, usize)>,
    /// Index into the pattern table when a search string ends here.
    terminal: Option<usize>,
}

impl TrieNode {
    fn child(&self, byte: u8) -> Option<usize> {
        self.children
            .iter()
            .find(|(b, _)| *b == byte)
            .map(|(_, ix)| *ix)
    }
}

/// A `Write` sink that discovers which known search strings occur in a
/// byte stream, in UTF-8 or UTF-16LE.
///
/// The search strings form a trie. A set of live "threads" (trie node
/// indices) advances byte by byte; each input byte additionally spawns a
/// fresh thread at the root, so matches may begin anywhere, including
/// across `write` boundaries. Reaching a terminal node records the
/// corresponding search string.
pub struct RefFinder {
    nodes: Vec<TrieNode>,
    patterns: Vec<Vec<u8>>,
    threads: Vec<usize>,
    scratch: Vec<usize>,
    found: BTreeSet<usize>,
}

impl Default for RefFinder {
    fn default() -> Self {
        RefFinder::new()
    }
}

impl RefFinder {
    pub fn new() -> Self {
        RefFinder {
            nodes: vec![TrieNode::default()],
            patterns: Vec::new(),
            threads: Vec::new(),
            scratch: Vec::new(),
            found: BTreeSet::new(),
        }
    }

    /// Construct a finder primed with `patterns`.
    pub fn with_patterns<P: AsRef<[u8]>>(patterns: impl IntoIterator<Item = P>) -> Self {
        let mut finder = RefFinder::new();
        for p in patterns {
            finder.add(p.as_ref());
        }
        finder
    }

    /// Add a search string. It is indexed both as its raw (UTF-8) bytes
    /// and as its UTF-16LE expansion.
    pub fn add(&mut self, pattern: &[u8]) {
        if pattern.is_empty() {
            return;
        }
        let ix = self.patterns.len();
        self.patterns.push(pattern.to_vec());

        self.insert(pattern.iter().copied(), ix);
        // Store paths are ASCII, so the UTF-16LE form is simply each
        // byte followed by a NUL.
        self.insert(pattern.iter().flat_map(|b| [*b, 0u8]), ix);
    }

    fn insert(&mut self, bytes: impl IntoIterator<Item = u8>, pattern: usize) {
        let mut node = TRIE_ROOT;
        for b in bytes {
            node = match self.nodes[node].child(b) {
                Some(next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.push((b, next));
                    next
                }
            };
        }
        self.nodes[node].terminal = Some(pattern);
    }

    fn step(&mut self, byte: u8) {
        self.scratch.clear();
        // Advance every live thread, plus a fresh one at the root.
        for &thread in self.threads.iter().chain(std::iter::once(&TRIE_ROOT)) {
            if let Some(next) = self.nodes[thread].child(byte) {
                if let Some(pattern) = self.nodes[next].terminal {
                    self.found.insert(pattern);
                }
                if !self.nodes[next].children.is_empty() {
                    self.scratch.push(next);
                }
            }
        }
        std::mem::swap(&mut self.threads, &mut self.scratch);
    }

    /// Feed bytes without going through the `Write` impl.
    pub fn feed(&mut self, data: &[u8]) {
        if self.patterns.is_empty() {
            return;
        }
        for &b in data {
            self.step(b);
        }
    }

    /// The search strings seen so far, sorted.
    pub fn found(&self) -> BTreeSet<Vec<u8>> {
        self.found
            .iter()
            .map(|&ix| self.patterns[ix].clone())
            .collect()
    }
}

impl Write for RefFinder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::{HashModuloReader, RefFinder};

    /// A reader that hands out its payload in fixed-size pieces, to
    /// exercise chunk boundaries.
    struct Chunked<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Chunked<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.chunk.min(self.data.len()).min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn run_modulo(data: &[u8], search: &[u8], replace: &[u8], chunk: usize) -> (Vec<u8>, Vec<u64>) {
        let source = Chunked { data, chunk };
        let mut reader = HashModuloReader::new(source, search, replace).unwrap();
        let mut out = Vec::new();
        // Tiny destination buffers too, to stress both sides.
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        let offsets = reader.offsets().collect();
        (out, offsets)
    }

    /// Substitution output and offsets are independent of source chunk
    /// size, down to single bytes.
    #[test]
    fn modulo_chunk_boundaries() {
        let data = b"xx/zb/aaa-path!!/zb/aaa-path./zb/aaa";
        let search = b"/zb/aaa-path";
        let replace = b"000000000000";
        let expected = b"xx000000000000!!000000000000./zb/aaa";

        for chunk in 1..=data.len() {
            let (out, offsets) = run_modulo(data, search, replace, chunk);
            assert_eq!(out, expected, "chunk size {chunk}");
            assert_eq!(offsets, vec![2, 16], "chunk size {chunk}");
        }
    }

    /// Non-overlapping semantics: after a match, scanning resumes past
    /// the replaced bytes.
    #[test]
    fn modulo_non_overlapping() {
        let (out, offsets) = run_modulo(b"aaaa", b"aa", b"bb", 1);
        assert_eq!(out, b"bbbb");
        assert_eq!(offsets, vec![0, 2]);
    }

    /// A partial match at EOF is not a match.
    #[test]
    fn modulo_partial_match_at_eof() {
        let (out, offsets) = run_modulo(b"xy/zb/aa", b"/zb/aaa", b"0000000", 1);
        assert_eq!(out, b"xy/zb/aa");
        assert!(offsets.is_empty());
    }

    #[test]
    fn modulo_rejects_length_mismatch() {
        HashModuloReader::new(std::io::empty(), b"abc", b"ab").unwrap_err();
        HashModuloReader::new(std::io::empty(), b"", b"").unwrap_err();
    }

    #[test]
    fn modulo_identity_when_absent() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (out, offsets) = run_modulo(&data, b"not-present-at-all", b"000000000000000000", 7);
        assert_eq!(out, data);
        assert!(offsets.is_empty());
    }

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn finder_utf8_and_utf16() {
        let needle = "/opt/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-dep";
        let other = "/opt/zb/store/11bgd045z0d4icpbc2yyz4gx48ak44la-unused";

        let mut finder = RefFinder::with_patterns([needle, other]);
        finder.write_all(b"prefix ").unwrap();
        finder.write_all(needle.as_bytes()).unwrap();
        finder.write_all(b" middle ").unwrap();
        finder.write_all(&utf16le(needle)).unwrap();
        finder.write_all(b" suffix").unwrap();

        let found = finder.found();
        assert!(found.contains(needle.as_bytes()));
        assert!(!found.contains(other.as_bytes()));
    }

    #[test]
    fn finder_utf16_only_occurrence() {
        let needle = "/opt/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-wide";
        let mut finder = RefFinder::with_patterns([needle]);
        finder.write_all(&utf16le(needle)).unwrap();
        assert!(finder.found().contains(needle.as_bytes()));
    }

    /// Matches straddling every possible write boundary are still found.
    #[test]
    fn finder_straddles_writes() {
        let needle = b"/opt/zb/store/00bgd045z0d4icpbc2yyz4gx48ak44la-x";
        let mut data = Vec::new();
        data.extend_from_slice(b"some binary \x00\x01 junk ");
        data.extend_from_slice(needle);
        data.extend_from_slice(b" trailing");

        for chunk in 1..=data.len() {
            let mut finder = RefFinder::with_patterns([needle.as_slice()]);
            for piece in data.chunks(chunk) {
                finder.write_all(piece).unwrap();
            }
            assert!(
                finder.found().contains(needle.as_slice()),
                "chunk size {chunk}"
            );
        }
    }

    #[test]
    fn finder_overlapping_patterns() {
        let mut finder = RefFinder::with_patterns([b"abab".as_slice(), b"baba".as_slice()]);
        finder.write_all(b"ababab").unwrap();
        let found = finder.found();
        assert!(found.contains(b"abab".as_slice()));
        assert!(found.contains(b"baba".as_slice()));
    }

    #[test]
    fn finder_empty_pattern_set() {
        let mut finder = RefFinder::new();
        finder.write_all(b"anything").unwrap();
        assert!(finder.found().is_empty());
    }
}
