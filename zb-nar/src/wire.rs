// SPDX-License-Identifier: MIT

//! Low-level NAR encoding: length-prefixed little-endian u64 fields and
//! strings padded with zeros to 8-byte alignment.
//!
//! The grammar, with the syntactic strings written out:
//!
//! ```plain
//! archive ::= "nix-archive-1" node
//! node    ::= "(" "type" "symlink" "target" string ")"
//!         ||= "(" "type" "regular" ("executable" "")? "contents" string ")"
//!         ||= "(" "type" "directory" entry* ")"
//! entry   ::= "entry" "(" "name" string "node" node ")"
//! ```

use std::io::{self, Read, Write};

/// Magic string opening every archive.
pub const MAGIC: &[u8] = b"nix-archive-1";

/// Longest accepted directory entry name (Linux NAME_MAX).
pub const MAX_NAME_LEN: usize = 255;
/// Longest accepted symlink target (Linux PATH_MAX - 1).
pub const MAX_TARGET_LEN: usize = 4095;

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write a length-prefixed string padded to 8 bytes.
pub fn write_bytes<W: Write>(w: &mut W, s: &[u8]) -> io::Result<()> {
    write_u64(w, s.len() as u64)?;
    w.write_all(s)?;
    write_padding(w, s.len() as u64)
}

pub fn write_padding<W: Write>(w: &mut W, len: u64) -> io::Result<()> {
    match (len & 7) as usize {
        0 => Ok(()),
        n => w.write_all(&[0u8; 8][n..]),
    }
}

pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a length-prefixed string of at most `max_len` bytes, verifying
/// that the padding is all zeros.
pub fn read_bytes<R: Read + ?Sized>(r: &mut R, max_len: usize) -> io::Result<Vec<u8>> {
    let len = read_u64(r)?;
    if len > max_len as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string of {len} bytes exceeds limit of {max_len}"),
        ));
    }
    let len = len as usize;

    let padded = len.div_ceil(8) * 8;
    let mut buf = vec![0u8; padded];
    r.read_exact(&mut buf)?;

    if buf[len..].iter().any(|b| *b != 0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "nonzero string padding",
        ));
    }
    buf.truncate(len);
    Ok(buf)
}

/// Consume an exact syntactic string, failing on anything else.
pub fn expect_token<R: Read + ?Sized>(r: &mut R, token: &[u8]) -> io::Result<()> {
    let got = read_bytes(r, token.len())?;
    if got != token {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(token),
                String::from_utf8_lossy(&got)
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_padding() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"type").unwrap();
        assert_eq!(buf, b"\x04\0\0\0\0\0\0\0type\0\0\0\0");

        let mut buf = Vec::new();
        write_bytes(&mut buf, b"contents").unwrap();
        assert_eq!(buf, b"\x08\0\0\0\0\0\0\0contents");

        let mut buf = Vec::new();
        write_bytes(&mut buf, b"").unwrap();
        assert_eq!(buf, b"\0\0\0\0\0\0\0\0");
    }

    #[test]
    fn read_rejects_nonzero_padding() {
        let mut bad = Vec::new();
        write_bytes(&mut bad, b"abc").unwrap();
        *bad.last_mut().unwrap() = 1;
        read_bytes(&mut bad.as_slice(), 16).unwrap_err();
    }

    #[test]
    fn read_rejects_oversized() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"four").unwrap();
        read_bytes(&mut buf.as_slice(), 3).unwrap_err();
    }

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello world").unwrap();
        let mut r = buf.as_slice();
        assert_eq!(read_bytes(&mut r, 64).unwrap(), b"hello world");
        assert!(r.is_empty());
    }
}
