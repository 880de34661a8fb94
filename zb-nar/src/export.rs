// SPDX-License-Identifier: MIT

//! The export stream: a sequence of framed archives with per-object
//! trailers, terminated by eight zero bytes.
//!
//! Each framed object is:
//!
//! 1. the marker `01 00 00 00 00 00 00 00`,
//! 2. the object's NAR bytes,
//! 3. a trailer: `NIXE` + four zero bytes, then NAR-encoded fields —
//!    store path, reference count, that many references in
//!    lexicographic order, the deriver (may be empty), and either a
//!    zero word (no content address) or a one word followed by the
//!    content address in text form.
//!
//! The receiver verifies that the trailer's store path is the one its
//! content address implies; with no content address present it assumes
//! a recursive SHA-256 over the NAR it just consumed and still
//! verifies. Malformed framing poisons the stream; a failed
//! verification rejects only the one object.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use thiserror::Error;

use zb_store_core::content_address::ContentAddress;
use zb_store_core::hash::{Hash, HashAlgorithm, Hasher};
use zb_store_core::store_dir::StoreDirectory;
use zb_store_core::store_path::{self, StorePath, StoreReferences};

use crate::{reader, wire};

/// `NIXE` followed by four zero bytes.
pub const TRAILER_MAGIC: [u8; 8] = *b"NIXE\0\0\0\0";

#[derive(Debug, Error)]
pub enum ExportError {
    /// The stream framing is broken; the connection carrying it cannot
    /// be trusted any further.
    #[error("export stream error: {0}")]
    Stream(#[from] io::Error),
    /// One object failed validation. The stream itself remains intact
    /// and the next object may be read.
    #[error("rejected store object {path:?}: {reason}")]
    Object { path: String, reason: String },
}

/// Metadata accompanying one exported object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportTrailer {
    /// Absolute store path of the object.
    pub store_path: String,
    /// Absolute store paths of the references, including the object
    /// itself for self-referential objects.
    pub references: BTreeSet<String>,
    /// Absolute store path of the deriver, if known.
    pub deriver: Option<String>,
    /// Content address, if known.
    pub ca: Option<ContentAddress>,
}

/// Writer side of an export stream.
pub struct ExportWriter<W: Write> {
    sink: W,
    in_object: bool,
}

impl<W: Write> ExportWriter<W> {
    pub fn new(sink: W) -> Self {
        ExportWriter {
            sink,
            in_object: false,
        }
    }

    /// Start one framed object; the returned writer receives the NAR
    /// bytes. Must be followed by [ExportWriter::finish_object].
    pub fn begin_object(&mut self) -> io::Result<&mut W> {
        assert!(!self.in_object, "begin_object called twice");
        wire::write_u64(&mut self.sink, 1)?;
        self.in_object = true;
        Ok(&mut self.sink)
    }

    /// Write the trailer for the object whose NAR bytes were just
    /// written.
    pub fn finish_object(&mut self, trailer: &ExportTrailer) -> io::Result<()> {
        assert!(self.in_object, "finish_object without begin_object");
        self.in_object = false;

        self.sink.write_all(&TRAILER_MAGIC)?;
        wire::write_bytes(&mut self.sink, trailer.store_path.as_bytes())?;
        wire::write_u64(&mut self.sink, trailer.references.len() as u64)?;
        for reference in &trailer.references {
            wire::write_bytes(&mut self.sink, reference.as_bytes())?;
        }
        wire::write_bytes(
            &mut self.sink,
            trailer.deriver.as_deref().unwrap_or("").as_bytes(),
        )?;
        match &trailer.ca {
            None => wire::write_u64(&mut self.sink, 0)?,
            Some(ca) => {
                wire::write_u64(&mut self.sink, 1)?;
                wire::write_bytes(&mut self.sink, ca.to_string().as_bytes())?;
            }
        }
        Ok(())
    }

    /// Terminate the stream and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        assert!(!self.in_object, "finish inside an object");
        wire::write_u64(&mut self.sink, 0)?;
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// One validated object received from an export stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportedObject {
    pub store_path: StorePath,
    pub references: BTreeSet<StorePath>,
    pub self_reference: bool,
    pub deriver: Option<StorePath>,
    /// The verified content address: the trailer's, or the assumed
    /// recursive SHA-256 when the trailer carried none.
    pub ca: ContentAddress,
    pub nar_hash: Hash,
    pub nar_size: u64,
}

struct HashingTee<'a, R> {
    inner: &'a mut R,
    hasher: Hasher,
    count: u64,
}

impl<R: Read> Read for HashingTee<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Reader side of an export stream.
pub struct ExportReader<R> {
    source: R,
    dir: StoreDirectory,
}

impl<R: Read + Send> ExportReader<R> {
    pub fn new(dir: StoreDirectory, source: R) -> Self {
        ExportReader { source, dir }
    }

    /// Read the next framed object, handing its NAR bytes to `consume`
    /// (which must read exactly one archive, e.g. [crate::restore] or
    /// [crate::restore::skip]). Returns `Ok(None)` at the stream
    /// terminator.
    ///
    /// An [ExportError::Object] return means this object was consumed
    /// and rejected; the stream is still positioned at the next frame.
    pub fn next_object<F>(&mut self, consume: F) -> Result<Option<ImportedObject>, ExportError>
    where
        F: FnOnce(&mut reader::Source<'_>) -> io::Result<()>,
    {
        match wire::read_u64(&mut self.source)? {
            0 => return Ok(None),
            1 => {}
            other => {
                return Err(ExportError::Stream(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad object marker {other:#x}"),
                )));
            }
        }

        let mut tee = HashingTee {
            inner: &mut self.source,
            hasher: Hasher::new(HashAlgorithm::Sha256),
            count: 0,
        };
        consume(&mut tee)?;
        let nar_hash = tee.hasher.finish();
        let nar_size = tee.count;

        let trailer = self.read_trailer()?;
        self.validate(trailer, nar_hash, nar_size).map(Some)
    }

    fn read_trailer(&mut self) -> Result<ExportTrailer, ExportError> {
        let mut magic = [0u8; 8];
        self.source.read_exact(&mut magic)?;
        if magic != TRAILER_MAGIC {
            return Err(ExportError::Stream(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad trailer magic",
            )));
        }

        let store_path = read_string(&mut self.source)?;
        let count = wire::read_u64(&mut self.source)?;
        if count > 100_000 {
            return Err(ExportError::Stream(io::Error::new(
                io::ErrorKind::InvalidData,
                "implausible reference count",
            )));
        }
        let mut references = BTreeSet::new();
        for _ in 0..count {
            references.insert(read_string(&mut self.source)?);
        }
        let deriver = match read_string(&mut self.source)? {
            s if s.is_empty() => None,
            s => Some(s),
        };
        let ca = match wire::read_u64(&mut self.source)? {
            0 => None,
            1 => {
                let text = read_string(&mut self.source)?;
                match text.parse::<ContentAddress>() {
                    Ok(ca) => Some(ca),
                    Err(e) => {
                        return Err(ExportError::Object {
                            path: store_path,
                            reason: format!("unparseable content address: {e}"),
                        });
                    }
                }
            }
            other => {
                return Err(ExportError::Stream(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad content-address flag {other:#x}"),
                )));
            }
        };

        Ok(ExportTrailer {
            store_path,
            references,
            deriver,
            ca,
        })
    }

    fn validate(
        &self,
        trailer: ExportTrailer,
        nar_hash: Hash,
        nar_size: u64,
    ) -> Result<ImportedObject, ExportError> {
        let reject = |reason: String| ExportError::Object {
            path: trailer.store_path.clone(),
            reason,
        };

        let store_path = self
            .dir
            .parse(&trailer.store_path)
            .map_err(|e| reject(format!("bad store path: {e}")))?;

        let mut references = BTreeSet::new();
        let mut self_reference = false;
        for r in &trailer.references {
            let parsed = self
                .dir
                .parse(r)
                .map_err(|e| reject(format!("bad reference {r:?}: {e}")))?;
            if parsed == store_path {
                self_reference = true;
            } else {
                references.insert(parsed);
            }
        }
        let deriver = trailer
            .deriver
            .as_ref()
            .map(|d| self.dir.parse(d))
            .transpose()
            .map_err(|e| reject(format!("bad deriver: {e}")))?;

        // With no declared content address, the object is assumed to be
        // a recursive SHA-256 source.
        let ca = trailer
            .ca
            .clone()
            .unwrap_or_else(|| ContentAddress::Recursive(nar_hash.clone()));

        // A declared recursive SHA-256 digest must match what we just
        // hashed off the wire.
        if let ContentAddress::Recursive(h) = &ca
            && h.algorithm() == HashAlgorithm::Sha256
            && *h != nar_hash
        {
            return Err(reject(format!(
                "content address digest {} does not match received archive {}",
                h.to_hex(),
                nar_hash.to_hex()
            )));
        }

        let refs = StoreReferences {
            others: references.iter().map(|p| self.dir.display_path(p)).collect(),
            self_ref: self_reference,
        };
        let implied = store_path::ca_path(&self.dir, store_path.name(), &ca, &refs)
            .map_err(|e| reject(format!("cannot compute implied path: {e}")))?;
        if implied != store_path {
            return Err(reject(format!(
                "store path does not match its content address (implied {})",
                self.dir.display_path(&implied)
            )));
        }

        Ok(ImportedObject {
            store_path,
            references,
            self_reference,
            deriver,
            ca,
            nar_hash,
            nar_size,
        })
    }
}

fn read_string<R: Read>(source: &mut R) -> Result<String, ExportError> {
    let bytes = wire::read_bytes(source, 4096)?;
    String::from_utf8(bytes).map_err(|_| {
        ExportError::Stream(io::Error::new(
            io::ErrorKind::InvalidData,
            "trailer field is not UTF-8",
        ))
    })
}
