// SPDX-License-Identifier: MIT

//! The Nix Archive (NAR) format and the export framing built on it.
//!
//! A NAR is a deterministic serialization of a filesystem tree: regular
//! files (with an executable bit), directories with lexicographically
//! sorted entries, and symbolic links. Deterministic means that hashing
//! the archive is a sound way to content-address the tree, which is why
//! the reference scanner and the store's `recursive` content addresses
//! both operate on NAR bytes rather than on the filesystem.
//!
//! The [export] module frames a sequence of NARs with per-object
//! trailers (path, references, deriver, content address) — the stream
//! format used by `zb.export` / `zb.import`.

pub mod byte_stream;
pub mod dump;
pub mod export;
pub mod reader;
pub mod restore;
pub mod wire;
pub mod writer;

pub use byte_stream::NarByteStream;
pub use dump::dump_path;
pub use reader::Node;
pub use restore::restore;
