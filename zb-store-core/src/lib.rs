// SPDX-License-Identifier: MIT

//! Core zb store semantics.
//!
//! This crate holds the pure types and algorithms shared by every other
//! layer of the store server: store directories and store paths, the
//! nixbase32 alphabet, hash and content-address handling, placeholders,
//! system triples, the derivation model with its canonical ATerm codec,
//! and the streaming reference-scanning primitives used while
//! canonicalizing build outputs.
//!
//! Nothing in here performs I/O beyond `std::io` trait plumbing; the
//! daemon and database crates build on top.

pub mod aterm;
pub mod base32;
pub mod content_address;
pub mod derivation;
pub mod hash;
pub mod placeholder;
pub mod refscan;
pub mod store_dir;
pub mod store_path;
pub mod system;

pub use content_address::{ContentAddress, ContentAddressError, ContentAddressMethod};
pub use hash::{Hash, HashAlgorithm, Hasher};
pub use placeholder::Placeholder;
pub use store_dir::StoreDirectory;
pub use store_path::{StorePath, StorePathError};
pub use system::System;
