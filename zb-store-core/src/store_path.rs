// SPDX-License-Identifier: MIT

//! Store paths and the fingerprint algorithm that mints them.
//!
//! A store path is `<digest>-<name>` where the digest is 20 bytes of a
//! compressed SHA-256 over an ASCII fingerprint:
//!
//! ```plain
//! <kind>:<ref>:<ref>:…[:self]:<hash-hex>:<storeDir>:<name>
//! ```
//!
//! `kind` is `text`, `source`, or `output:<outputName>`; references are
//! listed in lexicographic order and `self` is appended when the object
//! refers to its own path.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::base32;
use crate::content_address::{ContentAddress, ContentAddressMethod};
use crate::hash::{self, HashAlgorithm};
use crate::store_dir::StoreDirectory;

/// Raw digest size of a store path.
pub const DIGEST_SIZE: usize = 20;
/// Base-32 length of a store path digest.
pub const ENCODED_DIGEST_SIZE: usize = 32;
/// Longest accepted store path name.
pub const MAX_NAME_LEN: usize = 211;

#[derive(Debug, Eq, PartialEq, Error)]
pub enum StorePathError {
    #[error("store directory {0:?} is not absolute")]
    StoreDirNotAbsolute(PathBuf),
    #[error("path {0:?} is not directly under the store directory")]
    NotInStore(String),
    #[error("store path is too short")]
    TooShort,
    #[error("missing dash between digest and name")]
    MissingDash,
    #[error("invalid digest encoding: {0}")]
    BadDigest(#[from] base32::DecodeError),
    #[error("invalid store path name {0:?}")]
    BadName(String),
    #[error("references are not allowed for {0} content addresses")]
    RefsNotAllowed(&'static str),
    #[error("text content addresses only support sha256")]
    UnsupportedTextAlgorithm,
}

/// A single entry in the store: a 20-byte digest plus a human-readable
/// name. The digest orders first so sorted collections sort the way the
/// store directory lists.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StorePath {
    digest: [u8; DIGEST_SIZE],
    name: String,
}

impl StorePath {
    pub fn new(digest: [u8; DIGEST_SIZE], name: &str) -> Result<Self, StorePathError> {
        validate_name(name)?;
        Ok(StorePath {
            digest,
            name: name.to_string(),
        })
    }

    /// Parse the `<digest>-<name>` base form.
    pub fn from_base_name(s: &str) -> Result<Self, StorePathError> {
        if s.len() < ENCODED_DIGEST_SIZE + 2 {
            return Err(StorePathError::TooShort);
        }
        let (digest_part, rest) = s.split_at(ENCODED_DIGEST_SIZE);
        let digest = base32::decode_fixed::<DIGEST_SIZE>(digest_part.as_bytes())?;
        let name = rest
            .strip_prefix('-')
            .ok_or(StorePathError::MissingDash)?;
        StorePath::new(digest, name)
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// The base-32 rendering of the digest.
    pub fn digest_string(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `.drv` names denote serialized derivations.
    pub fn is_derivation(&self) -> bool {
        self.name.ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", base32::encode(&self.digest), self.name)
    }
}

impl FromStr for StorePath {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorePath::from_base_name(s)
    }
}

fn validate_name(name: &str) -> Result<(), StorePathError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with('.') {
        return Err(StorePathError::BadName(name.to_string()));
    }
    for c in name.bytes() {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => {}
            b'+' | b'-' | b'.' | b'_' | b'?' | b'=' => {}
            _ => return Err(StorePathError::BadName(name.to_string())),
        }
    }
    Ok(())
}

/// The reference set that participates in a fingerprint.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreReferences {
    /// Absolute store path strings, other than the object itself.
    pub others: BTreeSet<String>,
    /// Whether the object refers to its own path.
    pub self_ref: bool,
}

impl StoreReferences {
    pub fn is_empty(&self) -> bool {
        self.others.is_empty() && !self.self_ref
    }
}

/// XOR-fold an arbitrary digest down to `N` bytes: byte `i` of the output
/// is the XOR of input bytes `i, i+N, i+2N, …`.
pub fn compress_hash<const N: usize>(input: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    for (i, b) in input.iter().enumerate() {
        out[i % N] ^= b;
    }
    out
}

/// Mint a store path from fingerprint parts. `kind` is `text`, `source`,
/// or `output:<outputName>`; `hash_hex` is the lowercase hex of the
/// object hash appropriate to the kind.
pub fn make_store_path(
    dir: &StoreDirectory,
    kind: &str,
    hash_hex: &str,
    name: &str,
    refs: &StoreReferences,
) -> Result<StorePath, StorePathError> {
    let mut fingerprint = String::with_capacity(
        kind.len() + hash_hex.len() + name.len() + 64 + refs.others.len() * 48,
    );
    fingerprint.push_str(kind);
    for r in &refs.others {
        fingerprint.push(':');
        fingerprint.push_str(r);
    }
    if refs.self_ref {
        fingerprint.push_str(":self");
    }
    fingerprint.push(':');
    fingerprint.push_str(hash_hex);
    fingerprint.push(':');
    fingerprint.push_str(&dir.to_string());
    fingerprint.push(':');
    fingerprint.push_str(name);

    let digest = compress_hash::<DIGEST_SIZE>(&hash::sha256(&fingerprint));
    StorePath::new(digest, name)
}

/// Store path of a text object (a `.drv` file or other literal file with
/// references): `kind = text`, hash of the raw bytes.
pub fn text_path(
    dir: &StoreDirectory,
    name: &str,
    content: impl AsRef<[u8]>,
    refs: &StoreReferences,
) -> Result<StorePath, StorePathError> {
    let content_hash = data_encoding::HEXLOWER.encode(&hash::sha256(content.as_ref()));
    make_store_path(dir, "text", &content_hash, name, refs)
}

/// Store path determined by a content address.
///
/// Recursive SHA-256 objects use the `source` kind and may carry
/// references; every other method/algorithm combination is addressed
/// through the fixed-output digest and admits no references.
pub fn ca_path(
    dir: &StoreDirectory,
    name: &str,
    ca: &ContentAddress,
    refs: &StoreReferences,
) -> Result<StorePath, StorePathError> {
    match ca {
        ContentAddress::Text(h) => {
            if h.algorithm() != HashAlgorithm::Sha256 {
                return Err(StorePathError::UnsupportedTextAlgorithm);
            }
            make_store_path(dir, "text", &h.to_hex(), name, refs)
        }
        ContentAddress::Recursive(h) if h.algorithm() == HashAlgorithm::Sha256 => {
            make_store_path(dir, "source", &h.to_hex(), name, refs)
        }
        _ => {
            if !refs.is_empty() {
                return Err(StorePathError::RefsNotAllowed("fixed"));
            }
            let inner = format!(
                "fixed:out:{}{}:{}:",
                method_prefix(ca.method()),
                ca.hash().algorithm(),
                ca.hash().to_hex()
            );
            let inner_hex = data_encoding::HEXLOWER.encode(&hash::sha256(inner));
            make_store_path(dir, "output:out", &inner_hex, name, &StoreReferences::default())
        }
    }
}

/// Store path of a derivation output, minted from the derivation hash.
pub fn output_path(
    dir: &StoreDirectory,
    output_name: &str,
    drv_hash_hex: &str,
    path_name: &str,
) -> Result<StorePath, StorePathError> {
    make_store_path(
        dir,
        &format!("output:{output_name}"),
        drv_hash_hex,
        path_name,
        &StoreReferences::default(),
    )
}

/// The method prefix that appears in `fixed:out:…` digests and in ATerm
/// output tuples: text → `text:`, flat → empty, recursive → `r:`.
pub fn method_prefix(method: ContentAddressMethod) -> &'static str {
    match method {
        ContentAddressMethod::Text => "text:",
        ContentAddressMethod::Flat => "",
        ContentAddressMethod::Recursive => "r:",
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::hash::Hash;

    #[test]
    fn parse_base_name() {
        let p = StorePath::from_base_name("00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60")
            .unwrap();
        assert_eq!(p.name(), "net-tools-1.60");
        assert_eq!(
            p.digest(),
            &[
                0x8a, 0x12, 0x32, 0x15, 0x22, 0xfd, 0x91, 0xef, 0xbd, 0x60, 0xeb, 0xb2, 0x48,
                0x1a, 0xf8, 0x85, 0x80, 0xf6, 0x16, 0x00
            ]
        );
        assert_eq!(p.to_string(), "00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60");
    }

    #[rstest]
    #[case::no_dash("00bgd045z0d4icpbc2yyz4gx48ak44lanet-tools")]
    #[case::short_digest("00bgd045z0d4icpbc2yy-net-tools")]
    #[case::bad_digest("00bgd045z0d4icpbc2yyz4gx48aku4la-net-tools")]
    #[case::leading_dot("00bgd045z0d4icpbc2yyz4gx48ak44la-.gitignore")]
    #[case::subpath("00bgd045z0d4icpbc2yyz4gx48ak44la-x/bin/x")]
    fn rejects(#[case] s: &str) {
        StorePath::from_base_name(s).unwrap_err();
    }

    #[test]
    fn compress_folds_by_xor() {
        // 21 bytes fold into 20: byte 0 picks up input[20].
        let mut input = [0u8; 21];
        input[0] = 0x0f;
        input[20] = 0xf0;
        let out = compress_hash::<20>(&input);
        assert_eq!(out[0], 0xff);
        assert!(out[1..].iter().all(|b| *b == 0));
    }

    /// Same inputs always mint the same path, and every fingerprint part
    /// participates in the digest.
    #[test]
    fn text_path_is_deterministic() {
        let dir = StoreDirectory::default();
        let refs = StoreReferences::default();
        let a = text_path(&dir, "foo", "bar", &refs).unwrap();
        let b = text_path(&dir, "foo", "bar", &refs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), "foo");

        let c = text_path(&dir, "foo", "baz", &refs).unwrap();
        assert_ne!(a.digest(), c.digest());

        let mut with_ref = StoreReferences::default();
        with_ref.others.insert(dir.display_path(&a));
        let d = text_path(&dir, "foo", "bar", &with_ref).unwrap();
        assert_ne!(a.digest(), d.digest());

        let self_ref = StoreReferences {
            others: Default::default(),
            self_ref: true,
        };
        let e = text_path(&dir, "foo", "bar", &self_ref).unwrap();
        assert_ne!(a.digest(), e.digest());
    }

    #[test]
    fn fixed_ca_ignores_store_contents() {
        let dir = StoreDirectory::default();
        let h = Hash::digest(HashAlgorithm::Sha256, "tarball");
        let ca = ContentAddress::Flat(h);
        let p = ca_path(&dir, "src.tar.gz", &ca, &StoreReferences::default()).unwrap();
        assert_eq!(p.name(), "src.tar.gz");

        // Flat CAs never carry references.
        let mut refs = StoreReferences::default();
        refs.others.insert(dir.display_path(&p));
        assert!(ca_path(&dir, "src.tar.gz", &ca, &refs).is_err());
    }

    #[test]
    fn recursive_sha256_is_source_kind() {
        let dir = StoreDirectory::default();
        let h = Hash::digest(HashAlgorithm::Sha256, "nar bytes");
        let source = ca_path(
            &dir,
            "tree",
            &ContentAddress::Recursive(h.clone()),
            &StoreReferences::default(),
        )
        .unwrap();
        let fixed = ca_path(
            &dir,
            "tree",
            &ContentAddress::Flat(h),
            &StoreReferences::default(),
        )
        .unwrap();
        assert_ne!(source.digest(), fixed.digest());
    }
}
