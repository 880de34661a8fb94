// SPDX-License-Identifier: MIT

//! Content addresses.
//!
//! A content address names a store object by its bytes: the hash of the
//! raw file (`text` and `flat`) or of the NAR serialization of the tree
//! (`recursive`), together with the hash algorithm used.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{Hash, HashAlgorithm, HashError};

/// How the object bytes were fed to the hash function.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentAddressMethod {
    /// Hash of the raw file bytes; used for `.drv` files and other
    /// literal text additions.
    Text,
    /// Hash of the raw file bytes of a single-file fixed output.
    Flat,
    /// Hash of the NAR serialization of the tree.
    Recursive,
}

impl ContentAddressMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            ContentAddressMethod::Text => "text",
            ContentAddressMethod::Flat => "flat",
            ContentAddressMethod::Recursive => "recursive",
        }
    }
}

impl fmt::Display for ContentAddressMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method plus the digest it produced.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContentAddress {
    Text(Hash),
    Flat(Hash),
    Recursive(Hash),
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum ContentAddressError {
    #[error("invalid content address: {0:?}")]
    BadFormat(String),
    #[error("invalid content address hash: {0}")]
    BadHash(#[from] HashError),
}

impl ContentAddress {
    pub fn method(&self) -> ContentAddressMethod {
        match self {
            ContentAddress::Text(_) => ContentAddressMethod::Text,
            ContentAddress::Flat(_) => ContentAddressMethod::Flat,
            ContentAddress::Recursive(_) => ContentAddressMethod::Recursive,
        }
    }

    pub fn hash(&self) -> &Hash {
        match self {
            ContentAddress::Text(h) | ContentAddress::Flat(h) | ContentAddress::Recursive(h) => h,
        }
    }

    pub fn from_method(method: ContentAddressMethod, hash: Hash) -> Self {
        match method {
            ContentAddressMethod::Text => ContentAddress::Text(hash),
            ContentAddressMethod::Flat => ContentAddress::Flat(hash),
            ContentAddressMethod::Recursive => ContentAddress::Recursive(hash),
        }
    }
}

impl fmt::Display for ContentAddress {
    /// Text forms: `text:<algo>:<hex>`, `fixed:<algo>:<hex>`,
    /// `fixed:r:<algo>:<hex>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text(h) => write!(f, "text:{}:{}", h.algorithm(), h.to_hex()),
            ContentAddress::Flat(h) => write!(f, "fixed:{}:{}", h.algorithm(), h.to_hex()),
            ContentAddress::Recursive(h) => write!(f, "fixed:r:{}:{}", h.algorithm(), h.to_hex()),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = ContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ContentAddressError::BadFormat(s.to_string());

        let (prefix, rest) = s.split_once(':').ok_or_else(bad)?;
        match prefix {
            "text" => {
                let (algo, digest) = rest.split_once(':').ok_or_else(bad)?;
                let algorithm: HashAlgorithm = algo.parse()?;
                Ok(ContentAddress::Text(Hash::parse_digest(algorithm, digest)?))
            }
            "fixed" => {
                let (rest, recursive) = match rest.strip_prefix("r:") {
                    Some(rest) => (rest, true),
                    None => (rest, false),
                };
                let (algo, digest) = rest.split_once(':').ok_or_else(bad)?;
                let algorithm: HashAlgorithm = algo.parse()?;
                let hash = Hash::parse_digest(algorithm, digest)?;
                Ok(if recursive {
                    ContentAddress::Recursive(hash)
                } else {
                    ContentAddress::Flat(hash)
                })
            }
            _ => Err(bad()),
        }
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = ContentAddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentAddress> for String {
    fn from(ca: ContentAddress) -> String {
        ca.to_string()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ContentAddress, ContentAddressMethod};
    use crate::hash::{Hash, HashAlgorithm};

    #[rstest]
    #[case::text(ContentAddressMethod::Text, "text:sha256:")]
    #[case::flat(ContentAddressMethod::Flat, "fixed:sha256:")]
    #[case::recursive(ContentAddressMethod::Recursive, "fixed:r:sha256:")]
    fn render_and_parse(#[case] method: ContentAddressMethod, #[case] prefix: &str) {
        let hash = Hash::digest(HashAlgorithm::Sha256, "contents");
        let ca = ContentAddress::from_method(method, hash.clone());
        let text = ca.to_string();
        assert!(text.starts_with(prefix), "{text}");
        assert!(text.ends_with(&hash.to_hex()));
        assert_eq!(text.parse::<ContentAddress>().unwrap(), ca);
    }

    #[test]
    fn parse_base32_digest() {
        let hash = Hash::digest(HashAlgorithm::Sha1, "tarball");
        let text = format!("fixed:sha1:{}", hash.to_base32());
        let ca: ContentAddress = text.parse().unwrap();
        assert_eq!(ca, ContentAddress::Flat(hash));
    }

    #[rstest]
    #[case::no_prefix("sha256:abcd")]
    #[case::unknown_method("frob:sha256:abcd")]
    #[case::bad_algo("fixed:sha42:abcd")]
    #[case::truncated("text:sha256")]
    fn rejects(#[case] s: &str) {
        s.parse::<ContentAddress>().unwrap_err();
    }
}
