// SPDX-License-Identifier: MIT

//! Hash algorithms and digests used throughout the store.
//!
//! SHA-256 is the only algorithm the store itself produces; md5, sha1 and
//! sha512 are accepted for fixed-output content addresses because upstream
//! sources are still pinned with them in the wild.

use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

use crate::base32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Digest size in bytes.
    pub const fn size(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// A digest tagged with its algorithm.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash {
    algorithm: HashAlgorithm,
    digest: Vec<u8>,
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum HashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("digest has {got} bytes, {algorithm} wants {}", .algorithm.size())]
    BadDigestLength { algorithm: HashAlgorithm, got: usize },
    #[error("digest is neither hex nor base-32 for {0}")]
    BadDigestEncoding(HashAlgorithm),
    #[error("hash is missing an \"algo:\" prefix: {0}")]
    MissingAlgorithm(String),
}

impl Hash {
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>) -> Result<Self, HashError> {
        if digest.len() != algorithm.size() {
            return Err(HashError::BadDigestLength {
                algorithm,
                got: digest.len(),
            });
        }
        Ok(Hash { algorithm, digest })
    }

    /// Hash `data` in one shot.
    pub fn digest(algorithm: HashAlgorithm, data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data.as_ref());
        hasher.finish()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex of the digest, no algorithm prefix.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.digest)
    }

    /// Base-32 of the digest, no algorithm prefix.
    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }

    /// Parse a bare digest whose algorithm is known out of band.
    /// Accepts lowercase hex and the store base-32 alphabet, telling them
    /// apart by length.
    pub fn parse_digest(algorithm: HashAlgorithm, s: &str) -> Result<Self, HashError> {
        let n = algorithm.size();
        if s.len() == n * 2 {
            let digest = HEXLOWER
                .decode(s.as_bytes())
                .map_err(|_| HashError::BadDigestEncoding(algorithm))?;
            Hash::new(algorithm, digest)
        } else if s.len() == base32::encode_len(n) {
            let digest = base32::decode(s.as_bytes())
                .map_err(|_| HashError::BadDigestEncoding(algorithm))?;
            Hash::new(algorithm, digest)
        } else {
            Err(HashError::BadDigestEncoding(algorithm))
        }
    }
}

impl fmt::Display for Hash {
    /// `<algo>:<hex>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = HashError;

    /// Parse `<algo>:<digest>` with a hex or base-32 digest.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, digest) = s
            .split_once(':')
            .ok_or_else(|| HashError::MissingAlgorithm(s.to_string()))?;
        let algorithm: HashAlgorithm = algo.parse()?;
        Hash::parse_digest(algorithm, digest)
    }
}

/// Incremental hashing over any of the supported algorithms.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Box<Sha512>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Box::new(Sha512::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Hash {
        match self {
            Hasher::Md5(h) => Hash {
                algorithm: HashAlgorithm::Md5,
                digest: h.finalize().to_vec(),
            },
            Hasher::Sha1(h) => Hash {
                algorithm: HashAlgorithm::Sha1,
                digest: h.finalize().to_vec(),
            },
            Hasher::Sha256(h) => Hash {
                algorithm: HashAlgorithm::Sha256,
                digest: h.finalize().to_vec(),
            },
            Hasher::Sha512(h) => Hash {
                algorithm: HashAlgorithm::Sha512,
                digest: h.finalize().to_vec(),
            },
        }
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// SHA-256 of `data` as a raw 32-byte array. The store path fingerprints
/// only ever use this algorithm.
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data.as_ref()).into()
}
