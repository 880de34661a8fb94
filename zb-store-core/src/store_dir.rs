// SPDX-License-Identifier: MIT

//! The store directory.
//!
//! Every store object lives directly under a single well-known absolute
//! directory. The directory is part of every fingerprint, so moving a
//! store invalidates all of its objects.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store_path::{StorePath, StorePathError};

/// Default store directory on Unix.
pub const DEFAULT_STORE_DIR: &str = "/opt/zb/store";

/// An absolute path under which all store objects live.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreDirectory(PathBuf);

impl StoreDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StorePathError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(StorePathError::StoreDirNotAbsolute(path));
        }
        Ok(StoreDirectory(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Absolute filesystem location of a store path.
    pub fn join(&self, path: &StorePath) -> PathBuf {
        self.0.join(path.to_string())
    }

    /// Absolute string form of a store path, as embedded in fingerprints,
    /// derivations, and built artifacts.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self, path)
    }

    /// Parse an absolute path string into the [StorePath] directly under
    /// this directory.
    pub fn parse(&self, s: &str) -> Result<StorePath, StorePathError> {
        let rest = s
            .strip_prefix(&format!("{}/", self))
            .ok_or_else(|| StorePathError::NotInStore(s.to_string()))?;
        if rest.contains('/') {
            return Err(StorePathError::NotInStore(s.to_string()));
        }
        rest.parse()
    }

    /// Like [StoreDirectory::parse], but accepts paths pointing below a
    /// store object and returns the trailing remainder separately.
    pub fn parse_prefix(&self, s: &str) -> Result<(StorePath, Option<String>), StorePathError> {
        let rest = s
            .strip_prefix(&format!("{}/", self))
            .ok_or_else(|| StorePathError::NotInStore(s.to_string()))?;
        match rest.split_once('/') {
            None => Ok((rest.parse()?, None)),
            Some((base, sub)) => Ok((base.parse()?, Some(sub.to_string()))),
        }
    }
}

impl Default for StoreDirectory {
    fn default() -> Self {
        StoreDirectory(PathBuf::from(DEFAULT_STORE_DIR))
    }
}

impl fmt::Display for StoreDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl FromStr for StoreDirectory {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StoreDirectory::new(s)
    }
}

impl TryFrom<String> for StoreDirectory {
    type Error = StorePathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        StoreDirectory::new(s)
    }
}

impl From<StoreDirectory> for String {
    fn from(dir: StoreDirectory) -> String {
        dir.to_string()
    }
}
