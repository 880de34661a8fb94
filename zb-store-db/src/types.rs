// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Metadata of one registered store object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    /// Absolute store path.
    pub path: String,
    /// `sha256:<hex>` of the object's NAR serialization.
    pub nar_hash: String,
    pub nar_size: u64,
    /// Content address in text form, if content-addressed.
    pub ca: Option<String>,
    /// Absolute path of the deriving `.drv`, if known.
    pub deriver: Option<String>,
    /// Unix seconds.
    pub registration_time: i64,
    /// Absolute store paths referenced by the object, including itself
    /// for self-referential objects.
    pub references: BTreeSet<String>,
}

/// Parameters for registering a store object.
#[derive(Clone, Debug)]
pub struct RegisterObject {
    pub path: String,
    pub nar_hash: String,
    pub nar_size: u64,
    pub ca: Option<String>,
    pub deriver: Option<String>,
    pub references: BTreeSet<String>,
}

/// Scheduler job state. Transitions are monotonic:
/// `active → success | fail | error`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStatus {
    Unknown,
    Active,
    Success,
    Fail,
    Error,
}

impl BuildStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Unknown => "unknown",
            BuildStatus::Active => "active",
            BuildStatus::Success => "success",
            BuildStatus::Fail => "fail",
            BuildStatus::Error => "error",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Fail | BuildStatus::Error)
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(BuildStatus::Unknown),
            "active" => Ok(BuildStatus::Active),
            "success" => Ok(BuildStatus::Success),
            "fail" => Ok(BuildStatus::Fail),
            "error" => Ok(BuildStatus::Error),
            other => Err(Error::BadValue(format!("build status {other:?}"))),
        }
    }
}

/// One row of the Builds table, with its per-derivation results.
#[derive(Clone, Debug)]
pub struct BuildRecord {
    pub id: i64,
    pub status: BuildStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    /// Root derivation paths the client asked to realise.
    pub drv_paths: Vec<String>,
    /// Populated for builds created by the expand operation.
    pub expand_result: Option<serde_json::Value>,
    pub results: Vec<BuildResultRecord>,
}

/// Outcome of one output of one derivation within a build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildResultRecord {
    pub drv_path: String,
    pub output_name: String,
    pub output_path: Option<String>,
    pub status: BuildStatus,
}

/// A realisation cache entry: a build fingerprint resolved to the
/// output it produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Realisation {
    pub output_name: String,
    pub output_path: String,
    pub ca: String,
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
