// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("store object {path} is already registered with a different content address")]
    CaMismatch { path: String },

    #[error("build {0} does not exist")]
    NoSuchBuild(i64),

    #[error("invalid persisted value: {0}")]
    BadValue(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
