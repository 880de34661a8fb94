// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{message}: {source}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store database error: {0}")]
    Db(#[from] zb_store_db::Error),

    #[error(transparent)]
    StorePath(#[from] zb_store_core::store_path::StorePathError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("another store server is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("{0} exists and is not a socket; refusing to delete it")]
    NotASocket(PathBuf),
}

impl DaemonError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        DaemonError::Io {
            message: message.into(),
            source,
        }
    }
}

/// Attach human-readable context to IO results.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T, DaemonError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T, DaemonError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DaemonError::io(f(), e))
    }
}
