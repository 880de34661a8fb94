// SPDX-License-Identifier: MIT

//! Daemon configuration.
//!
//! Loaded from the TOML file named by `ZB_DAEMON_CONFIG`, falling back
//! to built-in defaults. Every field has a default so a partial file is
//! fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, IoContext as _};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path of the listening Unix socket.
    pub socket_path: PathBuf,

    /// The store directory. Changing it invalidates every existing
    /// store object, because objects embed their own paths.
    pub store_dir: PathBuf,

    /// Path of the catalogue database.
    pub db_path: PathBuf,

    /// Parent directory for temporary build directories.
    pub build_dir: PathBuf,

    /// Maximum number of concurrently running builders. Zero means the
    /// number of available CPUs.
    pub max_jobs: usize,

    /// Value of `ZB_BUILD_CORES` inside builds. Zero means the number
    /// of available CPUs.
    pub build_cores: usize,

    /// Isolate builders in namespaces (Linux only; elsewhere builders
    /// run unsandboxed).
    pub sandbox: bool,

    /// Host path prefixes that derivations may request through
    /// `__buildSystemDeps`. Requests outside these prefixes fail the
    /// build before it starts.
    pub allowed_system_deps: Vec<PathBuf>,

    /// Wall-clock build timeout in seconds, counted from the first
    /// builder start. Zero disables the timeout.
    pub build_timeout_secs: u64,

    /// Captured build logs are deleted after this many days.
    pub log_retention_days: u64,

    /// Terminal build records are deleted after this many days. Held to
    /// at least the log retention, so build statuses outlive their
    /// logs.
    pub build_retention_days: u64,

    /// Default log filter, overridden by `ZB_LOG`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: PathBuf::from("/opt/zb/var/zb/server.sock"),
            store_dir: PathBuf::from("/opt/zb/store"),
            db_path: PathBuf::from("/opt/zb/var/zb/db.sqlite"),
            build_dir: PathBuf::from("/opt/zb/var/zb/builds"),
            max_jobs: 0,
            build_cores: 0,
            sandbox: cfg!(target_os = "linux"),
            allowed_system_deps: vec![
                PathBuf::from("/bin"),
                PathBuf::from("/usr"),
                PathBuf::from("/lib"),
                PathBuf::from("/lib64"),
                PathBuf::from("/etc/resolv.conf"),
                PathBuf::from("/etc/ssl"),
            ],
            build_timeout_secs: 0,
            log_retention_days: 30,
            build_retention_days: 90,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if !self.store_dir.is_absolute() {
            return Err(DaemonError::Config(format!(
                "store_dir {} is not absolute",
                self.store_dir.display()
            )));
        }
        if self.build_retention_days < self.log_retention_days {
            return Err(DaemonError::Config(
                "build_retention_days must be at least log_retention_days".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_max_jobs(&self) -> usize {
        match self.max_jobs {
            0 => available_cpus(),
            n => n,
        }
    }

    pub fn effective_build_cores(&self) -> usize {
        match self.build_cores {
            0 => available_cpus(),
            n => n,
        }
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.effective_max_jobs() >= 1);
    }

    #[test]
    fn partial_toml() {
        let config: Config = toml::from_str("max_jobs = 3\nsandbox = false\n").unwrap();
        assert_eq!(config.max_jobs, 3);
        assert!(!config.sandbox);
        assert_eq!(config.log_retention_days, 30);
    }

    #[test]
    fn retention_ordering_enforced() {
        let config: Config =
            toml::from_str("log_retention_days = 10\nbuild_retention_days = 5\n").unwrap();
        config.validate().unwrap_err();
    }
}
