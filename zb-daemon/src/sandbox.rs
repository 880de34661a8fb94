// SPDX-License-Identifier: MIT

//! Builder process isolation.
//!
//! The [Sandbox] trait abstracts how a builder is launched: directly
//! ([NoSandbox], for platforms without namespace support or when
//! disabled in the config) or inside fresh Linux namespaces
//! ([crate::linux_sandbox::LinuxSandbox]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

/// One bind mount into the sandbox filesystem view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxMount {
    /// Source path on the host.
    pub source: PathBuf,
    /// Destination inside the sandbox.
    pub target: PathBuf,
    pub read_only: bool,
    /// A missing source is tolerated.
    pub optional: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox setup failed: {0}")]
    Setup(String),
    #[error("failed to spawn builder: {0}")]
    Spawn(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a builder process is launched and isolated.
pub trait Sandbox: Send + Sync {
    /// Launch `builder` with `args` and exactly `env`, cwd `work_dir`.
    /// The child is its own process group so timeouts can kill the
    /// whole tree; stdout and stderr are piped.
    fn spawn(
        &self,
        builder: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> impl std::future::Future<Output = Result<SandboxChild, SandboxError>> + Send;

    /// The filesystem view this sandbox will impose, for logging and
    /// tests. Empty means the host filesystem is visible.
    fn mount_plan(&self) -> Vec<SandboxMount> {
        Vec::new()
    }
}

/// A running builder.
pub struct SandboxChild {
    inner: tokio::process::Child,
}

impl SandboxChild {
    pub fn from_child(child: tokio::process::Child) -> Self {
        SandboxChild { inner: child }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        self.inner.wait().await.map_err(SandboxError::Io)
    }

    pub async fn kill(&mut self) -> Result<(), SandboxError> {
        self.inner.kill().await.map_err(SandboxError::Io)
    }

    pub fn take_stdout(&mut self) -> Option<impl tokio::io::AsyncRead + Send + Unpin + use<>> {
        self.inner.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<impl tokio::io::AsyncRead + Send + Unpin + use<>> {
        self.inner.stderr.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.id()
    }
}

/// Run the builder directly, with no isolation beyond a scrubbed
/// environment and a fresh working directory.
#[derive(Default)]
pub struct NoSandbox;

impl NoSandbox {
    pub fn new() -> Self {
        NoSandbox
    }
}

impl Sandbox for NoSandbox {
    async fn spawn(
        &self,
        builder: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        use std::process::Stdio;

        let mut cmd = tokio::process::Command::new(builder);
        cmd.args(args)
            .current_dir(work_dir)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{builder}: {e}")))?;
        Ok(SandboxChild::from_child(child))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::io::AsyncReadExt as _;

    use super::{NoSandbox, Sandbox as _};

    #[tokio::test]
    async fn runs_with_exactly_the_given_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([
            ("ONLY_VAR".to_string(), "only-value".to_string()),
            ("PATH".to_string(), "/path-not-set".to_string()),
        ]);

        let sandbox = NoSandbox::new();
        let mut child = sandbox
            .spawn("/bin/sh", &["-c".into(), "env".into()], &env, dir.path())
            .await
            .unwrap();

        let mut stdout = child.take_stdout().unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert!(out.contains("ONLY_VAR=only-value"));
        assert!(out.contains("PATH=/path-not-set"));
        assert!(!out.contains("HOME="), "inherited env leaked: {out}");
    }

    #[tokio::test]
    async fn nonzero_exit_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = NoSandbox::new();
        let mut child = sandbox
            .spawn(
                "/bin/sh",
                &["-c".into(), "exit 7".into()],
                &BTreeMap::new(),
                dir.path(),
            )
            .await
            .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
