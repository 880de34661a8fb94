// SPDX-License-Identifier: MIT

//! Linux build isolation via namespaces.
//!
//! The builder is forked, unshares user + mount (and usually network)
//! namespaces, maps the daemon's uid/gid to 0/0 so it may mount and
//! pivot without privilege, assembles a minimal root filesystem from
//! bind mounts, pivots into it, and execs. Visible inside:
//!
//! * the derivation's input closure, read-only, at its store paths;
//! * the build directory, read-write;
//! * extra host paths granted through `__buildSystemDeps`, read-only;
//! * a minimal `/dev` (null, zero, random, urandom, tty, ptmx, and a
//!   fresh tmpfs `/dev/shm`), `/proc`, `/sys`, and a tmpfs `/tmp`.
//!
//! A fresh network namespace is created unless the derivation may reach
//! the network (fixed-output, or `__network = "1"`); the loopback
//! interface is brought up either way.
//!
//! Unprivileged user namespaces must be enabled on the host.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::sandbox::{Sandbox, SandboxChild, SandboxError, SandboxMount};

/// Devices bind-mounted from the host into the sandbox `/dev`.
const DEV_NODES: &[&str] = &["null", "zero", "random", "urandom", "tty", "ptmx"];

/// Parameters of one sandboxed build.
pub struct LinuxSandboxConfig {
    /// Scratch directory that becomes the sandbox root. Must exist and
    /// be empty; the caller removes it after the build.
    pub root_dir: PathBuf,
    /// The temporary build directory, mounted read-write and used as
    /// the working directory.
    pub build_dir: PathBuf,
    /// Input closure store paths, mounted read-only.
    pub input_paths: Vec<PathBuf>,
    /// Validated `__buildSystemDeps` paths, mounted read-only.
    pub extra_paths: Vec<PathBuf>,
    /// Skip the fresh network namespace, exposing the host network.
    pub allow_network: bool,
}

pub struct LinuxSandbox {
    config: LinuxSandboxConfig,
}

impl LinuxSandbox {
    pub fn new(config: LinuxSandboxConfig) -> Self {
        LinuxSandbox { config }
    }

    fn bind_mounts(&self) -> Vec<SandboxMount> {
        let mut mounts = Vec::new();

        for path in &self.config.input_paths {
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path.clone(),
                read_only: true,
                optional: false,
            });
        }

        mounts.push(SandboxMount {
            source: self.config.build_dir.clone(),
            target: self.config.build_dir.clone(),
            read_only: false,
            optional: false,
        });

        for dev in DEV_NODES {
            let path = PathBuf::from(format!("/dev/{dev}"));
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path,
                read_only: false,
                optional: true,
            });
        }

        for path in ["/proc", "/sys"] {
            mounts.push(SandboxMount {
                source: PathBuf::from(path),
                target: PathBuf::from(path),
                read_only: false,
                optional: false,
            });
        }

        for path in &self.config.extra_paths {
            mounts.push(SandboxMount {
                source: path.clone(),
                target: path.clone(),
                read_only: true,
                optional: false,
            });
        }

        mounts
    }
}

impl Sandbox for LinuxSandbox {
    #[cfg(target_os = "linux")]
    async fn spawn(
        &self,
        builder: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        use std::os::unix::process::CommandExt as _;
        use std::process::Stdio;

        let mounts = self.bind_mounts();
        let root = self.config.root_dir.clone();
        let allow_network = self.config.allow_network;
        let cwd = work_dir.to_owned();

        // Captured before fork: inside the new user namespace our own
        // ids appear unmapped, and the id maps must name the ids from
        // the parent namespace.
        let real_uid = nix::unistd::getuid().as_raw();
        let real_gid = nix::unistd::getgid().as_raw();

        let mut cmd = std::process::Command::new(builder);
        cmd.args(args)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // pre_exec runs in the forked child, which is single-threaded
        // regardless of the daemon, so unshare(CLONE_NEWUSER) is
        // permitted there.
        // SAFETY: the closure only calls unshare/mount/pivot_root and
        // writes /proc/self files, all safe in a post-fork child.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || {
                setup::enter(&root, &mounts, allow_network, real_uid, real_gid)?;
                std::env::set_current_dir(&cwd)
            });
        }

        let mut tokio_cmd = tokio::process::Command::from(cmd);
        let child = tokio_cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{builder} in sandbox: {e}")))?;
        Ok(SandboxChild::from_child(child))
    }

    #[cfg(not(target_os = "linux"))]
    async fn spawn(
        &self,
        _builder: &str,
        _args: &[String],
        _env: &BTreeMap<String, String>,
        _work_dir: &Path,
    ) -> Result<SandboxChild, SandboxError> {
        Err(SandboxError::Setup(
            "namespace sandboxing is only supported on Linux".into(),
        ))
    }

    fn mount_plan(&self) -> Vec<SandboxMount> {
        self.bind_mounts()
    }
}

#[cfg(target_os = "linux")]
mod setup {
    use std::fs;
    use std::io;
    use std::path::Path;

    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::sched::{CloneFlags, unshare};

    use super::super::sandbox::SandboxMount;

    fn io_err(what: &str, e: impl std::fmt::Display) -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, format!("{what}: {e}"))
    }

    /// Runs in the forked child before exec.
    pub(super) fn enter(
        root: &Path,
        mounts: &[SandboxMount],
        allow_network: bool,
        real_uid: u32,
        real_gid: u32,
    ) -> io::Result<()> {
        let mut flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
        if !allow_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        unshare(flags).map_err(|e| io_err("unshare", e))?;

        fs::write("/proc/self/uid_map", format!("0 {real_uid} 1\n"))
            .map_err(|e| io_err("write uid_map", e))?;
        // The kernel requires setgroups to be denied before an
        // unprivileged gid_map write.
        fs::write("/proc/self/setgroups", "deny\n").map_err(|e| io_err("write setgroups", e))?;
        fs::write("/proc/self/gid_map", format!("0 {real_gid} 1\n"))
            .map_err(|e| io_err("write gid_map", e))?;

        // Stop mount events from leaking back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| io_err("make / private", e))?;

        // The new root must itself be a mount point for pivot_root.
        mount(
            Some(root),
            root,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| io_err("self-bind root", e))?;

        for m in mounts {
            bind_into(root, m)?;
        }

        for tmpfs in ["tmp", "dev/shm"] {
            let target = root.join(tmpfs);
            fs::create_dir_all(&target)?;
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::empty(),
                Some("mode=1777"),
            )
            .map_err(|e| io_err("mount tmpfs", e))?;
        }

        // Swap roots and drop the old one.
        let old_root = root.join(".old-root");
        fs::create_dir_all(&old_root)?;
        nix::unistd::pivot_root(root, &old_root).map_err(|e| io_err("pivot_root", e))?;
        std::env::set_current_dir("/")?;
        umount2("/.old-root", MntFlags::MNT_DETACH).map_err(|e| io_err("detach old root", e))?;
        let _ = fs::remove_dir("/.old-root");

        if !allow_network {
            bring_up_loopback()?;
        }

        Ok(())
    }

    fn bind_into(root: &Path, m: &SandboxMount) -> io::Result<()> {
        if !m.source.exists() {
            if m.optional {
                return Ok(());
            }
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("sandbox mount source {} is missing", m.source.display()),
            ));
        }

        let rel = m.target.strip_prefix("/").unwrap_or(&m.target);
        let target = root.join(rel);

        if m.source.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if !target.exists() {
                fs::File::create(&target)?;
            }
        }

        mount(
            Some(&m.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| io_err("bind mount", e))?;

        if m.read_only {
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| io_err("remount read-only", e))?;
        }

        Ok(())
    }

    /// `ip link set lo up`, without a netlink library.
    #[allow(unsafe_code)]
    fn bring_up_loopback() -> io::Result<()> {
        // SAFETY: plain socket/ioctl calls on a zeroed ifreq whose name
        // is the NUL-terminated literal "lo".
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut ifr: libc::ifreq = std::mem::zeroed();
            for (slot, b) in ifr.ifr_name.iter_mut().zip(b"lo\0") {
                *slot = *b as libc::c_char;
            }

            if libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) < 0 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            if libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) < 0 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }
            libc::close(fd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{LinuxSandbox, LinuxSandboxConfig};
    use crate::sandbox::Sandbox as _;

    fn config(build_dir: &Path) -> LinuxSandboxConfig {
        LinuxSandboxConfig {
            root_dir: build_dir.join(".root"),
            build_dir: build_dir.to_path_buf(),
            input_paths: vec![PathBuf::from("/opt/zb/store/aaaa-dep")],
            extra_paths: vec![PathBuf::from("/bin")],
            allow_network: false,
        }
    }

    #[test]
    fn mount_plan_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = LinuxSandbox::new(config(tmp.path()));
        let plan = sandbox.mount_plan();

        let input = plan
            .iter()
            .find(|m| m.source == Path::new("/opt/zb/store/aaaa-dep"))
            .expect("input mounted");
        assert!(input.read_only);

        let build = plan
            .iter()
            .find(|m| m.source == tmp.path())
            .expect("build dir mounted");
        assert!(!build.read_only);

        assert!(plan.iter().any(|m| m.source == Path::new("/dev/null") && m.optional));
        assert!(plan.iter().any(|m| m.source == Path::new("/proc")));
        let extra = plan
            .iter()
            .find(|m| m.source == Path::new("/bin"))
            .expect("extra path mounted");
        assert!(extra.read_only);
    }

    /// Inside the namespace the builder appears as root and only sees
    /// the assembled filesystem. Needs unprivileged user namespaces;
    /// uses the current-thread runtime because unshare(CLONE_NEWUSER)
    /// requires a single-threaded child.
    #[tokio::test(flavor = "current_thread")]
    #[cfg(target_os = "linux")]
    #[ignore = "requires kernel.unprivileged_userns_clone"]
    async fn isolation_smoke() {
        let tmp = tempfile::tempdir().unwrap();
        let build_dir = tmp.path().join("build");
        std::fs::create_dir(&build_dir).unwrap();
        let root_dir = tmp.path().join("root");
        std::fs::create_dir(&root_dir).unwrap();

        let sandbox = LinuxSandbox::new(LinuxSandboxConfig {
            root_dir,
            build_dir: build_dir.clone(),
            input_paths: vec![],
            extra_paths: vec![PathBuf::from("/bin"), PathBuf::from("/usr"), PathBuf::from("/lib"), PathBuf::from("/lib64")],
            allow_network: false,
        });

        let env = std::collections::BTreeMap::from([(
            "PATH".to_string(),
            "/bin:/usr/bin".to_string(),
        )]);
        let script = "id -u > result; ls / > listing";
        let mut child = sandbox
            .spawn("/bin/sh", &["-c".into(), script.into()], &env, &build_dir)
            .await
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let uid = std::fs::read_to_string(build_dir.join("result")).unwrap();
        assert_eq!(uid.trim(), "0", "mapped to root inside the namespace");
        let listing = std::fs::read_to_string(build_dir.join("listing")).unwrap();
        assert!(!listing.contains("home"), "host filesystem leaked: {listing}");
    }
}
