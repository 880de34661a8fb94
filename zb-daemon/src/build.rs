// SPDX-License-Identifier: MIT

//! Executing one derivation.
//!
//! Given a derivation whose inputs are all present, this module sets up
//! the build directory and environment, resolves placeholders, hands
//! the builder to the sandbox, captures its output into the log table,
//! and on success canonicalizes each output, scans it for references
//! while hashing it modulo its own path, moves it into the store, and
//! registers it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncBufReadExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zb_store_core::content_address::{ContentAddress, ContentAddressMethod};
use zb_store_core::derivation::{Derivation, OutputSpec};
use zb_store_core::hash::{Hash, HashAlgorithm, Hasher};
use zb_store_core::placeholder::Placeholder;
use zb_store_core::refscan::{HashModuloReader, RefFinder};
use zb_store_core::store_path::{self, StorePath, StoreReferences, compress_hash};
use zb_store_db::{RegisterObject, Realisation};

use crate::canonicalize::canonicalize_tree;
use crate::fingerprint::Fingerprint;
use crate::linux_sandbox::{LinuxSandbox, LinuxSandboxConfig};
use crate::pathlocks::PathLock;
use crate::sandbox::{NoSandbox, Sandbox, SandboxChild};
use crate::scheduler::{OutputsMap, RealizeError};
use crate::store::Daemon;

/// Derivations may opt into host network access.
const ENV_NETWORK: &str = "__network";
/// Space-separated extra host paths a derivation asks to see.
const ENV_SYSTEM_DEPS: &str = "__buildSystemDeps";

/// One declared output during the build: where the builder writes it,
/// and where it will finally live (known up front except for floating
/// outputs).
struct PlannedOutput {
    name: String,
    spec: OutputSpec,
    /// Absolute path the builder sees (`$out` etc.).
    build_path: PathBuf,
    build_path_abs: String,
    /// Final store path, if known before the build.
    known_final: Option<StorePath>,
}

enum SandboxKind {
    None(NoSandbox),
    Linux(Box<LinuxSandbox>),
}

impl SandboxKind {
    async fn spawn(
        &self,
        builder: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<SandboxChild, crate::sandbox::SandboxError> {
        match self {
            SandboxKind::None(s) => s.spawn(builder, args, env, work_dir).await,
            SandboxKind::Linux(s) => s.spawn(builder, args, env, work_dir).await,
        }
    }
}

/// Build one derivation and register its outputs. Returns the resolved
/// output paths.
#[allow(clippy::too_many_arguments)]
pub async fn build_derivation(
    daemon: &Arc<Daemon>,
    build_id: i64,
    drv_path: &StorePath,
    drv: &Arc<Derivation>,
    fingerprint: &Fingerprint,
    resolved_inputs: &BTreeMap<(StorePath, String), StorePath>,
    keep_failed: bool,
    cancel: CancellationToken,
) -> Result<OutputsMap, RealizeError> {
    let dir = &daemon.store_dir;

    // Scratch directory; preserved on failure when asked.
    let build_tmp = tempfile::Builder::new()
        .prefix("zb-build-")
        .tempdir_in(&daemon.config.build_dir)
        .map_err(|e| RealizeError::Internal(format!("creating build directory: {e}")))?;

    // Plan output locations.
    let mut outputs = Vec::new();
    for (name, spec) in &drv.outputs {
        let (on_disk, known_final) = match spec {
            OutputSpec::FloatingCA { .. } => {
                (temp_output_path(fingerprint, build_id, name, &drv.output_path_name(name)), None)
            }
            _ => {
                let path = drv
                    .output_store_path(dir, name)
                    .map_err(|e| RealizeError::Internal(e.to_string()))?
                    .expect("non-floating outputs have a path");
                (path.clone(), Some(path))
            }
        };
        let build_path = dir.join(&on_disk);
        outputs.push(PlannedOutput {
            name: name.clone(),
            spec: spec.clone(),
            build_path_abs: dir.display_path(&on_disk),
            build_path,
            known_final,
        });
    }

    // Clear leftovers from earlier failed runs.
    for output in &outputs {
        if output.build_path.exists() && !is_registered(daemon, &output.build_path_abs).await? {
            remove_path(&output.build_path);
        }
    }

    // Resolve placeholders against real paths; own outputs point at
    // their build locations until canonicalization.
    let mut substitutions = BTreeMap::new();
    for ((dep, out_name), path) in resolved_inputs {
        substitutions.insert(
            Placeholder::upstream_output(dep, out_name).to_string(),
            dir.display_path(path),
        );
    }
    for output in &outputs {
        substitutions.insert(
            Placeholder::own_output(&output.name).to_string(),
            output.build_path_abs.clone(),
        );
    }
    let mut resolved_drv = (**drv).clone();
    resolved_drv.resolve_placeholders(&substitutions);

    // The input closure: everything the builder may see, and the
    // needle set for reference scanning.
    let direct_inputs: BTreeSet<String> = resolved_drv
        .input_sources
        .iter()
        .map(|p| dir.display_path(p))
        .chain(resolved_inputs.values().map(|p| dir.display_path(p)))
        .collect();
    let input_closure = daemon
        .reference_closure(direct_inputs.iter().cloned().collect())
        .await
        .map_err(|e| RealizeError::Internal(e.to_string()))?;

    // Extra host paths must be explicitly allowed and present, or the
    // build is failed before it starts.
    let system_deps = validate_system_deps(daemon, &resolved_drv).map_err(RealizeError::Fail)?;

    let env = build_environment(daemon, &resolved_drv, build_tmp.path(), &outputs);
    let allow_network = drv.is_fixed_output()
        || drv.env.get(ENV_NETWORK).map(String::as_str) == Some("1");

    let sandbox = if daemon.config.sandbox && cfg!(target_os = "linux") {
        let root_dir = build_tmp.path().join(".sandbox-root");
        std::fs::create_dir_all(&root_dir)
            .map_err(|e| RealizeError::Internal(format!("creating sandbox root: {e}")))?;
        SandboxKind::Linux(Box::new(LinuxSandbox::new(LinuxSandboxConfig {
            root_dir,
            build_dir: build_tmp.path().to_owned(),
            input_paths: input_closure.iter().map(PathBuf::from).collect(),
            extra_paths: system_deps,
            allow_network,
        })))
    } else {
        SandboxKind::None(NoSandbox::new())
    };

    debug!(drv = %drv_path, builder = %resolved_drv.builder, "spawning builder");
    let child = sandbox
        .spawn(
            &resolved_drv.builder,
            &resolved_drv.args,
            &env,
            build_tmp.path(),
        )
        .await
        .map_err(|e| RealizeError::Fail(format!("builder for {drv_path} did not start: {e}")))?;

    let run = monitor_builder(daemon, build_id, child, &cancel).await;

    match run {
        BuilderRun::Exited(status) if status.success() => {}
        BuilderRun::Exited(status) => {
            cleanup_failed(&outputs, keep_failed);
            preserve_build_dir(build_tmp, keep_failed);
            return Err(RealizeError::Fail(format!(
                "builder for {drv_path} failed with {status}"
            )));
        }
        BuilderRun::TimedOut => {
            cleanup_failed(&outputs, keep_failed);
            preserve_build_dir(build_tmp, keep_failed);
            return Err(RealizeError::Fail(format!("build of {drv_path} timed out")));
        }
        BuilderRun::Cancelled => {
            cleanup_failed(&outputs, false);
            return Err(RealizeError::Cancelled);
        }
        BuilderRun::Failed(message) => {
            cleanup_failed(&outputs, keep_failed);
            preserve_build_dir(build_tmp, keep_failed);
            return Err(RealizeError::Internal(message));
        }
    }

    // Post-process off the async runtime: canonicalize, scan, hash,
    // rename, register.
    let daemon2 = Arc::clone(daemon);
    let drv2 = Arc::clone(drv);
    let drv_path2 = drv_path.clone();
    let fingerprint2 = fingerprint.clone();
    let planned: Vec<(String, OutputSpec, PathBuf, String, Option<StorePath>)> = outputs
        .iter()
        .map(|o| {
            (
                o.name.clone(),
                o.spec.clone(),
                o.build_path.clone(),
                o.build_path_abs.clone(),
                o.known_final.clone(),
            )
        })
        .collect();
    let closure2 = input_closure.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        finalize_outputs(&daemon2, build_id, &drv_path2, &drv2, &fingerprint2, planned, closure2)
    })
    .await
    .map_err(|e| RealizeError::Internal(format!("post-processing task: {e}")))?;

    match &outcome {
        Err(RealizeError::Fail(_)) => {
            cleanup_failed(&outputs, keep_failed);
            preserve_build_dir(build_tmp, keep_failed);
        }
        Err(_) => cleanup_failed(&outputs, false),
        Ok(_) => {}
    }
    outcome
}

async fn is_registered(daemon: &Arc<Daemon>, abs: &str) -> Result<bool, RealizeError> {
    let abs = abs.to_string();
    daemon
        .with_db(move |db| db.object_exists(&abs))
        .await
        .map_err(|e| RealizeError::Internal(e.to_string()))
}

/// A stable pseudo-random store path for a floating output during the
/// build. Same digest width as the final path, so the post-build
/// rewrite substitutes byte-for-byte.
fn temp_output_path(
    fingerprint: &Fingerprint,
    build_id: i64,
    output_name: &str,
    path_name: &str,
) -> StorePath {
    let digest = compress_hash::<20>(&zb_store_core::hash::sha256(format!(
        "rewrite:{}:{build_id}:{output_name}",
        fingerprint.to_hex()
    )));
    StorePath::new(digest, path_name).expect("path name validated with the derivation")
}

fn validate_system_deps(daemon: &Arc<Daemon>, drv: &Derivation) -> Result<Vec<PathBuf>, String> {
    let Some(requested) = drv.env.get(ENV_SYSTEM_DEPS) else {
        return Ok(Vec::new());
    };

    let mut deps = Vec::new();
    for dep in requested.split_whitespace() {
        let path = PathBuf::from(dep);
        if !path.is_absolute() {
            return Err(format!("{ENV_SYSTEM_DEPS}: {dep} is not absolute"));
        }
        let allowed = daemon
            .config
            .allowed_system_deps
            .iter()
            .any(|prefix| path.starts_with(prefix));
        if !allowed {
            return Err(format!("{ENV_SYSTEM_DEPS}: {dep} is not permitted by policy"));
        }
        if !path.exists() {
            return Err(format!("{ENV_SYSTEM_DEPS}: {dep} does not exist"));
        }
        deps.push(path);
    }
    Ok(deps)
}

/// Assemble the builder environment: fixed defaults, then the
/// derivation's variables, then the per-build values nothing may
/// override.
fn build_environment(
    daemon: &Arc<Daemon>,
    drv: &Derivation,
    build_dir: &Path,
    outputs: &[PlannedOutput],
) -> BTreeMap<String, String> {
    let build_dir_str = build_dir.to_string_lossy().to_string();
    let mut env = BTreeMap::new();

    env.insert("HOME".into(), "/home-not-set".into());
    env.insert("PATH".into(), "/path-not-set".into());

    for (key, value) in &drv.env {
        env.insert(key.clone(), value.clone());
    }

    env.insert("ZB_STORE".into(), daemon.store_dir.to_string());
    env.insert(
        "ZB_BUILD_CORES".into(),
        daemon.config.effective_build_cores().to_string(),
    );
    env.insert("ZB_BUILD_TOP".into(), build_dir_str.clone());
    for var in ["TEMP", "TEMPDIR", "TMP", "TMPDIR"] {
        env.insert(var.into(), build_dir_str.clone());
    }

    for output in outputs {
        env.insert(output.name.clone(), output.build_path_abs.clone());
    }

    env
}

enum BuilderRun {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    Failed(String),
}

/// Wait for the builder while pumping its output into the log table,
/// enforcing the wall-clock timeout, and honoring cancellation. Kills
/// the whole process group on the way out.
async fn monitor_builder(
    daemon: &Arc<Daemon>,
    build_id: i64,
    mut child: SandboxChild,
    cancel: &CancellationToken,
) -> BuilderRun {
    let pid = child.pid();

    let stdout = child.take_stdout();
    let stderr = child.take_stderr();
    let out_pump = tokio::spawn(pump_log(Arc::clone(daemon), build_id, stdout));
    let err_pump = tokio::spawn(pump_log(Arc::clone(daemon), build_id, stderr));

    let timeout = match daemon.config.build_timeout_secs {
        0 => None,
        secs => Some(tokio::time::Duration::from_secs(secs)),
    };

    enum Decision {
        Exited(Result<std::process::ExitStatus, crate::sandbox::SandboxError>),
        TimedOut,
        Cancelled,
    }

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    let decision = tokio::select! {
        status = child.wait() => Decision::Exited(status),
        _ = deadline => Decision::TimedOut,
        _ = cancel.cancelled() => Decision::Cancelled,
    };

    let run = match decision {
        Decision::Exited(Ok(status)) => BuilderRun::Exited(status),
        Decision::Exited(Err(e)) => BuilderRun::Failed(format!("waiting for builder: {e}")),
        Decision::TimedOut => {
            kill_process_group(pid);
            let _ = child.wait().await;
            BuilderRun::TimedOut
        }
        Decision::Cancelled => {
            kill_process_group(pid);
            let _ = child.wait().await;
            BuilderRun::Cancelled
        }
    };

    // Drain whatever output made it out before the exit or kill.
    let _ = out_pump.await;
    let _ = err_pump.await;
    run
}

/// Copy one output stream into the log table, a line at a time.
async fn pump_log(
    daemon: Arc<Daemon>,
    build_id: i64,
    stream: Option<impl tokio::io::AsyncRead + Send + Unpin>,
) {
    let Some(stream) = stream else { return };
    let mut lines = tokio::io::BufReader::new(stream).lines();
    let mut buffer = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                buffer.extend_from_slice(line.as_bytes());
                buffer.push(b'\n');
                if buffer.len() >= 8 * 1024 {
                    flush_log(&daemon, build_id, std::mem::take(&mut buffer)).await;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    if !buffer.is_empty() {
        flush_log(&daemon, build_id, buffer).await;
    }
}

async fn flush_log(daemon: &Arc<Daemon>, build_id: i64, chunk: Vec<u8>) {
    if let Err(e) = daemon
        .with_db(move |db| db.append_log_chunk(build_id, &chunk))
        .await
    {
        warn!(build_id, error = %e, "failed to persist build log chunk");
    }
}

#[allow(unsafe_code)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: a negative pid addresses the process group we
        // created with process_group(0) at spawn time.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

/// Everything after a successful builder exit. Blocking.
fn finalize_outputs(
    daemon: &Arc<Daemon>,
    build_id: i64,
    drv_path: &StorePath,
    drv: &Arc<Derivation>,
    fingerprint: &Fingerprint,
    planned: Vec<(String, OutputSpec, PathBuf, String, Option<StorePath>)>,
    input_closure: Vec<String>,
) -> Result<OutputsMap, RealizeError> {
    let dir = &daemon.store_dir;
    let drv_abs = dir.display_path(drv_path);
    let mut results = OutputsMap::new();
    let mut registrations = Vec::new();
    let mut realisations = Vec::new();

    // Sibling outputs with pre-known paths participate in reference
    // detection; floating siblings cannot (their paths do not exist
    // until their own hashing completes).
    let known_siblings: Vec<String> = planned
        .iter()
        .filter_map(|(_, _, _, _, known)| known.as_ref().map(|p| dir.display_path(p)))
        .collect();

    for (name, spec, build_path, build_path_abs, known_final) in planned {
        if std::fs::symlink_metadata(&build_path).is_err() {
            return Err(RealizeError::Fail(format!(
                "builder for {drv_path} failed to produce output {name:?}"
            )));
        }

        canonicalize_tree(&build_path)
            .map_err(|e| RealizeError::Internal(format!("canonicalizing {name}: {e}")))?;

        // One pass over the NAR bytes: hash modulo the output's own
        // path while discovering references.
        let mut needles: Vec<String> = input_closure.clone();
        needles.extend(
            known_siblings
                .iter()
                .filter(|p| **p != build_path_abs)
                .cloned(),
        );
        let scan = scan_output(&build_path, &build_path_abs, &needles)
            .map_err(|e| RealizeError::Internal(format!("scanning {name}: {e}")))?;

        let mut references: BTreeSet<StorePath> = BTreeSet::new();
        for found in &scan.found {
            if let Ok(path) = dir.parse(found) {
                references.insert(path);
            }
        }

        let refs = StoreReferences {
            others: references.iter().map(|p| dir.display_path(p)).collect(),
            self_ref: scan.self_reference,
        };

        let (final_path, ca) = match &spec {
            OutputSpec::FloatingCA { method, algorithm } => {
                let ca = floating_ca(*method, *algorithm, &build_path, &scan)
                    .map_err(|e| RealizeError::Internal(e.to_string()))?;
                let final_path = store_path::ca_path(dir, drv.output_path_name(&name).as_str(), &ca, &refs)
                    .map_err(|e| {
                        RealizeError::Fail(format!("output {name} cannot be addressed: {e}"))
                    })?;
                (final_path, ca)
            }
            OutputSpec::FixedCA(declared) => {
                if scan.self_reference {
                    return Err(RealizeError::Fail(format!(
                        "fixed output {name} refers to its own path"
                    )));
                }
                let produced = produced_ca(
                    declared.method(),
                    declared.hash().algorithm(),
                    &build_path,
                    &scan,
                )
                .map_err(|e| RealizeError::Internal(e.to_string()))?;
                if produced != *declared {
                    return Err(RealizeError::Fail(format!(
                        "hash mismatch for fixed output {name}: declared {declared}, produced {produced}"
                    )));
                }
                (known_final.clone().expect("fixed outputs are planned"), produced)
            }
            OutputSpec::InputAddressed(_) => {
                let ca = ContentAddress::Recursive(scan.nar_hash.clone());
                (known_final.clone().expect("input-addressed outputs are planned"), ca)
            }
        };

        let final_abs = dir.display_path(&final_path);

        // Floating outputs were built under a temporary name: rewrite
        // embedded self-paths (same length by construction) and move
        // the tree into place.
        if final_path != dir.parse(&build_path_abs).map_err(|e| RealizeError::Internal(e.to_string()))? {
            if scan.self_reference {
                rewrite_tree(&build_path, build_path_abs.as_bytes(), final_abs.as_bytes())
                    .map_err(|e| RealizeError::Internal(format!("rewriting {name}: {e}")))?;
                canonicalize_tree(&build_path)
                    .map_err(|e| RealizeError::Internal(e.to_string()))?;
            }

            let final_on_disk = dir.join(&final_path);
            let lock = PathLock::lock(&final_on_disk)
                .map_err(|e| RealizeError::Internal(format!("locking {final_abs}: {e}")))?;
            if final_on_disk.exists() {
                // Somebody produced it first; identical by content
                // address.
                remove_path(&build_path);
            } else {
                std::fs::rename(&build_path, &final_on_disk)
                    .map_err(|e| RealizeError::Internal(format!("installing {final_abs}: {e}")))?;
            }
            lock.cleanup();
        }

        let mut reference_strings: BTreeSet<String> =
            references.iter().map(|p| dir.display_path(p)).collect();
        if scan.self_reference {
            reference_strings.insert(final_abs.clone());
        }

        registrations.push(RegisterObject {
            path: final_abs.clone(),
            nar_hash: format!("sha256:{}", scan.nar_hash.to_hex()),
            nar_size: scan.nar_size,
            ca: Some(ca.to_string()),
            deriver: Some(drv_abs.clone()),
            references: reference_strings,
        });
        if matches!(spec, OutputSpec::FloatingCA { .. }) {
            realisations.push(Realisation {
                output_name: name.clone(),
                output_path: final_abs.clone(),
                ca: ca.to_string(),
            });
        }

        debug!(build_id, output = %name, path = %final_abs, "output finalized");
        results.insert(name, final_path);
    }

    // One transaction for all outputs: sibling references resolve
    // regardless of order, and the realisation cache entries become
    // visible only with the registrations they point at.
    {
        let mut db = daemon.db.blocking_lock();
        db.register_objects(&registrations)
            .map_err(|e| RealizeError::Internal(format!("registering outputs: {e}")))?;
        for realisation in &realisations {
            db.insert_realisation(&fingerprint.to_hex(), realisation)
                .map_err(|e| RealizeError::Internal(e.to_string()))?;
        }
    }

    Ok(results)
}

struct ScanResult {
    nar_hash: Hash,
    nar_size: u64,
    found: BTreeSet<String>,
    self_reference: bool,
}

/// Stream the NAR of `path` through a [HashModuloReader] that zeroes
/// the output's own path, feeding a SHA-256 hasher and a [RefFinder]
/// primed with the input closure.
fn scan_output(path: &Path, self_abs: &str, needles: &[String]) -> std::io::Result<ScanResult> {
    // NAR production happens on a helper thread; this thread consumes
    // the substituted stream.
    let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(4);
    let dump_path = path.to_owned();
    let producer = std::thread::spawn(move || -> std::io::Result<()> {
        struct ChannelWriter(std::sync::mpsc::SyncSender<Vec<u8>>);
        impl std::io::Write for ChannelWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0
                    .send(buf.to_vec())
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        zb_nar::dump_path(&dump_path, &mut ChannelWriter(tx))
    });

    struct ChannelReader {
        rx: std::sync::mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
        offset: usize,
    }
    impl std::io::Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.offset == self.pending.len() {
                match self.rx.recv() {
                    Ok(chunk) => {
                        self.pending = chunk;
                        self.offset = 0;
                    }
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len() - self.offset);
            buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n)
        }
    }

    let zeros = vec![0u8; self_abs.len()];
    let mut modulo = HashModuloReader::new(
        ChannelReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
        self_abs.as_bytes(),
        &zeros,
    )
    .map_err(std::io::Error::other)?;

    let mut hasher = Hasher::new(HashAlgorithm::Sha256);
    let mut finder = RefFinder::with_patterns(needles.iter().map(String::as_bytes));
    let mut nar_size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = modulo.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        finder.feed(&buf[..n]);
        nar_size += n as u64;
    }

    producer
        .join()
        .map_err(|_| std::io::Error::other("archive producer panicked"))??;

    Ok(ScanResult {
        nar_hash: hasher.finish(),
        nar_size,
        found: finder
            .found()
            .into_iter()
            .map(|needle| String::from_utf8_lossy(&needle).into_owned())
            .collect(),
        self_reference: modulo.matched(),
    })
}

/// Content address of a floating output, per its declared method.
fn floating_ca(
    method: ContentAddressMethod,
    algorithm: HashAlgorithm,
    build_path: &Path,
    scan: &ScanResult,
) -> std::io::Result<ContentAddress> {
    match method {
        ContentAddressMethod::Recursive if algorithm == HashAlgorithm::Sha256 => {
            Ok(ContentAddress::Recursive(scan.nar_hash.clone()))
        }
        ContentAddressMethod::Recursive => {
            // Non-sha256 recursive hashes need a second pass with the
            // requested algorithm; self-references are unsupported
            // there because the path is minted from the digest alone.
            let mut hasher = Hasher::new(algorithm);
            zb_nar::dump_path(build_path, &mut hasher)?;
            Ok(ContentAddress::Recursive(hasher.finish()))
        }
        ContentAddressMethod::Flat => Ok(ContentAddress::Flat(hash_flat(build_path, algorithm)?)),
        ContentAddressMethod::Text => Ok(ContentAddress::Text(hash_flat(build_path, algorithm)?)),
    }
}

/// Content address actually produced by a fixed-output build.
fn produced_ca(
    method: ContentAddressMethod,
    algorithm: HashAlgorithm,
    build_path: &Path,
    scan: &ScanResult,
) -> std::io::Result<ContentAddress> {
    match method {
        ContentAddressMethod::Recursive if algorithm == HashAlgorithm::Sha256 => {
            // No self-references (checked by the caller), so the modulo
            // hash equals the plain NAR hash.
            Ok(ContentAddress::Recursive(scan.nar_hash.clone()))
        }
        _ => floating_ca(method, algorithm, build_path, scan),
    }
}

fn hash_flat(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<Hash> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "flat content addressing requires a single regular file",
        ));
    }
    let mut hasher = Hasher::new(algorithm);
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finish())
}

/// Replace `from` with the same-length `to` in every regular file and
/// symlink target under `root`.
fn rewrite_tree(root: &Path, from: &[u8], to: &[u8]) -> std::io::Result<()> {
    debug_assert_eq!(from.len(), to.len());
    let meta = std::fs::symlink_metadata(root)?;

    if meta.is_symlink() {
        let target = std::fs::read_link(root)?;
        let bytes = target.as_os_str().as_encoded_bytes();
        if contains(bytes, from) {
            let rewritten = replace(bytes, from, to);
            let new_target = std::ffi::OsString::from(String::from_utf8_lossy(&rewritten).into_owned());
            std::fs::remove_file(root)?;
            std::os::unix::fs::symlink(new_target, root)?;
        }
    } else if meta.is_file() {
        let bytes = std::fs::read(root)?;
        if contains(&bytes, from) {
            let mode = std::os::unix::fs::PermissionsExt::mode(&meta.permissions());
            std::fs::write(root, replace(&bytes, from, to))?;
            std::fs::set_permissions(
                root,
                std::os::unix::fs::PermissionsExt::from_mode(mode),
            )?;
        }
    } else if meta.is_dir() {
        for entry in std::fs::read_dir(root)? {
            rewrite_tree(&entry?.path(), from, to)?;
        }
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn replace(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack.len() - i >= from.len() && &haystack[i..i + from.len()] == from {
            out.extend_from_slice(to);
            i += from.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

fn cleanup_failed(outputs: &[PlannedOutput], keep_failed: bool) {
    for output in outputs {
        if !output.build_path.exists() {
            continue;
        }
        if keep_failed {
            let failed = output.build_path.with_file_name(format!(
                "{}.failed",
                output
                    .build_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            let _ = std::fs::rename(&output.build_path, &failed);
        } else {
            remove_path(&output.build_path);
        }
    }
}

fn preserve_build_dir(build_tmp: tempfile::TempDir, keep_failed: bool) {
    if keep_failed {
        let kept = build_tmp.keep();
        warn!(dir = %kept.display(), "keeping failed build directory");
    }
}

fn remove_path(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{replace, rewrite_tree, scan_output};

    #[test]
    fn replace_is_non_overlapping_and_length_preserving() {
        assert_eq!(replace(b"abcabc", b"abc", b"xyz"), b"xyzxyz");
        assert_eq!(replace(b"aaa", b"aa", b"bb"), b"bba");
        assert_eq!(replace(b"none", b"zz", b"yy"), b"none");
    }

    #[test]
    fn scan_detects_needles_and_self() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let self_abs = "/opt/zb/store/00000000000000000000000000000000-self";
        let needle = "/opt/zb/store/11111111111111111111111111111111-dep";
        let absent = "/opt/zb/store/22222222222222222222222222222222-unused";
        std::fs::write(
            out.join("script"),
            format!("#!/bin/sh\nexec {self_abs}/bin/tool --dep={needle}\n"),
        )
        .unwrap();

        let scan = scan_output(
            &out,
            self_abs,
            &[needle.to_string(), absent.to_string()],
        )
        .unwrap();

        assert!(scan.self_reference);
        assert!(scan.found.contains(needle));
        assert!(!scan.found.contains(absent));
        assert!(scan.nar_size > 0);
    }

    /// The modulo hash is invariant under renaming the self path.
    #[test]
    fn modulo_hash_is_rename_invariant() {
        let tmp = tempfile::tempdir().unwrap();

        let hash_with_self = |marker: &str| {
            let out = tmp.path().join(marker);
            std::fs::create_dir(&out).unwrap();
            let self_abs = format!("/opt/zb/store/{}-thing", marker.repeat(32));
            std::fs::write(out.join("f"), format!("points at {self_abs} here")).unwrap();
            scan_output(&out, &self_abs, &[]).unwrap().nar_hash
        };

        assert_eq!(hash_with_self("a"), hash_with_self("b"));
    }

    #[test]
    fn rewrite_updates_files_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("f"), "path=/old/path/value").unwrap();
        std::os::unix::fs::symlink("/old/path/value/bin", root.join("l")).unwrap();

        rewrite_tree(Path::new(&root), b"/old/path", b"/new/path").unwrap();

        assert_eq!(
            std::fs::read(root.join("f")).unwrap(),
            b"path=/new/path/value"
        );
        assert_eq!(
            std::fs::read_link(root.join("l")).unwrap().to_str().unwrap(),
            "/new/path/value/bin"
        );
    }
}
