// SPDX-License-Identifier: MIT

//! The build scheduler.
//!
//! A *job* is one client request (`zb.realize` or `zb.expand`): it
//! plans the derivation closure, fingerprints it, and realises the
//! roots. A *build* is one builder run for one fingerprint. Jobs share
//! builds: while a build for fingerprint F is in flight, every job
//! that needs F waits on the same outcome, and the builder runs exactly
//! once.
//!
//! Cancellation is waiter-counted: cancelling a job abandons its waits;
//! a running build is torn down only when its last waiter leaves.
//! Parallelism is bounded by the worker semaphore; queued builds start
//! in request order.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use zb_protocol::methods::ReusePolicy;
use zb_store_core::derivation::{Derivation, OutputSpec};
use zb_store_core::placeholder::Placeholder;
use zb_store_core::store_path::StorePath;
use zb_store_db::{BuildResultRecord, BuildStatus};

use crate::build;
use crate::error::DaemonError;
use crate::fingerprint::{Fingerprint, fingerprint_closure};
use crate::store::{Daemon, JobHandle};

/// Resolved output paths of one derivation.
pub type OutputsMap = BTreeMap<String, StorePath>;

/// Why a derivation could not be realised.
#[derive(Clone, Debug)]
pub enum RealizeError {
    /// The builder failed, produced bad outputs, or requested
    /// something it may not have. Dependents are not run.
    Fail(String),
    /// The store itself misbehaved (database, filesystem, sandbox
    /// setup). Never cached.
    Internal(String),
    /// An input derivation failed, so this one was not started.
    DependencyFailed(String),
    /// The job was cancelled while waiting.
    Cancelled,
}

impl RealizeError {
    fn status(&self) -> BuildStatus {
        match self {
            RealizeError::Fail(_) | RealizeError::DependencyFailed(_) => BuildStatus::Fail,
            RealizeError::Internal(_) | RealizeError::Cancelled => BuildStatus::Error,
        }
    }
}

/// Outcome shared between all waiters of one in-flight build.
pub(crate) type SharedOutcome = Result<Arc<OutputsMap>, RealizeError>;

pub(crate) struct InflightBuild {
    rx: watch::Receiver<Option<SharedOutcome>>,
    waiters: std::sync::Mutex<usize>,
    cancel: CancellationToken,
}

/// Fingerprint → in-flight build.
#[derive(Default)]
pub(crate) struct InflightMap(std::sync::Mutex<HashMap<Fingerprint, Arc<InflightBuild>>>);

/// Options of one realisation job.
#[derive(Clone, Debug)]
pub struct JobOptions {
    pub keep_failed: bool,
    pub reuse: ReusePolicy,
}

struct JobCtx {
    daemon: Arc<Daemon>,
    build_id: i64,
    options: JobOptions,
    cancel: CancellationToken,
    closure: HashMap<StorePath, Arc<Derivation>>,
    fingerprints: HashMap<StorePath, Fingerprint>,
}

/// Start a realisation job for `drv_paths`; returns the build id
/// immediately. Progress is observed through `zb.getBuild`.
pub async fn start_realize(
    daemon: Arc<Daemon>,
    drv_paths: Vec<String>,
    options: JobOptions,
) -> Result<i64, DaemonError> {
    let roots = validate_roots(&daemon, &drv_paths)?;
    let build_id = daemon
        .with_db(move |db| db.create_build(&drv_paths))
        .await?;

    let cancel = CancellationToken::new();
    daemon.register_job(build_id, JobHandle {
        cancel: cancel.clone(),
    });

    tokio::spawn(run_job(daemon, build_id, roots, options, cancel, None));
    Ok(build_id)
}

/// Start an expansion job: realise every *input* of `drv_path`, then
/// resolve the root derivation's placeholders without running its
/// builder. Own floating outputs resolve to paths under `temp_dir`.
pub async fn start_expand(
    daemon: Arc<Daemon>,
    drv_path: String,
    temp_dir: String,
    reuse: ReusePolicy,
) -> Result<i64, DaemonError> {
    let roots = validate_roots(&daemon, std::slice::from_ref(&drv_path))?;
    let build_id = daemon
        .with_db(move |db| db.create_build(&[drv_path]))
        .await?;

    let cancel = CancellationToken::new();
    daemon.register_job(build_id, JobHandle {
        cancel: cancel.clone(),
    });

    let options = JobOptions {
        keep_failed: false,
        reuse,
    };
    tokio::spawn(run_job(
        daemon,
        build_id,
        roots,
        options,
        cancel,
        Some(temp_dir),
    ));
    Ok(build_id)
}

fn validate_roots(daemon: &Daemon, drv_paths: &[String]) -> Result<Vec<StorePath>, DaemonError> {
    if drv_paths.is_empty() {
        return Err(DaemonError::Config("no derivation paths given".into()));
    }
    let mut roots = Vec::with_capacity(drv_paths.len());
    for path in drv_paths {
        let parsed = daemon.parse_store_path(path)?;
        if !parsed.is_derivation() {
            return Err(DaemonError::Config(format!("{path} is not a .drv path")));
        }
        if !daemon.store_dir.join(&parsed).exists() {
            return Err(DaemonError::Config(format!("{path} does not exist")));
        }
        roots.push(parsed);
    }
    Ok(roots)
}

#[instrument(skip_all, fields(build_id))]
async fn run_job(
    daemon: Arc<Daemon>,
    build_id: i64,
    roots: Vec<StorePath>,
    options: JobOptions,
    cancel: CancellationToken,
    expand_temp_dir: Option<String>,
) {
    let status = match job_inner(&daemon, build_id, &roots, options, cancel, expand_temp_dir).await
    {
        Ok(status) => status,
        Err(e) => {
            error!(build_id, error = %e, "job failed internally");
            BuildStatus::Error
        }
    };

    info!(build_id, status = status.as_str(), "job finished");
    if let Err(e) = daemon
        .with_db(move |db| db.finish_build(build_id, status))
        .await
    {
        error!(build_id, error = %e, "failed to persist job status");
    }
    daemon.finish_job(build_id);
}

async fn job_inner(
    daemon: &Arc<Daemon>,
    build_id: i64,
    roots: &[StorePath],
    options: JobOptions,
    cancel: CancellationToken,
    expand_temp_dir: Option<String>,
) -> Result<BuildStatus, DaemonError> {
    let closure = load_closure(daemon, roots).await?;
    let plain: HashMap<StorePath, Derivation> = closure
        .iter()
        .map(|(k, v)| (k.clone(), (**v).clone()))
        .collect();
    let fingerprints = fingerprint_closure(&daemon.store_dir, &plain)?;

    let ctx = Arc::new(JobCtx {
        daemon: Arc::clone(daemon),
        build_id,
        options,
        cancel,
        closure,
        fingerprints,
    });

    // Expansion realises the root's inputs, not the root itself.
    if let Some(temp_dir) = expand_temp_dir {
        return expand_root(&ctx, &roots[0], &temp_dir).await;
    }

    let outcomes = futures::future::join_all(
        roots
            .iter()
            .map(|root| realize_drv(Arc::clone(&ctx), root.clone())),
    )
    .await;

    let mut status = BuildStatus::Success;
    for outcome in outcomes {
        if let Err(e) = outcome {
            debug!(build_id, error = ?e, "root realisation failed");
            if status == BuildStatus::Success || e.status() == BuildStatus::Error {
                status = e.status();
            }
        }
    }
    Ok(status)
}

async fn expand_root(
    ctx: &Arc<JobCtx>,
    root: &StorePath,
    temp_dir: &str,
) -> Result<BuildStatus, DaemonError> {
    let drv = Arc::clone(&ctx.closure[root]);

    let dep_outcomes = futures::future::join_all(
        drv.input_derivations
            .keys()
            .map(|dep| realize_drv(Arc::clone(ctx), dep.clone())),
    )
    .await;

    let mut resolved = BTreeMap::new();
    for (dep, outcome) in drv.input_derivations.keys().zip(dep_outcomes) {
        match outcome {
            Ok(outputs) => {
                for (name, path) in outputs.iter() {
                    resolved.insert((dep.clone(), name.clone()), path.clone());
                }
            }
            Err(e) => return Ok(e.status()),
        }
    }

    // Substitute: upstream outputs to their real paths, own outputs to
    // scratch paths under the caller's temp directory.
    let mut substitutions = BTreeMap::new();
    for (dep, names) in &drv.input_derivations {
        for name in names {
            if let Some(path) = resolved.get(&(dep.clone(), name.clone())) {
                substitutions.insert(
                    Placeholder::upstream_output(dep, name).to_string(),
                    ctx.daemon.store_dir.display_path(path),
                );
            }
        }
    }
    for (name, spec) in &drv.outputs {
        let target = match spec {
            OutputSpec::FloatingCA { .. } => format!("{}/{}", temp_dir.trim_end_matches('/'), name),
            _ => match drv
                .output_store_path(&ctx.daemon.store_dir, name)
                .map_err(DaemonError::from)?
            {
                Some(path) => ctx.daemon.store_dir.display_path(&path),
                None => continue,
            },
        };
        substitutions.insert(Placeholder::own_output(name).to_string(), target);
    }

    let mut expanded = (*drv).clone();
    expanded.resolve_placeholders(&substitutions);

    let result = zb_protocol::methods::ExpandResult {
        builder: expanded.builder,
        args: expanded.args,
        env: expanded.env,
    };
    let build_id = ctx.build_id;
    ctx.daemon
        .with_db(move |db| {
            db.set_expand_result(build_id, &serde_json::to_value(&result)?)
        })
        .await?;
    Ok(BuildStatus::Success)
}

/// Read and parse the `.drv` closure of `roots` from the store.
async fn load_closure(
    daemon: &Arc<Daemon>,
    roots: &[StorePath],
) -> Result<HashMap<StorePath, Arc<Derivation>>, DaemonError> {
    let store_dir = daemon.store_dir.clone();
    let roots = roots.to_vec();
    tokio::task::spawn_blocking(move || {
        let mut closure: HashMap<StorePath, Arc<Derivation>> = HashMap::new();
        let mut queue: Vec<StorePath> = roots;
        while let Some(drv_path) = queue.pop() {
            if closure.contains_key(&drv_path) {
                continue;
            }
            let on_disk = store_dir.join(&drv_path);
            let bytes = std::fs::read(&on_disk).map_err(|e| {
                DaemonError::io(format!("reading {}", on_disk.display()), e)
            })?;
            let name = drv_path
                .name()
                .strip_suffix(".drv")
                .unwrap_or(drv_path.name());
            let drv = Derivation::parse_aterm(&store_dir, name, &bytes).map_err(|e| {
                DaemonError::Config(format!("parsing {}: {e}", on_disk.display()))
            })?;
            queue.extend(drv.input_derivations.keys().cloned());
            closure.insert(drv_path, Arc::new(drv));
        }
        Ok(closure)
    })
    .await
    .map_err(|e| DaemonError::io("planning task", std::io::Error::other(e)))?
}

fn realize_drv(
    ctx: Arc<JobCtx>,
    drv_path: StorePath,
) -> Pin<Box<dyn Future<Output = Result<Arc<OutputsMap>, RealizeError>> + Send>> {
    Box::pin(async move {
        let drv = Arc::clone(&ctx.closure[&drv_path]);

        // Inputs first: a builder never starts before every output of
        // every input derivation is present.
        let dep_outcomes = futures::future::join_all(
            drv.input_derivations
                .keys()
                .map(|dep| realize_drv(Arc::clone(&ctx), dep.clone())),
        )
        .await;

        let mut resolved: BTreeMap<(StorePath, String), StorePath> = BTreeMap::new();
        for (dep, outcome) in drv.input_derivations.keys().zip(dep_outcomes) {
            match outcome {
                Ok(outputs) => {
                    for (name, path) in outputs.iter() {
                        resolved.insert((dep.clone(), name.clone()), path.clone());
                    }
                }
                Err(RealizeError::Cancelled) => return Err(RealizeError::Cancelled),
                Err(_) => {
                    let failure = RealizeError::DependencyFailed(dep.to_string());
                    record_results(&ctx, &drv_path, &drv, None, failure.status()).await;
                    return Err(failure);
                }
            }
        }

        let fingerprint = ctx.fingerprints[&drv_path].clone();

        // Nothing to do if every output is already present (or cached
        // as a prior realisation the reuse policy accepts).
        match existing_outputs(&ctx, &drv, &fingerprint).await {
            Ok(Some(outputs)) => {
                debug!(drv = %drv_path, "outputs already present, skipping build");
                let outputs = Arc::new(outputs);
                record_results(&ctx, &drv_path, &drv, Some(&outputs), BuildStatus::Success).await;
                return Ok(outputs);
            }
            Ok(None) => {}
            Err(e) => return Err(RealizeError::Internal(e.to_string())),
        }

        // A build can come back `Cancelled` because some *other* job's
        // last waiter left just as we joined; only our own
        // cancellation is terminal for us, anything else is retried.
        let outcome = loop {
            let outcome =
                wait_or_build(&ctx, fingerprint.clone(), &drv_path, &drv, resolved.clone()).await;
            match &outcome {
                Err(RealizeError::Cancelled) if !ctx.cancel.is_cancelled() => {
                    // Let the finished leader unregister its entry.
                    tokio::task::yield_now().await;
                    continue;
                }
                _ => break outcome,
            }
        };
        match &outcome {
            Ok(outputs) => {
                record_results(&ctx, &drv_path, &drv, Some(outputs), BuildStatus::Success).await;
            }
            Err(e @ (RealizeError::Fail(_) | RealizeError::Internal(_))) => {
                record_results(&ctx, &drv_path, &drv, None, e.status()).await;
            }
            Err(_) => {}
        }
        outcome
    })
}

/// Resolve outputs without building, if possible.
async fn existing_outputs(
    ctx: &Arc<JobCtx>,
    drv: &Derivation,
    fingerprint: &Fingerprint,
) -> Result<Option<OutputsMap>, DaemonError> {
    let dir = &ctx.daemon.store_dir;

    let mut outputs = OutputsMap::new();
    let mut floating = Vec::new();
    for name in drv.outputs.keys() {
        match drv.output_store_path(dir, name)? {
            Some(path) => {
                outputs.insert(name.clone(), path);
            }
            None => floating.push(name.clone()),
        }
    }

    if !floating.is_empty() {
        // Prior realisations only stand in when the reuse policy admits
        // them; we hold no signatures, so a key-set policy rebuilds.
        if !ctx.options.reuse.allows_any() {
            return Ok(None);
        }
        let fp = fingerprint.to_hex();
        let cached = ctx
            .daemon
            .with_db(move |db| db.lookup_realisations(&fp))
            .await?;
        for name in &floating {
            let Some(found) = cached.iter().find(|r| &r.output_name == name) else {
                return Ok(None);
            };
            let path = match dir.parse(&found.output_path) {
                Ok(path) => path,
                Err(_) => return Ok(None),
            };
            outputs.insert(name.clone(), path);
        }
    }

    // Every output must actually be registered.
    let abs: Vec<String> = outputs.values().map(|p| dir.display_path(p)).collect();
    let all_present = ctx
        .daemon
        .with_db(move |db| {
            for path in &abs {
                if !db.object_exists(path)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await?;

    Ok(all_present.then_some(outputs))
}

async fn wait_or_build(
    ctx: &Arc<JobCtx>,
    fingerprint: Fingerprint,
    drv_path: &StorePath,
    drv: &Arc<Derivation>,
    resolved: BTreeMap<(StorePath, String), StorePath>,
) -> Result<Arc<OutputsMap>, RealizeError> {
    // Join the in-flight build for this fingerprint, or become its
    // leader.
    let (entry, leader_tx) = {
        let mut map = ctx.daemon.inflight.0.lock().unwrap();
        match map.get(&fingerprint) {
            Some(entry) => (Arc::clone(entry), None),
            None => {
                let (tx, rx) = watch::channel(None);
                let entry = Arc::new(InflightBuild {
                    rx,
                    waiters: std::sync::Mutex::new(0),
                    cancel: CancellationToken::new(),
                });
                map.insert(fingerprint.clone(), Arc::clone(&entry));
                (entry, Some(tx))
            }
        }
    };

    *entry.waiters.lock().unwrap() += 1;

    if let Some(tx) = leader_tx {
        debug!(drv = %drv_path, fingerprint = %fingerprint, "starting build");
        tokio::spawn(build_leader(
            Arc::clone(&ctx.daemon),
            fingerprint.clone(),
            drv_path.clone(),
            Arc::clone(drv),
            resolved,
            ctx.build_id,
            ctx.options.keep_failed,
            Arc::clone(&entry),
            tx,
        ));
    } else {
        debug!(drv = %drv_path, fingerprint = %fingerprint, "joining in-flight build");
    }

    let mut rx = entry.rx.clone();
    let outcome = loop {
        if let Some(outcome) = rx.borrow().clone() {
            break outcome;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                // Leave; tear the build down only if we were the last
                // waiter.
                let remaining = {
                    let mut waiters = entry.waiters.lock().unwrap();
                    *waiters -= 1;
                    *waiters
                };
                if remaining == 0 {
                    warn!(drv = %drv_path, "last waiter gone, cancelling build");
                    entry.cancel.cancel();
                }
                return Err(RealizeError::Cancelled);
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(RealizeError::Internal("build task vanished".into()));
                }
            }
        }
    };

    *entry.waiters.lock().unwrap() -= 1;
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn build_leader(
    daemon: Arc<Daemon>,
    fingerprint: Fingerprint,
    drv_path: StorePath,
    drv: Arc<Derivation>,
    resolved: BTreeMap<(StorePath, String), StorePath>,
    build_id: i64,
    keep_failed: bool,
    entry: Arc<InflightBuild>,
    tx: watch::Sender<Option<SharedOutcome>>,
) {
    let outcome: SharedOutcome = async {
        // FIFO queue behind the worker pool; abandon the slot wait if
        // nobody cares anymore.
        let _permit = tokio::select! {
            permit = daemon.workers.clone().acquire_owned() => {
                permit.map_err(|_| RealizeError::Internal("worker pool closed".into()))?
            }
            _ = entry.cancel.cancelled() => return Err(RealizeError::Cancelled),
        };

        build::build_derivation(
            &daemon,
            build_id,
            &drv_path,
            &drv,
            &fingerprint,
            &resolved,
            keep_failed,
            entry.cancel.clone(),
        )
        .await
        .map(Arc::new)
    }
    .await;

    if let Err(e) = &outcome {
        warn!(drv = %drv_path, error = ?e, "build did not succeed");
    }

    // Publish before unregistering, so late joiners either see the
    // entry with its outcome or a fresh skip-check that hits the
    // registered outputs.
    let _ = tx.send(Some(outcome));
    daemon.inflight.0.lock().unwrap().remove(&fingerprint);
}

/// Record per-output rows for this job's build record.
async fn record_results(
    ctx: &Arc<JobCtx>,
    drv_path: &StorePath,
    drv: &Derivation,
    outputs: Option<&Arc<OutputsMap>>,
    status: BuildStatus,
) {
    let drv_abs = ctx.daemon.store_dir.display_path(drv_path);
    let records: Vec<BuildResultRecord> = drv
        .outputs
        .keys()
        .map(|name| BuildResultRecord {
            drv_path: drv_abs.clone(),
            output_name: name.clone(),
            output_path: outputs
                .and_then(|o| o.get(name))
                .map(|p| ctx.daemon.store_dir.display_path(p)),
            status,
        })
        .collect();

    let build_id = ctx.build_id;
    if let Err(e) = ctx
        .daemon
        .with_db(move |db| {
            for record in &records {
                db.upsert_build_result(build_id, record)?;
            }
            Ok(())
        })
        .await
    {
        error!(build_id, error = %e, "failed to record build results");
    }
}
