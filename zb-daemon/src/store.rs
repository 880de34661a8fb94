// SPDX-License-Identifier: MIT

//! The daemon context and whole-store operations.
//!
//! [Daemon] is the single owner of the store directory, the catalogue
//! database, the worker pool, and the tables of running jobs and
//! in-flight builds. It is passed explicitly everywhere; the process
//! has no global state.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zb_nar::export::{ExportError, ExportReader, ExportTrailer, ExportWriter};
use zb_store_core::store_dir::StoreDirectory;
use zb_store_core::store_path::StorePath;
use zb_store_db::{OpenMode, RegisterObject, StoreDb};

use crate::config::Config;
use crate::error::{DaemonError, IoContext as _};
use crate::pathlocks::PathLock;
use crate::scheduler::InflightMap;

/// Handle to a running scheduler job, for cancellation.
#[derive(Clone)]
pub struct JobHandle {
    pub cancel: CancellationToken,
}

pub struct Daemon {
    pub config: Config,
    pub store_dir: StoreDirectory,
    pub db: Arc<Mutex<StoreDb>>,
    /// Bounds the number of concurrently running builders.
    pub workers: Arc<Semaphore>,
    /// At most one running build per fingerprint.
    pub(crate) inflight: InflightMap,
    /// Running jobs by build id.
    pub(crate) jobs: std::sync::Mutex<HashMap<i64, JobHandle>>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Arc<Self>, DaemonError> {
        config.validate()?;

        std::fs::create_dir_all(&config.store_dir)
            .io_context(|| format!("creating store directory {}", config.store_dir.display()))?;
        std::fs::create_dir_all(&config.build_dir)
            .io_context(|| format!("creating build directory {}", config.build_dir.display()))?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("creating state directory {}", parent.display()))?;
        }

        let store_dir = StoreDirectory::new(&config.store_dir)?;
        let db = StoreDb::open(&config.db_path, OpenMode::Create)?;
        let workers = Arc::new(Semaphore::new(config.effective_max_jobs()));

        info!(
            store = %store_dir,
            db = %config.db_path.display(),
            max_jobs = config.effective_max_jobs(),
            "store server initialized"
        );

        Ok(Arc::new(Daemon {
            config,
            store_dir,
            db: Arc::new(Mutex::new(db)),
            workers,
            inflight: InflightMap::default(),
            jobs: std::sync::Mutex::new(HashMap::new()),
        }))
    }

    /// Run a database operation on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T, DaemonError>
    where
        F: FnOnce(&mut StoreDb) -> zb_store_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db.blocking_lock();
            f(&mut db)
        })
        .await
        .map_err(|e| DaemonError::io("database task", std::io::Error::other(e)))?
        .map_err(DaemonError::from)
    }

    pub fn register_job(&self, build_id: i64, handle: JobHandle) {
        self.jobs.lock().unwrap().insert(build_id, handle);
    }

    pub fn finish_job(&self, build_id: i64) {
        self.jobs.lock().unwrap().remove(&build_id);
    }

    /// Request cancellation of a job. Advisory: shared builds keep
    /// running while other jobs wait on them.
    pub fn cancel_job(&self, build_id: i64) -> bool {
        match self.jobs.lock().unwrap().get(&build_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The reference closure of `roots`, dependencies first. Paths the
    /// database does not know are returned as-is (their references are
    /// unknown), so callers can surface a useful error.
    pub async fn reference_closure(
        &self,
        roots: Vec<String>,
    ) -> Result<Vec<String>, DaemonError> {
        self.with_db(move |db| {
            let mut ordered = Vec::new();
            let mut seen = BTreeSet::new();
            // Iterative post-order: dependencies precede referrers.
            let mut stack: VecDeque<(String, bool)> =
                roots.into_iter().map(|r| (r, false)).collect();
            while let Some((path, expanded)) = stack.pop_back() {
                if expanded {
                    if seen.insert(path.clone()) {
                        ordered.push(path);
                    }
                    continue;
                }
                if seen.contains(&path) {
                    continue;
                }
                stack.push_back((path.clone(), true));
                if let Some(info) = db.query_object(&path)? {
                    for reference in info.references {
                        if reference != path && !seen.contains(&reference) {
                            stack.push_back((reference, false));
                        }
                    }
                }
            }
            Ok(ordered)
        })
        .await
    }

    /// Write an export stream for `paths` (plus their reference
    /// closures unless `exclude_references`) into `sink`. Blocking.
    pub fn export_sync<W: std::io::Write>(
        &self,
        db: &StoreDb,
        paths: &[String],
        exclude_references: bool,
        sink: W,
    ) -> Result<W, DaemonError> {
        // Expand and order: references before referrers.
        let mut ordered = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack: VecDeque<(String, bool)> =
            paths.iter().map(|p| (p.clone(), false)).collect();
        while let Some((path, expanded)) = stack.pop_back() {
            if expanded {
                if seen.insert(path.clone()) {
                    ordered.push(path);
                }
                continue;
            }
            if seen.contains(&path) {
                continue;
            }
            stack.push_back((path.clone(), true));
            if !exclude_references
                && let Some(info) = db.query_object(&path)?
            {
                for reference in info.references {
                    if reference != path && !seen.contains(&reference) {
                        stack.push_back((reference, false));
                    }
                }
            }
        }

        let mut writer = ExportWriter::new(sink);
        for path in &ordered {
            let info = db
                .query_object(path)?
                .ok_or_else(|| DaemonError::io(
                    format!("exporting {path}"),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "path is not in the store"),
                ))?;

            let on_disk = Path::new(path);
            let nar_sink = writer.begin_object().io_context(|| format!("exporting {path}"))?;
            zb_nar::dump_path(on_disk, nar_sink).io_context(|| format!("exporting {path}"))?;
            writer
                .finish_object(&ExportTrailer {
                    store_path: path.clone(),
                    references: info.references,
                    deriver: info.deriver,
                    ca: info.ca.and_then(|text| text.parse().ok()),
                })
                .io_context(|| format!("exporting {path}"))?;
        }
        writer.finish().map_err(|e| DaemonError::io("finishing export stream", e))
    }

    /// Import an export stream, registering each validated object.
    /// Blocking. Returns the paths imported.
    ///
    /// Objects are restored to a temporary name, validated, and only
    /// then renamed into place and registered, so a stream that dies
    /// mid-object leaves no trace in the catalogue.
    pub fn import_sync<R: Read + Send>(
        &self,
        db: &mut StoreDb,
        source: R,
    ) -> Result<Vec<String>, DaemonError> {
        let mut reader = ExportReader::new(self.store_dir.clone(), source);
        let mut imported = Vec::new();
        let mut counter = 0u32;

        loop {
            counter += 1;
            let staging = self
                .store_dir
                .as_path()
                .join(format!(".zb-import-{}-{counter}", std::process::id()));
            let _ = std::fs::remove_dir_all(&staging);
            let _ = std::fs::remove_file(&staging);

            let object = match reader.next_object(|nar| zb_nar::restore(nar, &staging)) {
                Ok(Some(object)) => object,
                Ok(None) => break,
                Err(ExportError::Object { path, reason }) => {
                    // This object is bad but the stream is intact.
                    warn!(path, reason, "rejecting imported store object");
                    let _ = std::fs::remove_dir_all(&staging);
                    let _ = std::fs::remove_file(&staging);
                    continue;
                }
                Err(ExportError::Stream(e)) => {
                    let _ = std::fs::remove_dir_all(&staging);
                    let _ = std::fs::remove_file(&staging);
                    return Err(DaemonError::io("import stream", e));
                }
            };

            let final_path = self.store_dir.join(&object.store_path);
            let abs = self.store_dir.display_path(&object.store_path);

            let lock = PathLock::lock(&final_path)
                .io_context(|| format!("locking {abs}"))?;
            if !final_path.exists() {
                std::fs::rename(&staging, &final_path)
                    .io_context(|| format!("moving {abs} into place"))?;
            } else {
                let _ = std::fs::remove_dir_all(&staging);
                let _ = std::fs::remove_file(&staging);
            }

            let mut references: BTreeSet<String> = object
                .references
                .iter()
                .map(|r| self.store_dir.display_path(r))
                .collect();
            if object.self_reference {
                references.insert(abs.clone());
            }

            db.register_object(&RegisterObject {
                path: abs.clone(),
                nar_hash: format!("sha256:{}", object.nar_hash.to_hex()),
                nar_size: object.nar_size,
                ca: Some(object.ca.to_string()),
                deriver: object.deriver.map(|d| self.store_dir.display_path(&d)),
                references,
            })?;
            lock.cleanup();

            imported.push(abs);
        }

        Ok(imported)
    }

    /// Parse an absolute store path belonging to this store.
    pub fn parse_store_path(&self, s: &str) -> Result<StorePath, DaemonError> {
        Ok(self.store_dir.parse(s)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::config::Config;

    use super::Daemon;

    fn test_daemon() -> (std::sync::Arc<Daemon>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            store_dir: tmp.path().join("store"),
            db_path: tmp.path().join("var/db.sqlite"),
            build_dir: tmp.path().join("var/builds"),
            socket_path: tmp.path().join("var/server.sock"),
            sandbox: false,
            ..Config::default()
        };
        (Daemon::new(config).unwrap(), tmp)
    }

    /// Register a small object graph directly and exercise closure
    /// computation plus the export/import round-trip.
    #[tokio::test]
    async fn export_import_roundtrip() {
        let (daemon, _tmp) = test_daemon();

        // A "dep" tree and a "top" file referencing it, placed and
        // registered by hand the way the builder path would.
        let dep_dir = tempfile::tempdir().unwrap();
        let dep_file = dep_dir.path().join("f");
        std::fs::write(&dep_file, "dep contents").unwrap();

        let mut nar = Vec::new();
        zb_nar::dump_path(&dep_file, &mut nar).unwrap();
        let nar_hash = zb_store_core::hash::Hash::digest(
            zb_store_core::hash::HashAlgorithm::Sha256,
            &nar,
        );
        let ca = zb_store_core::content_address::ContentAddress::Recursive(nar_hash.clone());
        let dep_path = zb_store_core::store_path::ca_path(
            &daemon.store_dir,
            "dep",
            &ca,
            &zb_store_core::store_path::StoreReferences::default(),
        )
        .unwrap();
        let dep_abs = daemon.store_dir.display_path(&dep_path);
        std::fs::copy(&dep_file, daemon.store_dir.join(&dep_path)).unwrap();

        {
            let mut db = daemon.db.lock().await;
            db.register_object(&zb_store_db::RegisterObject {
                path: dep_abs.clone(),
                nar_hash: format!("sha256:{}", nar_hash.to_hex()),
                nar_size: nar.len() as u64,
                ca: Some(ca.to_string()),
                deriver: None,
                references: BTreeSet::new(),
            })
            .unwrap();
        }

        let closure = daemon
            .reference_closure(vec![dep_abs.clone()])
            .await
            .unwrap();
        assert_eq!(closure, vec![dep_abs.clone()]);

        // Export from the first store.
        let buf = {
            let db = daemon.db.lock().await;
            daemon
                .export_sync(&db, &[dep_abs.clone()], false, Vec::new())
                .unwrap()
        };

        // A second daemon over the same store directory but a fresh
        // catalogue, with the object deleted from disk: importing must
        // restore both.
        let other = {
            let mut config = daemon.config.clone();
            config.db_path = _tmp.path().join("var2/db.sqlite");
            config.build_dir = _tmp.path().join("var2/builds");
            Daemon::new(config).unwrap()
        };
        std::fs::remove_file(daemon.store_dir.join(&dep_path)).unwrap();

        let imported = {
            let mut db = other.db.lock().await;
            other.import_sync(&mut db, buf.as_slice()).unwrap()
        };
        assert_eq!(imported, vec![dep_abs.clone()]);
        assert!(other.store_dir.join(&dep_path).exists());
        assert_eq!(
            std::fs::read(other.store_dir.join(&dep_path)).unwrap(),
            b"dep contents"
        );

        let info = {
            let db = other.db.lock().await;
            db.query_object(&dep_abs).unwrap().unwrap()
        };
        assert_eq!(info.nar_hash, format!("sha256:{}", nar_hash.to_hex()));
        assert_eq!(info.nar_size, nar.len() as u64);
        assert_eq!(info.ca.as_deref(), Some(ca.to_string().as_str()));
    }
}
