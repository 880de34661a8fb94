// SPDX-License-Identifier: MIT

//! End-to-end scheduler scenarios: real `/bin/sh` builders against a
//! throwaway store, driven through the same entry points the RPC layer
//! uses.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use zb_daemon::config::Config;
use zb_daemon::scheduler::{self, JobOptions};
use zb_daemon::store::Daemon;
use zb_protocol::methods::ReusePolicy;
use zb_store_core::content_address::{ContentAddress, ContentAddressMethod};
use zb_store_core::derivation::{Derivation, OutputSpec};
use zb_store_core::hash::{Hash, HashAlgorithm};
use zb_store_core::placeholder::Placeholder;
use zb_store_core::store_path::StorePath;
use zb_store_db::BuildStatus;

fn test_daemon() -> (Arc<Daemon>, tempfile::TempDir) {
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

fn options() -> JobOptions {
    JobOptions {
        keep_failed: false,
        reuse: ReusePolicy::default(),
    }
}

/// Write a derivation file into the store and return its absolute path.
fn install_drv(daemon: &Daemon, drv: &Derivation) -> (StorePath, String) {
    let path = drv.store_path(&daemon.store_dir).unwrap();
    std::fs::write(daemon.store_dir.join(&path), drv.to_aterm(&daemon.store_dir)).unwrap();
    let abs = daemon.store_dir.display_path(&path);
    (path, abs)
}

fn shell_drv(name: &str, script: &str) -> Derivation {
    let mut drv = Derivation {
        name: name.into(),
        system: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        env: BTreeMap::new(),
        input_sources: BTreeSet::new(),
        input_derivations: BTreeMap::new(),
        outputs: BTreeMap::from([(
            "out".into(),
            OutputSpec::FloatingCA {
                method: ContentAddressMethod::Recursive,
                algorithm: HashAlgorithm::Sha256,
            },
        )]),
    };
    drv.env
        .insert("out".into(), Placeholder::own_output("out").to_string());
    drv
}

/// Like [shell_drv] but with a pre-computed (input-addressed) output.
fn input_addressed_drv(daemon: &Daemon, name: &str, script: &str) -> Derivation {
    let digest = zb_store_core::store_path::compress_hash::<20>(
        &zb_store_core::hash::sha256(format!("test-output:{name}")),
    );
    let out = StorePath::new(digest, name).unwrap();
    let mut drv = shell_drv(name, script);
    drv.outputs = BTreeMap::from([("out".into(), OutputSpec::InputAddressed(out.clone()))]);
    drv.env
        .insert("out".into(), daemon.store_dir.display_path(&out));
    drv
}

async fn wait_for_build(daemon: &Arc<Daemon>, build_id: i64) -> zb_store_db::BuildRecord {
    for _ in 0..600 {
        let record = daemon
            .with_db(move |db| db.get_build(build_id))
            .await
            .unwrap()
            .expect("build record exists");
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("build {build_id} did not finish in time");
}

/// Scenario: hello world. An input-addressed one-output derivation
/// realises, the output file holds the echoed bytes, and the reference
/// set is empty.
#[tokio::test]
async fn hello_world() {
    let (daemon, _tmp) = test_daemon();
    let drv = input_addressed_drv(&daemon, "hello", "echo building; echo hi > $out");
    let (_, drv_abs) = install_drv(&daemon, &drv);

    let build_id = scheduler::start_realize(Arc::clone(&daemon), vec![drv_abs.clone()], options())
        .await
        .unwrap();
    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Success);
    assert_eq!(record.drv_paths, vec![drv_abs.clone()]);

    let result = &record.results[0];
    assert_eq!(result.status, BuildStatus::Success);
    let out_abs = result.output_path.clone().unwrap();

    let exists = {
        let check = out_abs.clone();
        daemon
            .with_db(move |db| db.object_exists(&check))
            .await
            .unwrap()
    };
    assert!(exists);
    assert_eq!(std::fs::read(&out_abs).unwrap(), b"hi\n");

    let info = {
        let check = out_abs.clone();
        daemon
            .with_db(move |db| db.query_object(&check))
            .await
            .unwrap()
            .unwrap()
    };
    assert!(info.references.is_empty());
    assert_eq!(info.deriver.as_deref(), Some(drv_abs.as_str()));

    // The builder's stdout landed in the log table.
    let (log, _) = daemon
        .with_db(move |db| db.read_log(build_id, 0))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&log).contains("building"));
}

/// Scenario: self-reference. A floating output that writes its own
/// path ends up containing its final path, and that path appears in
/// its own reference set.
#[tokio::test]
async fn self_reference() {
    let (daemon, _tmp) = test_daemon();
    let drv = shell_drv(
        "selfref",
        "mkdir -p $out; printf '%s' \"$out\" > $out/self",
    );
    let (_, drv_abs) = install_drv(&daemon, &drv);

    let build_id = scheduler::start_realize(Arc::clone(&daemon), vec![drv_abs], options())
        .await
        .unwrap();
    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Success, "{record:?}");

    let out_abs = record.results[0].output_path.clone().unwrap();

    // The temporary path was rewritten to the final one.
    let embedded = std::fs::read_to_string(format!("{out_abs}/self")).unwrap();
    assert_eq!(embedded, out_abs);

    // Self edge recorded.
    let info = {
        let check = out_abs.clone();
        daemon
            .with_db(move |db| db.query_object(&check))
            .await
            .unwrap()
            .unwrap()
    };
    assert!(info.references.contains(&out_abs));
    assert!(info.ca.unwrap().starts_with("fixed:r:sha256:"));
}

/// Scenario: dedup concurrent. Two overlapping realisations of the
/// same derivation spawn the builder exactly once and agree on the
/// outcome.
#[tokio::test]
async fn concurrent_realize_builds_once() {
    let (daemon, tmp) = test_daemon();
    let marker = tmp.path().join("invocations");
    let drv = shell_drv(
        "shared",
        &format!(
            "echo run >> {}; sleep 0.4; mkdir -p $out; echo done > $out/result",
            marker.display()
        ),
    );
    let (_, drv_abs) = install_drv(&daemon, &drv);

    let first = scheduler::start_realize(Arc::clone(&daemon), vec![drv_abs.clone()], options())
        .await
        .unwrap();
    let second = scheduler::start_realize(Arc::clone(&daemon), vec![drv_abs], options())
        .await
        .unwrap();
    assert_ne!(first, second);

    let record1 = wait_for_build(&daemon, first).await;
    let record2 = wait_for_build(&daemon, second).await;
    assert_eq!(record1.status, BuildStatus::Success);
    assert_eq!(record2.status, BuildStatus::Success);
    assert_eq!(
        record1.results[0].output_path, record2.results[0].output_path,
        "both callers observe the same output"
    );

    let invocations = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(invocations.lines().count(), 1, "builder ran exactly once");
}

/// Scenario: fixed-output check. A matching hash succeeds with the
/// content-addressed path; a mismatch fails the build.
#[tokio::test]
async fn fixed_output_verification() {
    let (daemon, _tmp) = test_daemon();
    let expected = Hash::digest(HashAlgorithm::Sha256, "hello\n");
    let ca = ContentAddress::Flat(expected);

    let mut good = shell_drv("fetched", "printf 'hello\\n' > $out");
    good.outputs = BTreeMap::from([("out".into(), OutputSpec::FixedCA(ca.clone()))]);
    good.env.insert(
        "out".into(),
        daemon
            .store_dir
            .display_path(&good.output_store_path(&daemon.store_dir, "out").unwrap().unwrap()),
    );
    let (_, good_abs) = install_drv(&daemon, &good);

    let build_id = scheduler::start_realize(Arc::clone(&daemon), vec![good_abs], options())
        .await
        .unwrap();
    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Success, "{record:?}");

    // Same declared hash, lying builder.
    let mut bad = shell_drv("fetched-lying", "printf 'evil\\n' > $out");
    bad.outputs = BTreeMap::from([("out".into(), OutputSpec::FixedCA(ca))]);
    bad.env.insert(
        "out".into(),
        daemon
            .store_dir
            .display_path(&bad.output_store_path(&daemon.store_dir, "out").unwrap().unwrap()),
    );
    let (_, bad_abs) = install_drv(&daemon, &bad);

    let build_id = scheduler::start_realize(Arc::clone(&daemon), vec![bad_abs], options())
        .await
        .unwrap();
    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Fail);
}

/// A failing dependency fails the dependent without running it.
#[tokio::test]
async fn dependency_failure_propagates() {
    let (daemon, tmp) = test_daemon();
    let witness = tmp.path().join("top-ran");

    let dep = shell_drv("dep", "exit 1");
    let (dep_path, _) = install_drv(&daemon, &dep);

    let mut top = shell_drv(
        "top",
        &format!("touch {}; mkdir $out", witness.display()),
    );
    top.input_derivations
        .insert(dep_path.clone(), BTreeSet::from(["out".into()]));
    let (_, top_abs) = install_drv(&daemon, &top);

    let build_id = scheduler::start_realize(Arc::clone(&daemon), vec![top_abs], options())
        .await
        .unwrap();
    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Fail);
    assert!(!witness.exists(), "dependent builder must not run");
}

/// A dependency's resolved output path is substituted for its
/// placeholder in the dependent.
#[tokio::test]
async fn upstream_placeholder_resolution() {
    let (daemon, _tmp) = test_daemon();

    let dep = shell_drv("dep", "mkdir -p $out; echo payload > $out/data");
    let (dep_path, _) = install_drv(&daemon, &dep);

    let mut top = shell_drv("top", "mkdir -p $out; cp $dep/data $out/copied");
    top.input_derivations
        .insert(dep_path.clone(), BTreeSet::from(["out".into()]));
    top.env.insert(
        "dep".into(),
        Placeholder::upstream_output(&dep_path, "out").to_string(),
    );
    let (_, top_abs) = install_drv(&daemon, &top);

    let build_id = scheduler::start_realize(Arc::clone(&daemon), vec![top_abs], options())
        .await
        .unwrap();
    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Success, "{record:?}");

    let top_out = record
        .results
        .iter()
        .find(|r| r.drv_path.contains("-top.drv"))
        .unwrap()
        .output_path
        .clone()
        .unwrap();
    assert_eq!(
        std::fs::read(format!("{top_out}/copied")).unwrap(),
        b"payload\n"
    );

    // The dependency is discovered as a reference of the dependent?
    // No: the *contents* of top don't mention dep's path, so the edge
    // is content-determined and absent here.
    let info = {
        let check = top_out.clone();
        daemon
            .with_db(move |db| db.query_object(&check))
            .await
            .unwrap()
            .unwrap()
    };
    assert!(info.references.is_empty());
}

/// A second realisation of an already-built floating derivation hits
/// the realisation cache and skips the builder.
#[tokio::test]
async fn realisation_cache_hit() {
    let (daemon, tmp) = test_daemon();
    let marker = tmp.path().join("invocations");
    let drv = shell_drv(
        "cached",
        &format!("echo run >> {}; mkdir -p $out; echo v1 > $out/f", marker.display()),
    );
    let (_, drv_abs) = install_drv(&daemon, &drv);

    let first = scheduler::start_realize(Arc::clone(&daemon), vec![drv_abs.clone()], options())
        .await
        .unwrap();
    assert_eq!(wait_for_build(&daemon, first).await.status, BuildStatus::Success);

    let second = scheduler::start_realize(Arc::clone(&daemon), vec![drv_abs], options())
        .await
        .unwrap();
    assert_eq!(wait_for_build(&daemon, second).await.status, BuildStatus::Success);

    let invocations = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(invocations.lines().count(), 1, "second run reused the realisation");
}

/// Scenario: cancellation. Cancelling the only waiter tears the build
/// down; with a second waiter the build survives to completion.
#[tokio::test]
async fn cancellation_respects_remaining_waiters() {
    let (daemon, tmp) = test_daemon();

    // Lone waiter: cancelled build ends in `error`.
    let lone = shell_drv("lone", "sleep 30; mkdir $out");
    let (_, lone_abs) = install_drv(&daemon, &lone);
    let lone_id = scheduler::start_realize(Arc::clone(&daemon), vec![lone_abs], options())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(daemon.cancel_job(lone_id));
    let record = wait_for_build(&daemon, lone_id).await;
    assert_eq!(record.status, BuildStatus::Error);

    // Two waiters: cancelling one leaves the build running for the
    // other, which still succeeds.
    let marker = tmp.path().join("shared-invocations");
    let shared = shell_drv(
        "shared-cancel",
        &format!(
            "echo run >> {}; sleep 0.6; mkdir -p $out; echo ok > $out/f",
            marker.display()
        ),
    );
    let (_, shared_abs) = install_drv(&daemon, &shared);

    let first = scheduler::start_realize(Arc::clone(&daemon), vec![shared_abs.clone()], options())
        .await
        .unwrap();
    let second = scheduler::start_realize(Arc::clone(&daemon), vec![shared_abs], options())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(daemon.cancel_job(first));

    let cancelled = wait_for_build(&daemon, first).await;
    assert_eq!(cancelled.status, BuildStatus::Error);

    let survivor = wait_for_build(&daemon, second).await;
    assert_eq!(survivor.status, BuildStatus::Success, "{survivor:?}");
    assert_eq!(
        std::fs::read_to_string(&marker).unwrap().lines().count(),
        1,
        "the shared build ran once and was not torn down"
    );
}

/// `zb.expand` realises the inputs and reports the root's expanded
/// invocation without running its builder.
#[tokio::test]
async fn expand_resolves_without_building_root() {
    let (daemon, tmp) = test_daemon();
    let witness = tmp.path().join("root-ran");

    let dep = shell_drv("dep", "mkdir -p $out; echo tool > $out/tool");
    let (dep_path, _) = install_drv(&daemon, &dep);

    let mut root = shell_drv("root", "should-never-run");
    root.builder = Placeholder::upstream_output(&dep_path, "out").to_string() + "/tool";
    root.args = vec![format!("--touch={}", witness.display())];
    root.input_derivations
        .insert(dep_path.clone(), BTreeSet::from(["out".into()]));
    let (_, root_abs) = install_drv(&daemon, &root);

    let temp_dir = tmp.path().join("expand-scratch");
    let build_id = scheduler::start_expand(
        Arc::clone(&daemon),
        root_abs,
        temp_dir.to_string_lossy().into_owned(),
        ReusePolicy::default(),
    )
    .await
    .unwrap();

    let record = wait_for_build(&daemon, build_id).await;
    assert_eq!(record.status, BuildStatus::Success, "{record:?}");
    assert!(!witness.exists(), "root builder must not run");

    let expand = record.expand_result.expect("expand result recorded");
    let result: zb_protocol::methods::ExpandResult =
        serde_json::from_value(expand).unwrap();
    // The dep placeholder resolved to a real store path...
    assert!(result.builder.starts_with(&daemon.store_dir.to_string()));
    assert!(result.builder.ends_with("/tool"));
    // ...and the dep output actually exists.
    let dep_out: String = result
        .builder
        .strip_suffix("/tool")
        .unwrap()
        .to_string();
    assert!(std::path::Path::new(&dep_out).exists());
    // The root's own output resolved into the caller's temp dir.
    assert!(
        result.env.get("out").unwrap().starts_with(&*temp_dir.to_string_lossy()),
        "{:?}",
        result.env
    );
}
