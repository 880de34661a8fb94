// SPDX-License-Identifier: MIT

//! JSON-RPC method dispatch.
//!
//! Everything except `zb.export` / `zb.import` is handled here; those
//! two need the raw connection for their binary bodies and live in
//! [crate::server].
//!
//! Error taxonomy (per kind): malformed requests get JSON-RPC errors
//! and the connection survives; "not found" is a typed success
//! (`info: null`, build status `unknown`), never a JSON-RPC error.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use zb_protocol::jsonrpc::{Request, Response, ResponseError};
use zb_protocol::methods;
use zb_store_db::BuildStatus as DbStatus;

use crate::error::DaemonError;
use crate::scheduler::{self, JobOptions};
use crate::store::Daemon;

/// Handle one JSON-RPC request. Returns `None` for notifications.
/// `started_builds` collects jobs begun on this connection, so the
/// server can cancel them when the client goes away.
pub async fn dispatch(
    daemon: &Arc<Daemon>,
    request: Request,
    started_builds: &mut Vec<i64>,
) -> Option<Response> {
    let id = request.id.clone();
    let result = handle(daemon, &request, started_builds).await;

    let id = id?;
    Some(match result {
        Ok(value) => Response::success(id, value),
        Err(error) => Response::failure(id, error),
    })
}

fn params<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, ResponseError> {
    let raw = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(ResponseError::invalid_params)
}

/// Usage problems (bad paths, unknown methods) are JSON-RPC errors;
/// everything else that goes wrong inside the daemon is `internal`.
fn daemon_error(e: DaemonError) -> ResponseError {
    match e {
        DaemonError::Config(msg) => ResponseError::invalid_params(msg),
        DaemonError::StorePath(e) => ResponseError::invalid_params(e),
        other => ResponseError::internal(other),
    }
}

async fn handle(
    daemon: &Arc<Daemon>,
    request: &Request,
    started_builds: &mut Vec<i64>,
) -> Result<Value, ResponseError> {
    request.check()?;
    debug!(method = %request.method, "dispatching request");

    match request.method.as_str() {
        methods::NOP => Ok(Value::Null),

        methods::EXISTS => {
            let p: methods::ExistsParams = params(request)?;
            // Syntactically invalid paths are usage errors; valid but
            // absent ones are simply `false`.
            daemon
                .parse_store_path(&p.path)
                .map_err(daemon_error)?;
            let exists = daemon
                .with_db(move |db| db.object_exists(&p.path))
                .await
                .map_err(daemon_error)?;
            Ok(json!(exists))
        }

        methods::INFO => {
            let p: methods::InfoParams = params(request)?;
            daemon
                .parse_store_path(&p.path)
                .map_err(daemon_error)?;
            let info = daemon
                .with_db(move |db| db.query_object(&p.path))
                .await
                .map_err(daemon_error)?;
            let info = info.map(|i| methods::ObjectInfo {
                nar_hash: i.nar_hash,
                nar_size: i.nar_size,
                references: i.references.into_iter().collect(),
                ca: i.ca,
            });
            Ok(serde_json::to_value(methods::InfoResult { info })
                .map_err(ResponseError::internal)?)
        }

        methods::REALIZE => {
            let p: methods::RealizeParams = params(request)?;
            if p.drv_paths.is_empty() {
                return Err(ResponseError::invalid_params("drvPaths is empty"));
            }
            let build_id = scheduler::start_realize(
                Arc::clone(daemon),
                p.drv_paths,
                JobOptions {
                    keep_failed: p.keep_failed,
                    reuse: p.reuse,
                },
            )
            .await
            .map_err(daemon_error)?;
            started_builds.push(build_id);
            Ok(serde_json::to_value(methods::StartedBuild { build_id })
                .map_err(ResponseError::internal)?)
        }

        methods::EXPAND => {
            let p: methods::ExpandParams = params(request)?;
            let build_id =
                scheduler::start_expand(Arc::clone(daemon), p.drv_path, p.temp_dir, p.reuse)
                    .await
                    .map_err(daemon_error)?;
            started_builds.push(build_id);
            Ok(serde_json::to_value(methods::StartedBuild { build_id })
                .map_err(ResponseError::internal)?)
        }

        methods::GET_BUILD => {
            let p: methods::GetBuildParams = params(request)?;
            let record = daemon
                .with_db(move |db| db.get_build(p.build_id))
                .await
                .map_err(daemon_error)?;
            let build = match record {
                None => methods::Build::unknown(p.build_id),
                Some(record) => build_to_wire(record),
            };
            Ok(serde_json::to_value(build).map_err(ResponseError::internal)?)
        }

        methods::CANCEL_BUILD => {
            let p: methods::CancelBuildParams = params(request)?;
            let known = daemon.cancel_job(p.build_id);
            debug!(build_id = p.build_id, known, "cancellation requested");
            Ok(Value::Null)
        }

        methods::READ_LOG => {
            let p: methods::ReadLogParams = params(request)?;
            let (bytes, next_offset) = daemon
                .with_db(move |db| db.read_log(p.build_id, p.offset))
                .await
                .map_err(daemon_error)?;
            Ok(
                serde_json::to_value(methods::ReadLogResult::encode(&bytes, next_offset))
                    .map_err(ResponseError::internal)?,
            )
        }

        other => Err(ResponseError::method_not_found(other)),
    }
}

fn status_to_wire(status: DbStatus) -> methods::BuildStatus {
    match status {
        DbStatus::Unknown => methods::BuildStatus::Unknown,
        DbStatus::Active => methods::BuildStatus::Active,
        DbStatus::Success => methods::BuildStatus::Success,
        DbStatus::Fail => methods::BuildStatus::Fail,
        DbStatus::Error => methods::BuildStatus::Error,
    }
}

fn build_to_wire(record: zb_store_db::BuildRecord) -> methods::Build {
    methods::Build {
        build_id: record.id,
        status: status_to_wire(record.status),
        started_at: Some(record.started_at),
        ended_at: record.ended_at,
        results: record
            .results
            .into_iter()
            .map(|r| methods::BuildResult {
                drv_path: r.drv_path,
                output_name: r.output_name,
                output_path: r.output_path,
                status: status_to_wire(r.status),
            })
            .collect(),
        expand_result: record
            .expand_result
            .and_then(|v| serde_json::from_value(v).ok()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use zb_protocol::jsonrpc::{Request, code};
    use zb_protocol::methods;

    use crate::config::Config;
    use crate::store::Daemon;

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

    #[tokio::test]
    async fn nop_and_unknown_method() {
        let (daemon, _tmp) = test_daemon();
        let mut started = Vec::new();

        let response = super::dispatch(
            &daemon,
            Request::new(1, methods::NOP, None),
            &mut started,
        )
        .await
        .unwrap();
        assert_eq!(response.result, Some(json!(null)));

        let response = super::dispatch(
            &daemon,
            Request::new(2, "zb.bogus", None),
            &mut started,
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn exists_and_info_not_found_are_typed() {
        let (daemon, _tmp) = test_daemon();
        let mut started = Vec::new();

        let path = format!(
            "{}/00000000000000000000000000000000-absent",
            daemon.store_dir
        );
        let response = super::dispatch(
            &daemon,
            Request::new(1, methods::EXISTS, Some(json!({ "path": path }))),
            &mut started,
        )
        .await
        .unwrap();
        assert_eq!(response.result, Some(json!(false)));

        let response = super::dispatch(
            &daemon,
            Request::new(2, methods::INFO, Some(json!({ "path": path }))),
            &mut started,
        )
        .await
        .unwrap();
        assert_eq!(response.result, Some(json!({ "info": null })));

        // A path outside the store is a usage error, not "not found".
        let response = super::dispatch(
            &daemon,
            Request::new(3, methods::EXISTS, Some(json!({ "path": "/etc/passwd" }))),
            &mut started,
        )
        .await
        .unwrap();
        assert_eq!(response.error.unwrap().code, code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_build_is_typed() {
        let (daemon, _tmp) = test_daemon();
        let mut started = Vec::new();

        let response = super::dispatch(
            &daemon,
            Request::new(1, methods::GET_BUILD, Some(json!({ "buildID": 999 }))),
            &mut started,
        )
        .await
        .unwrap();
        let build: methods::Build = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(build.status, methods::BuildStatus::Unknown);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (daemon, _tmp) = test_daemon();
        let mut started = Vec::new();

        let request: Request = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": methods::CANCEL_BUILD,
            "params": { "buildID": 1 },
        }))
        .unwrap();
        assert!(super::dispatch(&daemon, request, &mut started).await.is_none());
    }
}
