// SPDX-License-Identifier: MIT

//! The Unix socket listener and per-connection loop.
//!
//! Requests on a connection are handled in order, so responses go out
//! in the order requests came in; the long-running operations
//! (`zb.realize`, `zb.expand`) return a build id immediately and are
//! polled, so ordering costs nothing. Binary export payloads are the
//! exception: they are correlated by `Zb-Export-Id` and two exports
//! never interleave because the loop is sequential.
//!
//! Dropping a connection cancels the jobs it started (advisory: builds
//! shared with other jobs keep running).

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

use zb_protocol::frame::{self, Frame, FrameError};
use zb_protocol::jsonrpc::{Request, Response, ResponseError, code};
use zb_protocol::methods;

use crate::error::{DaemonError, IoContext as _};
use crate::service;
use crate::store::Daemon;

/// Check the socket path before binding: a live peer means another
/// server owns the store; a non-socket file is left alone; a stale
/// socket is removed.
pub async fn prepare_socket(path: &Path) -> Result<(), DaemonError> {
    match tokio::fs::symlink_metadata(path).await {
        Err(_) => {}
        Ok(meta) => {
            use std::os::unix::fs::FileTypeExt as _;
            if !meta.file_type().is_socket() {
                return Err(DaemonError::NotASocket(path.to_owned()));
            }
            match UnixStream::connect(path).await {
                Ok(_) => return Err(DaemonError::AlreadyRunning(path.to_owned())),
                Err(_) => {
                    info!(socket = %path.display(), "removing stale socket");
                    tokio::fs::remove_file(path)
                        .await
                        .io_context(|| format!("removing stale socket {}", path.display()))?;
                }
            }
        }
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .io_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    Ok(())
}

/// Accept connections until cancelled.
pub async fn serve(daemon: Arc<Daemon>, listener: UnixListener) -> Result<(), DaemonError> {
    loop {
        let (stream, _addr) = listener
            .accept()
            .await
            .io_context(|| "accepting connection".to_string())?;
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(daemon, stream).await {
                debug!(error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) -> Result<(), DaemonError> {
    // Jobs begun on this connection; cancelled when the client goes
    // away, however the connection ends.
    let mut started_builds: Vec<i64> = Vec::new();
    let result = connection_loop(&daemon, stream, &mut started_builds).await;

    for build_id in started_builds {
        if daemon.cancel_job(build_id) {
            debug!(build_id, "cancelled on disconnect");
        }
    }
    result
}

async fn connection_loop(
    daemon: &Arc<Daemon>,
    stream: UnixStream,
    started_builds: &mut Vec<i64>,
) -> Result<(), DaemonError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = Some(BufReader::new(read_half));
    let mut writer = Some(write_half);
    // Id of a `zb.import` request awaiting its export-stream body.
    let mut pending_import: Option<Value> = None;

    loop {
        let frame = match frame::read_frame(reader.as_mut().expect("reader present")).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(FrameError::Unrecoverable(msg)) => {
                warn!(msg, "tearing down connection");
                break;
            }
            Err(FrameError::Io(e)) => {
                debug!(error = %e, "connection I/O error");
                break;
            }
        };

        match frame {
            Frame::Json(body) => {
                let request: Request = match serde_json::from_slice(&body) {
                    Ok(request) => request,
                    Err(e) => {
                        let response = Response::failure(
                            Value::Null,
                            ResponseError::new(code::PARSE_ERROR, e.to_string()),
                        );
                        write_response(&mut writer, &response).await?;
                        continue;
                    }
                };

                match request.method.as_str() {
                    methods::EXPORT => {
                        handle_export(&daemon, &mut writer, request).await?;
                    }
                    methods::IMPORT => {
                        // The binary body follows as its own frame.
                        pending_import = request.id.clone();
                    }
                    _ => {
                        if let Some(response) =
                            service::dispatch(daemon, request, started_builds).await
                        {
                            write_response(&mut writer, &response).await?;
                        }
                    }
                }
            }

            Frame::Export { export_id, .. } => {
                let reply_id = export_id
                    .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                    .or_else(|| pending_import.take());

                // The export stream is consumed synchronously off the
                // runtime; the buffered reader travels there and back.
                let buffered = reader.take().expect("reader present");
                let daemon2 = Arc::clone(&daemon);
                let joined = tokio::task::spawn_blocking(move || {
                    let mut bridge = SyncIoBridge::new(buffered);
                    let result = {
                        let mut db = daemon2.db.blocking_lock();
                        daemon2.import_sync(&mut db, &mut bridge)
                    };
                    (result, bridge.into_inner())
                })
                .await
                .map_err(|e| DaemonError::io("import task", std::io::Error::other(e)))?;

                let (result, recovered) = joined;
                reader = Some(recovered);

                match result {
                    Ok(imported) => {
                        info!(count = imported.len(), "import finished");
                        if let Some(id) = reply_id {
                            let response = Response::success(id, serde_json::json!({}));
                            write_response(&mut writer, &response).await?;
                        }
                    }
                    Err(e) => {
                        // The stream position is unknown; poison the
                        // connection.
                        warn!(error = %e, "import failed, closing connection");
                        if let Some(id) = reply_id {
                            let response =
                                Response::failure(id, ResponseError::internal(&e));
                            write_response(&mut writer, &response).await?;
                        }
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn write_response(
    writer: &mut Option<OwnedWriteHalf>,
    response: &Response,
) -> Result<(), DaemonError> {
    let body = serde_json::to_vec(response)
        .map_err(|e| DaemonError::io("encoding response", std::io::Error::other(e)))?;
    frame::write_json_frame(writer.as_mut().expect("writer present"), &body)
        .await
        .io_context(|| "writing response".to_string())
}

/// `zb.export`: validate, then answer with a binary frame correlated
/// by the request id.
async fn handle_export(
    daemon: &Arc<Daemon>,
    writer: &mut Option<OwnedWriteHalf>,
    request: Request,
) -> Result<(), DaemonError> {
    let params: methods::ExportParams = match request
        .params
        .clone()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(params)) => params,
        Ok(None) | Err(_) => {
            if let Some(id) = request.id {
                let response =
                    Response::failure(id, ResponseError::invalid_params("expected {paths}"));
                write_response(writer, &response).await?;
            }
            return Ok(());
        }
    };

    // Usage errors are reported as JSON-RPC errors before any binary
    // byte is written.
    for path in &params.paths {
        let ok = daemon.parse_store_path(path).is_ok() && {
            let path = path.clone();
            daemon
                .with_db(move |db| db.object_exists(&path))
                .await
                .unwrap_or(false)
        };
        if !ok {
            if let Some(id) = request.id {
                let response = Response::failure(
                    id,
                    ResponseError::invalid_params(format!("{path} is not in the store")),
                );
                write_response(writer, &response).await?;
            }
            return Ok(());
        }
    }

    let export_id = request.id.as_ref().map(|id| id.to_string());
    frame::write_export_frame_header(
        writer.as_mut().expect("writer present"),
        export_id.as_deref(),
        None,
    )
    .await
    .io_context(|| "writing export header".to_string())?;

    let out = writer.take().expect("writer present");
    let daemon2 = Arc::clone(daemon);
    let joined = tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(out);
        let db = daemon2.db.blocking_lock();
        let result = daemon2.export_sync(
            &db,
            &params.paths,
            params.exclude_references,
            bridge,
        );
        match result {
            Ok(bridge) => (Ok(()), Some(bridge.into_inner())),
            // The sink is gone or mid-stream; connection is poisoned.
            Err(e) => (Err(e), None),
        }
    })
    .await
    .map_err(|e| DaemonError::io("export task", std::io::Error::other(e)))?;

    match joined {
        (Ok(()), Some(recovered)) => {
            *writer = Some(recovered);
            Ok(())
        }
        (Err(e), _) => Err(e),
        (Ok(()), None) => unreachable!("successful export returns its sink"),
    }
}

#[cfg(test)]
mod tests {
    use super::prepare_socket;
    use crate::error::DaemonError;

    #[tokio::test]
    async fn refuses_non_socket_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.sock");
        std::fs::write(&path, "not a socket").unwrap();

        let err = prepare_socket(&path).await.unwrap_err();
        assert!(matches!(err, DaemonError::NotASocket(_)), "{err}");
        assert!(path.exists(), "the file must be left alone");
    }

    #[tokio::test]
    async fn removes_stale_sockets() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.sock");

        // Bind and drop: the socket file remains but nobody accepts.
        drop(tokio::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        prepare_socket(&path).await.unwrap();
        assert!(!path.exists(), "stale socket removed");
    }

    #[tokio::test]
    async fn detects_live_server() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.sock");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();

        let err = prepare_socket(&path).await.unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)), "{err}");
    }
}
