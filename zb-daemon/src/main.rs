// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zb_daemon::config::Config;
use zb_daemon::error::DaemonError;
use zb_daemon::server;
use zb_daemon::store::Daemon;

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 64;

fn usage() -> ExitCode {
    eprintln!("usage: zb-daemon [--config <file>]");
    ExitCode::from(EXIT_USAGE)
}

fn load_config() -> Result<Config, DaemonError> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => return Err(DaemonError::Config("--config needs a value".into())),
            },
            other => {
                return Err(DaemonError::Config(format!("unknown argument {other:?}")));
            }
        }
    }

    let config_path = config_path.or_else(|| std::env::var_os("ZB_DAEMON_CONFIG").map(PathBuf::from));
    match config_path {
        Some(path) => Config::from_file(&path),
        None => Ok(Config::default()),
    }
}

fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("zb-daemon: {e}");
            return usage();
        }
    };

    let filter = EnvFilter::try_from_env("ZB_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(config: Config) -> Result<(), DaemonError> {
    let socket_path = config.socket_path.clone();
    server::prepare_socket(&socket_path).await?;

    let daemon = Daemon::new(config)?;

    let listener = tokio::net::UnixListener::bind(&socket_path)
        .map_err(|e| DaemonError::io(format!("binding {}", socket_path.display()), e))?;
    info!(socket = %socket_path.display(), "listening");

    spawn_maintenance(Arc::clone(&daemon));

    tokio::select! {
        result = server::serve(Arc::clone(&daemon), listener) => {
            if let Err(e) = &result {
                error!("server error: {e}");
            }
            result?;
        }
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).map_err(|e| {
            DaemonError::io(format!("removing socket {}", socket_path.display()), e)
        })?;
    }
    Ok(())
}

/// Periodically reap expired log chunks and terminal build records.
fn spawn_maintenance(daemon: Arc<Daemon>) {
    const DAY_SECS: i64 = 24 * 60 * 60;
    let log_secs = daemon.config.log_retention_days as i64 * DAY_SECS;
    let build_secs = daemon.config.build_retention_days as i64 * DAY_SECS;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match daemon.with_db(move |db| db.reap(log_secs, build_secs)).await {
                Ok((logs, builds)) if logs > 0 || builds > 0 => {
                    info!(logs, builds, "reaped expired rows");
                }
                Ok(_) => {}
                Err(e) => error!("maintenance failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
