//! Toolgate Daemon binary: config from env, signal handling, the axum
//! server on its fixed port.

use std::env;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use toolgate_core::{ProxyConfig, ToolRegistry, Verbosity};
use toolgate_daemon::proxy::{router, AppState};

const LISTEN_PORT: u16 = 12345;

fn config_from_env() -> ProxyConfig {
    let mut config = ProxyConfig {
        verbosity: Verbosity::Debug,
        ..ProxyConfig::default()
    };
    if let Ok(host) = env::var("TOOLGATE_UPSTREAM_HOST") {
        config.upstream_host = host;
    }
    if let Ok(port) = env::var("TOOLGATE_UPSTREAM_PORT") {
        match port.parse() {
            Ok(port) => config.upstream_port = port,
            Err(_) => eprintln!("Ignoring unparseable TOOLGATE_UPSTREAM_PORT={port}"),
        }
    }
    if let Ok(level) = env::var("TOOLGATE_VERBOSITY") {
        match Verbosity::parse(&level) {
            Some(verbosity) => config.verbosity = verbosity,
            None => eprintln!("Ignoring unknown TOOLGATE_VERBOSITY={level}"),
        }
    }
    config
}

#[tokio::main]
async fn main() {
    let config = config_from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.verbosity.level_filter().into()),
        )
        .init();

    if let Err(err) = config.validate() {
        error!("refusing to start: {err}");
        std::process::exit(255);
    }

    let upstream_url = config.upstream_url();
    let shutdown = CancellationToken::new();
    let state = AppState::new(config, Arc::new(ToolRegistry::builtin()), shutdown.clone());
    let app = router(state);

    let addr = format!("0.0.0.0:{LISTEN_PORT}");
    info!("toolgate proxy listening on {addr}, upstream {upstream_url}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot listen on {addr}: {err}");
            std::process::exit(255);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_signal(shutdown));
    if let Err(err) = server.await {
        error!("server crashed: {err}");
        std::process::exit(255);
    }
    info!("toolgate proxy stopped");
}

/// Resolves on SIGINT or SIGTERM and cancels every in-flight request.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("cannot install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("received shutdown signal, draining requests");
    shutdown.cancel();
}
