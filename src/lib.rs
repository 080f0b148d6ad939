//! antload -- distributed load-test orchestration.
//!
//! Installs agents on remote hosts over SSH, tracks load-test definitions and
//! their lifecycle in SQLite, drives the external load tool as a child
//! process, and serves aggregated results over an HTTP API.

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod load;
pub mod logging;
pub mod orchestrator;
pub mod remote;
pub mod storage;

use std::net::SocketAddr;

use anyhow::{Context, Result};

use crate::api::state::AppState;
use crate::config::AppConfig;
use crate::context::AppContext;

/// Run the HTTP API until ctrl-c or SIGTERM, then stop every running load
/// test.
pub async fn serve(config: AppConfig) -> Result<()> {
    let bind = config.server.bind.clone();
    let ctx = AppContext::init(config)?;

    ctx.orchestrator.recover().await?;

    let app = api::router(
        AppState {
            orchestrator: ctx.orchestrator.clone(),
        },
        &ctx.config.server,
    );

    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, base_path = %ctx.config.server.base_path, "antload listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutting down; stopping running load tests");
    ctx.orchestrator.stop_all().await;
    Ok(())
}

/// Resolves on ctrl-c, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
