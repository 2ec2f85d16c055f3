// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin HTTP server.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::Result;
use crate::handlers;
use crate::orchestrator::Orchestrator;

/// Build the admin router.
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/admin/update/start", post(handlers::start_update))
        .route("/admin/update/status", get(handlers::update_status))
        .route("/admin/update/stream", get(handlers::update_stream))
        .route("/admin/update/cancel", post(handlers::cancel_update))
        .route("/admin/version", get(handlers::version_report))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Serve the admin API until the shutdown signal resolves.
pub async fn serve(
    addr: SocketAddr,
    orchestrator: Orchestrator,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(orchestrator);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Admin API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
