// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin API handlers.
//!
//! Five operations: start an update, read session status, stream session
//! events over SSE, cancel, and report versions. Handlers are thin: they
//! translate HTTP to orchestrator calls and map [`Error`] variants onto
//! status codes.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::session::UpdateSession;

/// Request body for starting an update.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Explicit target version; `None` means latest.
    #[serde(default, alias = "version")]
    pub target_version: Option<String>,
    /// Release channel; `None` means the configured default.
    #[serde(default)]
    pub channel: Option<String>,
    /// Re-apply even when the target digests already match.
    #[serde(default)]
    pub force: bool,
}

/// Query selecting a session; defaults to the most recent one.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    /// Session id.
    #[serde(default, alias = "id")]
    pub update_id: Option<Uuid>,
}

/// Request body for cancelling; defaults to the active session.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    /// Session id to cancel.
    #[serde(default, alias = "session_id")]
    pub update_id: Option<Uuid>,
}

/// Query for the version report.
#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    /// Channel to consult; defaults to the configured one.
    #[serde(default)]
    pub channel: Option<String>,
    /// Bypass the manifest cache.
    #[serde(default)]
    pub refresh: bool,
}

/// Error wrapper mapping domain errors onto HTTP responses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            Error::Conflict { active_id } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "update_in_progress",
                    "detail": self.0.to_string(),
                    "active_session": active_id,
                }),
            ),
            Error::TooLate { state } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "too_late",
                    "detail": self.0.to_string(),
                    "state": state,
                }),
            ),
            Error::InvalidTarget(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_target", "detail": self.0.to_string() }),
            ),
            Error::UnknownSession(_) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "unknown_session", "detail": self.0.to_string() }),
            ),
            _ => {
                warn!("Admin API request failed: {}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal", "detail": self.0.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// `POST /admin/update/start`
pub async fn start_update(
    State(orchestrator): State<Orchestrator>,
    body: Option<Json<StartRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let id = orchestrator
        .start(
            request.target_version.as_deref(),
            request.channel.as_deref(),
            request.force,
        )
        .await?;
    let session = orchestrator
        .store()
        .snapshot(id)
        .ok_or(Error::UnknownSession(id))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "update_id": session.id,
            "target_version": session.target_version,
            "channel": session.channel,
            "state": session.state,
        })),
    )
        .into_response())
}

/// `GET /admin/update/status`
pub async fn update_status(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<UpdateSession>, ApiError> {
    let session = match query.update_id {
        Some(id) => orchestrator
            .store()
            .snapshot(id)
            .ok_or(Error::UnknownSession(id))?,
        None => orchestrator
            .store()
            .latest()
            .ok_or(Error::UnknownSession(Uuid::nil()))?,
    };
    Ok(Json(session))
}

/// `GET /admin/update/stream`
///
/// One SSE event per session event; the stream closes after the terminal
/// event. Keep-alive comments cover quiet phases.
pub async fn update_stream(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<SessionQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = match query.update_id {
        Some(id) => id,
        None => orchestrator
            .store()
            .latest()
            .map(|s| s.id)
            .ok_or(Error::UnknownSession(Uuid::nil()))?,
    };
    let mut rx = orchestrator
        .store()
        .subscribe(id)
        .ok_or(Error::UnknownSession(id))?;

    // Replay the current position first so late subscribers see where the
    // session stands.
    let snapshot = orchestrator.store().snapshot(id);

    let stream = async_stream::stream! {
        let mut finished = false;
        if let Some(session) = snapshot {
            let data = json!({
                "state": session.state,
                "progress": session.progress,
                "message": "snapshot",
            });
            yield Ok(Event::default().event("snapshot").data(data.to_string()));
            finished = session.state.is_terminal();
        }
        while !finished {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    let name = format!("{:?}", event.event).to_lowercase();
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(Event::default().event(name).data(data)),
                        Err(e) => warn!("Failed to serialize session event: {e}"),
                    }
                    if terminal {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    let data = json!({ "missed": missed });
                    yield Ok(Event::default().event("lagged").data(data.to_string()));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `POST /admin/update/cancel`
pub async fn cancel_update(
    State(orchestrator): State<Orchestrator>,
    body: Option<Json<CancelRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let id = match request.update_id {
        Some(id) => id,
        None => orchestrator
            .store()
            .active()
            .ok_or(Error::UnknownSession(Uuid::nil()))?,
    };
    orchestrator.cancel(id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "update_id": id, "cancelling": true })),
    )
        .into_response())
}

/// `GET /admin/version`
pub async fn version_report(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<VersionQuery>,
) -> Result<Response, ApiError> {
    let services = orchestrator.config().services.all();
    let mut report = orchestrator
        .resolver()
        .report(&services, query.channel.as_deref(), query.refresh)
        .await?;
    report.update_in_progress = orchestrator.store().active().is_some();
    Ok(Json(report).into_response())
}
