// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the updater.

use thiserror::Error;

use crate::engine::EngineError;
use crate::session::UpdateState;

/// Errors that can occur in updater operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest or registry HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Container engine operation failed.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// An update session is already in flight.
    #[error("Update already in progress: {active_id}")]
    Conflict {
        /// Id of the active session.
        active_id: uuid::Uuid,
    },

    /// Cancellation requested after the point of no return.
    #[error("Too late to cancel: session is in state {state}")]
    TooLate {
        /// State the session had reached.
        state: UpdateState,
    },

    /// Requested target version does not exist in the channel.
    #[error("Invalid target version: {0}")]
    InvalidTarget(String),

    /// No session with the given id.
    #[error("Unknown session: {0}")]
    UnknownSession(uuid::Uuid),

    /// Backup or restore operation failed.
    #[error("Backup error: {0}")]
    Backup(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
