// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stack Updater - Safe, Observable Container Stack Upgrades
//!
//! This crate provides the update orchestrator for a containerized
//! application stack: it resolves release targets, captures restorable
//! backups, pulls digest-pinned images, runs schema migrations, recreates
//! service containers and verifies health - rolling back to the pre-update
//! state when a late step fails.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           Operator / UI                              │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │ HTTP + SSE
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     stack-updater (This Crate)                       │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌────────────────┐   │
//! │  │  Admin    │  │  Update   │  │  Version  │  │    Backup      │   │
//! │  │   API     │─▶│ Orchestr. │─▶│ Resolver  │  │    Manager     │   │
//! │  └───────────┘  └─────┬─────┘  └───────────┘  └────────────────┘   │
//! │                       │ ContainerEngine trait                       │
//! └───────────────────────┼─────────────────────────────────────────────┘
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Container Runtime (docker)                      │
//! │         app  │  backend  │  postgres  │  influxdb  │  one-shots     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Update State Machine
//!
//! ```text
//! idle ─▶ preflight ─▶ backup ─▶ pull ─▶ migrate ─▶ recreate ─▶ healthcheck ─▶ completed
//!             │           │        │        │           │            │
//!             ▼           ▼        ▼        ▼           └────────────┘
//!           failed      failed   failed   failed               │
//!                                                              ▼
//!                                                          rollback ─▶ failed
//! ```
//!
//! Failures before `recreate` leave the running containers untouched. Once
//! a container has been replaced a failure triggers rollback: datastores
//! are restored from the backup generation and containers are re-pinned to
//! their pre-update digests.
//!
//! # Admin API
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `POST /admin/update/start` | Accept an update session (409 while one is in flight) |
//! | `GET /admin/update/status` | Snapshot a session: state, progress, log tail |
//! | `GET /admin/update/stream` | Server-sent events for a session, closing on the terminal event |
//! | `POST /admin/update/cancel` | Request cancellation (honored before migrations start) |
//! | `GET /admin/version` | Current per-service versions and update availability |
//!
//! # Invariants
//!
//! - At most one update session is in flight (single-flight).
//! - Progress is monotone within a session.
//! - A backup generation exists on disk completely or not at all.
//! - The known-good generation is never pruned or purged.
//! - Datastore containers are never recreated by an update.

#![deny(missing_docs)]

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod migrate;
pub mod orchestrator;
pub mod purge_worker;
pub mod server;
pub mod session;
pub mod version;

pub use error::{Error, Result};
