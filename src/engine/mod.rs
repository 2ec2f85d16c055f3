// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine abstraction.
//!
//! The orchestrator never talks to a runtime directly; it goes through the
//! [`ContainerEngine`] trait. `DockerEngine` is the production adapter,
//! `MockEngine` the scripted test double.

mod docker;
mod mock;
mod traits;

pub use docker::{DockerEngine, DockerEngineConfig};
pub use mock::MockEngine;
pub use traits::{
    ContainerEngine, EngineError, HealthStatus, ImageRef, ReplacedContainer, ServiceState,
    TaskOutput,
};
pub use traits::Result as EngineResult;
