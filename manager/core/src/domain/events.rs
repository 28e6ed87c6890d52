// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::repository::SyncReport;
use crate::domain::service::{ServiceName, ServiceVersion};

/// Service lifecycle events published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    Deployed {
        name: ServiceName,
        version: ServiceVersion,
        url: String,
        main: bool,
        deployed_at: DateTime<Utc>,
    },
    DeployFailed {
        name: ServiceName,
        version: ServiceVersion,
        stage: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    Killed {
        name: ServiceName,
        version: ServiceVersion,
        image_removed: bool,
        killed_at: DateTime<Utc>,
    },
    MainAssigned {
        name: ServiceName,
        version: ServiceVersion,
        assigned_at: DateTime<Utc>,
    },
    RoutesReplayed {
        instances: usize,
        families: usize,
        replayed_at: DateTime<Utc>,
    },
    DriftDetected {
        report: SyncReport,
        detected_at: DateTime<Utc>,
    },
}
