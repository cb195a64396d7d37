// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A unit of admitted work and its lifecycle states.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tier::TenantTier;

/// Width of one tier's priority band. Arrival timestamps are millisecond
/// epoch values (~1.7e12 today), so the band must dominate them.
pub const TIER_SCORE_BAND: f64 = 1e13;

/// Lifecycle status. Transitions are one-way; every request ends in exactly
/// one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Dispatched,
    Completed,
    Rejected,
    TimedOut,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Rejected
                | RequestStatus::TimedOut
                | RequestStatus::Cancelled
        )
    }
}

/// One admitted unit of work. Owned exclusively by the global queue until a
/// worker claims it; ownership moves to the worker on dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRequest {
    pub request_id: Uuid,
    pub tenant_id: String,
    pub tier: TenantTier,
    /// Milliseconds since the Unix epoch at admission.
    pub arrival_ms: u64,
    /// `arrival_ms` + the configured maximum queue wait.
    pub deadline_ms: u64,
    /// Replica that admitted the request and holds its response channel.
    pub replica_id: String,
    pub status: RequestStatus,
    /// Set when a worker claims the request.
    pub dispatched_ms: Option<u64>,
    /// Opaque query payload handed to the pipeline on dispatch.
    pub payload: serde_json::Value,
}

impl ScheduledRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        tier: TenantTier,
        payload: serde_json::Value,
        arrival_ms: u64,
        max_wait_ms: u64,
        replica_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            tier,
            arrival_ms,
            deadline_ms: arrival_ms.saturating_add(max_wait_ms),
            replica_id: replica_id.into(),
            status: RequestStatus::Queued,
            dispatched_ms: None,
            payload,
        }
    }

    /// Queue ordering key: tier band first, arrival time second. Compared
    /// as a plain float, this yields strict FIFO within a tier and tier
    /// precedence across tiers.
    pub fn priority_score(&self) -> f64 {
        self.tier.ordinal() as f64 * TIER_SCORE_BAND + self.arrival_ms as f64
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.deadline_ms < now_ms
    }

    /// Queue wait so far, in milliseconds.
    pub fn wait_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.arrival_ms)
    }
}

/// Score range `[min, max)` covering one tier's band.
pub fn tier_score_range(tier: TenantTier) -> (f64, f64) {
    let min = tier.ordinal() as f64 * TIER_SCORE_BAND;
    (min, min + TIER_SCORE_BAND)
}

/// A request that exceeded its deadline while queued. Append-only, kept for
/// operator inspection; never re-enters the live queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub request: ScheduledRequest,
    pub timeout_reason: String,
    pub recorded_at_ms: u64,
}
