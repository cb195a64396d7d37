// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Caller-facing error taxonomy for the scheduler boundary.
//!
//! Every submitted request resolves to exactly one of success or one of
//! these errors; there are no partial states. `RateLimited` and
//! `CapacityExhausted` are rejected synchronously at admission, the rest
//! are delivered through the pending-response channel.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Admission rejected by the token bucket. Recoverable; the caller
    /// should retry no sooner than `retry_after`.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The request waited past its deadline without being dispatched.
    /// Terminal; the scheduler never retries it.
    #[error("request exceeded its maximum queue wait and was dead-lettered")]
    QueueTimeout,

    /// The caller withdrew the request before dispatch.
    #[error("request was cancelled before dispatch")]
    Cancelled,

    /// The downstream pipeline invocation failed. Surfaced as-is; retry
    /// policy, if any, belongs to the pipeline layer.
    #[error("pipeline dispatch failed: {0}")]
    DispatchFailure(anyhow::Error),

    /// The global queue is at its hard size ceiling. Distinct from
    /// per-tenant rate limiting.
    #[error("global queue is at capacity")]
    CapacityExhausted,

    /// The scheduler is shutting down and can no longer resolve the request.
    #[error("scheduler is shutting down")]
    Shutdown,

    /// A shared-store operation failed or stayed contended past the retry
    /// budget.
    #[error("shared store operation failed: {0}")]
    Store(String),
}

impl SchedulerError {
    /// Machine-readable rejection reason, used as a metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            SchedulerError::RateLimited { .. } => "rate_limited",
            SchedulerError::QueueTimeout => "timed_out",
            SchedulerError::Cancelled => "cancelled",
            SchedulerError::DispatchFailure(_) => "dispatch_failure",
            SchedulerError::CapacityExhausted => "capacity_exhausted",
            SchedulerError::Shutdown => "shutdown",
            SchedulerError::Store(_) => "store",
        }
    }
}
