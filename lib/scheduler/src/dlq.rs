// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dead-letter queue.
//!
//! Requests that exceed their deadline while queued are recorded here as an
//! append-only list in the shared store, for operator inspection. Entries
//! never re-enter the live queue; a caller wanting another attempt submits
//! a fresh request.

use std::sync::Arc;

use crate::error::SchedulerError;
use crate::metrics;
use crate::request::{DlqEntry, RequestStatus, ScheduledRequest};
use crate::store::{keys, SharedStore};

pub struct DeadLetterQueue {
    store: Arc<dyn SharedStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Record a timed-out request. The request transitions to its terminal
    /// status here.
    pub async fn record(
        &self,
        mut request: ScheduledRequest,
        timeout_reason: &str,
        now_ms: u64,
    ) -> Result<DlqEntry, SchedulerError> {
        request.status = RequestStatus::TimedOut;
        let entry = DlqEntry {
            request,
            timeout_reason: timeout_reason.to_string(),
            recorded_at_ms: now_ms,
        };
        let bytes =
            serde_json::to_vec(&entry).map_err(|e| SchedulerError::Store(e.to_string()))?;
        self.store
            .rpush(keys::DLQ_LIST, bytes)
            .await
            .map_err(|e| SchedulerError::Store(e.to_string()))?;

        metrics::DLQ_ENTRIES.inc();
        tracing::warn!(
            request_id = %entry.request.request_id,
            tenant_id = %entry.request.tenant_id,
            tier = %entry.request.tier,
            waited_ms = now_ms.saturating_sub(entry.request.arrival_ms),
            "request dead-lettered after exceeding queue deadline"
        );
        Ok(entry)
    }

    /// Most recent entries, up to `limit`, oldest first.
    pub async fn entries(&self, limit: usize) -> Result<Vec<DlqEntry>, SchedulerError> {
        let len = self.len().await?;
        let start = len.saturating_sub(limit);
        let raw = self
            .store
            .lrange(keys::DLQ_LIST, start, limit)
            .await
            .map_err(|e| SchedulerError::Store(e.to_string()))?;
        raw.iter()
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| SchedulerError::Store(e.to_string()))
            })
            .collect()
    }

    pub async fn len(&self) -> Result<usize, SchedulerError> {
        self.store
            .llen(keys::DLQ_LIST)
            .await
            .map_err(|e| SchedulerError::Store(e.to_string()))
    }
}
