// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the downstream retrieval/generation pipeline.
//!
//! The scheduler treats the pipeline as opaque: it bounds concurrency and
//! dispatches each claimed request exactly once. Retries, fallback tiers
//! and response shaping live on the other side of this trait.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

pub use async_trait::async_trait;

/// Opaque pipeline result handed back to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub request_id: Uuid,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait RagPipeline: Send + Sync {
    /// Execute one admitted request. Called at most once per request, from
    /// at most `worker_pool_size` tasks concurrently per replica.
    async fn execute(
        &self,
        request_id: Uuid,
        tenant_id: &str,
        payload: serde_json::Value,
    ) -> Result<PipelineResponse>;
}
