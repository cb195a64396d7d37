// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Tenant Scheduler
//!
//! Tenant-fair request scheduling and backpressure between an API edge and
//! a retrieval/generation pipeline. Enforces weighted fair sharing across
//! tenant tiers, per-tenant admission control, noisy-neighbor throttling,
//! bounded queueing latency with deterministic timeout/dead-letter
//! behavior, and a fixed per-replica concurrency bound — coordinating
//! across replicas only through a shared atomic store.

pub use anyhow::{Context as ErrorContext, Result};
pub use tokio_util::sync::CancellationToken;

pub mod allocator;
pub mod config;
pub mod dlq;
pub mod error;
pub mod governor;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod tier;
pub mod utils;
pub mod worker;

pub use config::{SchedulerConfig, TierConfig};
pub use error::SchedulerError;
pub use limiter::Admission;
pub use pipeline::{PipelineResponse, RagPipeline};
pub use request::{DlqEntry, RequestStatus, ScheduledRequest};
pub use scheduler::{QueueDepths, QueueTicket, Scheduler};
pub use store::{MemoryStore, SharedStore};
pub use tier::{TenantTier, TierMap};
