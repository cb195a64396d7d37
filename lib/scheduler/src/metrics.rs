// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler metrics surface.
//!
//! Queue depth, wait-time distributions, rejection counts and
//! credit-utilization counters, exported for the platform's observability
//! collector. Metrics are process-wide statics; registration against a
//! Prometheus registry is idempotent so the HTTP layer and tests can both
//! call it.

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
};

/// Metric name constants.
pub mod names {
    pub const PREFIX: &str = "tenant_scheduler";

    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const QUEUE_WAIT_SECONDS: &str = "queue_wait_seconds";
    pub const REJECTIONS: &str = "rejections_total";
    pub const DISPATCHES: &str = "dispatches_total";
    pub const CREDITS_GRANTED: &str = "credits_granted_total";
    pub const CREDITS_CONSUMED: &str = "credits_consumed_total";
    pub const DLQ_ENTRIES: &str = "dlq_entries_total";
    pub const THROTTLED_TENANTS: &str = "throttled_tenants";
    pub const WORKERS_BUSY: &str = "workers_busy";
    pub const DISPATCH_SECONDS: &str = "dispatch_seconds";
}

fn metric_name(suffix: &str) -> String {
    format!("{}_{}", names::PREFIX, suffix)
}

/// Requests currently queued in the shared queue, per tier.
pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            metric_name(names::QUEUE_DEPTH),
            "Requests currently queued in the global queue",
        ),
        &["tier"],
    )
    .expect("queue_depth gauge")
});

/// Time from admission to dispatch, per tier.
pub static QUEUE_WAIT_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            metric_name(names::QUEUE_WAIT_SECONDS),
            "Queue wait from admission to dispatch (seconds)",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ]),
        &["tier"],
    )
    .expect("queue_wait_seconds histogram")
});

/// Rejected submissions by machine-readable reason.
pub static REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            metric_name(names::REJECTIONS),
            "Rejected submissions by reason",
        ),
        &["reason"],
    )
    .expect("rejections counter")
});

/// Requests handed to the pipeline, per tier.
pub static DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(metric_name(names::DISPATCHES), "Dispatched requests"),
        &["tier"],
    )
    .expect("dispatches counter")
});

/// Credits granted per tier across allocation ticks.
pub static CREDITS_GRANTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            metric_name(names::CREDITS_GRANTED),
            "Dequeue credits granted per allocation tick",
        ),
        &["tier"],
    )
    .expect("credits_granted counter")
});

/// Credits actually consumed by dispatches, per tier.
pub static CREDITS_CONSUMED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            metric_name(names::CREDITS_CONSUMED),
            "Dequeue credits consumed by dispatches",
        ),
        &["tier"],
    )
    .expect("credits_consumed counter")
});

/// Requests dead-lettered after exceeding their queue deadline.
pub static DLQ_ENTRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        metric_name(names::DLQ_ENTRIES),
        "Requests moved to the dead-letter queue",
    )
    .expect("dlq_entries counter")
});

/// Tenants currently under a governor throttle.
pub static THROTTLED_TENANTS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        metric_name(names::THROTTLED_TENANTS),
        "Tenants currently throttled by the noisy-neighbor governor",
    )
    .expect("throttled_tenants gauge")
});

/// Occupied worker slots on this replica.
pub static WORKERS_BUSY: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        metric_name(names::WORKERS_BUSY),
        "Worker slots currently executing pipeline calls",
    )
    .expect("workers_busy gauge")
});

/// Pipeline execution latency.
pub static DISPATCH_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            metric_name(names::DISPATCH_SECONDS),
            "Pipeline execution latency (seconds)",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("dispatch_seconds histogram")
});

static REGISTERED: OnceCell<()> = OnceCell::new();

/// Register all scheduler metrics with the given registry. Idempotent; only
/// the first call registers.
pub fn ensure_scheduler_metrics_registered(
    registry: &prometheus::Registry,
) -> Result<(), prometheus::Error> {
    if REGISTERED.get().is_some() {
        return Ok(());
    }
    registry.register(Box::new(QUEUE_DEPTH.clone()))?;
    registry.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    registry.register(Box::new(REJECTIONS.clone()))?;
    registry.register(Box::new(DISPATCHES.clone()))?;
    registry.register(Box::new(CREDITS_GRANTED.clone()))?;
    registry.register(Box::new(CREDITS_CONSUMED.clone()))?;
    registry.register(Box::new(DLQ_ENTRIES.clone()))?;
    registry.register(Box::new(THROTTLED_TENANTS.clone()))?;
    registry.register(Box::new(WORKERS_BUSY.clone()))?;
    registry.register(Box::new(DISPATCH_SECONDS.clone()))?;
    let _ = REGISTERED.set(());
    Ok(())
}
