// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler facade and background loops.
//!
//! One `Scheduler` per replica wires the admission gate, the shared global
//! queue, the fair-share allocator, the worker pool, the noisy-neighbor
//! governor and the dead-letter handler together. Replicas coordinate only
//! through the shared store; nothing here locks across replicas.
//!
//! Control flow per request: `submit` runs the token bucket check, enqueues
//! into the shared queue and parks a oneshot waiter. The dispatch loop
//! grants per-tier credits every allocation tick, claims eligible requests
//! FIFO-within-tier, and executes them on the bounded worker pool. A
//! request that outlives its deadline while queued is dead-lettered and its
//! waiter resolved with `QueueTimeout` — exactly one terminal outcome per
//! request.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::allocator::{compute_allocation, TickAllocation};
use crate::config::SchedulerConfig;
use crate::dlq::DeadLetterQueue;
use crate::error::SchedulerError;
use crate::governor::{GovernorAction, NoisyNeighborGovernor, TenantState};
use crate::limiter::{Admission, TokenBucketLimiter};
use crate::metrics;
use crate::pipeline::{PipelineResponse, RagPipeline};
use crate::queue::GlobalQueue;
use crate::request::{DlqEntry, RequestStatus, ScheduledRequest};
use crate::store::SharedStore;
use crate::tier::TenantTier;
use crate::utils::{epoch_ms, short_replica_id};
use crate::worker::WorkerPool;
use crate::Result;

const DLQ_REASON_DEADLINE: &str = "queue_deadline_exceeded";

type ResponseSender = oneshot::Sender<std::result::Result<PipelineResponse, SchedulerError>>;

/// Handle for one accepted request: the id (for cancellation) plus the
/// pending response.
#[derive(Debug)]
pub struct QueueTicket {
    pub request_id: Uuid,
    pub admission: Admission,
    rx: oneshot::Receiver<std::result::Result<PipelineResponse, SchedulerError>>,
}

impl QueueTicket {
    /// Wait for the terminal outcome: completion, timeout, cancellation or
    /// dispatch failure. Delivered exactly once.
    pub async fn response(self) -> std::result::Result<PipelineResponse, SchedulerError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Shutdown),
        }
    }
}

/// Queue depth snapshot for operators: this replica's claim buffer, the
/// shared queue, and the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDepths {
    pub local: usize,
    pub global: usize,
    pub dlq: usize,
}

pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    queue: Arc<GlobalQueue>,
    limiter: Arc<TokenBucketLimiter>,
    governor: Arc<NoisyNeighborGovernor>,
    pool: Arc<WorkerPool>,
    dlq: Arc<DeadLetterQueue>,
    pipeline: Arc<dyn RagPipeline>,
    pending: Arc<DashMap<Uuid, ResponseSender>>,
    cancelled: Arc<DashMap<Uuid, ()>>,
    arrival_notify: Arc<Notify>,
    replica_id: Arc<String>,
    cancellation_token: CancellationToken,
    /// Only the originating instance holds the loop handles.
    tasks: Option<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Validate the config, wire the components over the shared store, and
    /// spawn the dispatch and governor loops.
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn SharedStore>,
        pipeline: Arc<dyn RagPipeline>,
    ) -> Result<Self> {
        config.ensure_valid()?;
        let config = Arc::new(config);

        let queue = Arc::new(GlobalQueue::new(
            store.clone(),
            config.max_queue_depth,
            config.local_buffer_size,
        ));
        let limiter = Arc::new(TokenBucketLimiter::new(store.clone(), config.tiers.clone()));
        let governor = Arc::new(NoisyNeighborGovernor::new(
            config.governor_window_ms,
            config.governor_sustain_ms,
            config.governor_cooldown_ms,
            config.governor_penalty_factor,
            config.tiers.map(|_, t| t.hard_cap_percent),
        ));
        let pool = WorkerPool::new(config.worker_pool_size);
        let dlq = Arc::new(DeadLetterQueue::new(store));

        let mut scheduler = Self {
            config,
            queue,
            limiter,
            governor,
            pool,
            dlq,
            pipeline,
            pending: Arc::new(DashMap::new()),
            cancelled: Arc::new(DashMap::new()),
            arrival_notify: Arc::new(Notify::new()),
            replica_id: Arc::new(short_replica_id()),
            cancellation_token: CancellationToken::new(),
            tasks: None,
        };

        let dispatch_handle = tokio::spawn(scheduler.clone().run_dispatch_loop());
        let governor_handle = tokio::spawn(scheduler.clone().run_governor_loop());
        scheduler.tasks = Some(vec![dispatch_handle, governor_handle]);

        tracing::info!(
            replica_id = %scheduler.replica_id,
            worker_pool_size = scheduler.config.worker_pool_size,
            allocation_tick_ms = scheduler.config.allocation_tick_ms,
            "scheduler started"
        );
        Ok(scheduler)
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Admit, enqueue and return a ticket whose response resolves on the
    /// request's terminal outcome. Rejections (`RateLimited`,
    /// `CapacityExhausted`) are synchronous so callers are never left
    /// waiting on a request that was never queued.
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        tier: TenantTier,
        payload: serde_json::Value,
    ) -> std::result::Result<QueueTicket, SchedulerError> {
        if self.cancellation_token.is_cancelled() {
            return Err(SchedulerError::Shutdown);
        }
        let now_ms = epoch_ms();
        let admission = self.limiter.admit(tenant_id, tier, now_ms).await?;

        let request = ScheduledRequest::new(
            tenant_id,
            tier,
            payload,
            now_ms,
            self.config.max_queue_wait_ms,
            self.replica_id.as_str(),
        );
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.request_id, tx);

        if let Err(err) = self.queue.enqueue(&request).await {
            self.pending.remove(&request.request_id);
            return Err(err);
        }
        self.arrival_notify.notify_one();

        Ok(QueueTicket {
            request_id: request.request_id,
            admission,
            rx,
        })
    }

    /// Admit, enqueue and wait for the terminal outcome.
    pub async fn submit(
        &self,
        tenant_id: &str,
        tier: TenantTier,
        payload: serde_json::Value,
    ) -> std::result::Result<PipelineResponse, SchedulerError> {
        self.enqueue(tenant_id, tier, payload).await?.response().await
    }

    /// Withdraw a request before dispatch. The dispatch loop skips it at
    /// claim time and acknowledges the caller with `Cancelled`. A request
    /// already handed to the pipeline is unaffected.
    pub fn cancel(&self, request_id: Uuid) {
        if self.pending.contains_key(&request_id) {
            self.cancelled.insert(request_id, ());
            tracing::debug!(request_id = %request_id, "request marked cancelled");
        }
    }

    /// Claim every queued request past its deadline, dead-letter it and
    /// resolve its waiter with `QueueTimeout`. Runs at the start of every
    /// allocation tick; also callable directly.
    pub async fn scan_and_expire(
        &self,
        now_ms: u64,
    ) -> std::result::Result<Vec<DlqEntry>, SchedulerError> {
        let expired = self.queue.remove_expired(now_ms).await?;
        let mut entries = Vec::with_capacity(expired.len());
        for request in expired {
            entries.push(self.dead_letter(request, now_ms).await?);
        }
        Ok(entries)
    }

    pub async fn queue_depths(&self) -> std::result::Result<QueueDepths, SchedulerError> {
        Ok(QueueDepths {
            local: self.queue.local_depth(),
            global: self.queue.global_depth().await?,
            dlq: self.dlq.len().await?,
        })
    }

    /// Dead-letter entries for operator inspection, oldest first.
    pub async fn dlq_entries(
        &self,
        limit: usize,
    ) -> std::result::Result<Vec<DlqEntry>, SchedulerError> {
        self.dlq.entries(limit).await
    }

    /// A tenant's share of dispatch capacity over the governor window.
    pub fn noisy_neighbor_score(&self, tenant_id: &str) -> f64 {
        self.governor.noisy_neighbor_score(tenant_id, epoch_ms())
    }

    pub fn governor_state(&self, tenant_id: &str) -> TenantState {
        self.governor.state(tenant_id)
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stop the background loops, hand locally claimed work back to the
    /// shared queue, and fail still-pending waiters with `Shutdown`.
    pub async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        if let Some(handles) = self.tasks.take() {
            for handle in handles {
                let _ = handle.await;
            }
        }
        match self.queue.drain_local_to_global().await {
            Ok(drained) if drained > 0 => {
                tracing::info!(drained, "returned buffered claims to the shared queue")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "failed to drain local buffer during shutdown"),
        }

        let waiting: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        for request_id in waiting {
            self.resolve(request_id, Err(SchedulerError::Shutdown));
        }
        tracing::info!(replica_id = %self.replica_id, "scheduler stopped");
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    async fn run_dispatch_loop(self) {
        let mut tick = interval(self.config.allocation_tick());
        let mut allocation = TickAllocation::empty();
        let token = self.cancellation_token.clone();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                _ = tick.tick() => {
                    let now_ms = epoch_ms();
                    if let Err(err) = self.scan_and_expire(now_ms).await {
                        tracing::warn!(%err, "deadline scan failed");
                    }
                    allocation = self.allocate(now_ms).await;
                    self.dispatch(&mut allocation, now_ms).await;
                }

                // New arrival or a freed slot: spend the current tick's
                // remaining credits without waiting for the next tick.
                _ = self.arrival_notify.notified() => {
                    self.dispatch(&mut allocation, epoch_ms()).await;
                }
            }
        }
        tracing::debug!("dispatch loop stopped");
    }

    async fn run_governor_loop(self) {
        let mut scan = interval(self.config.governor_scan());
        let token = self.cancellation_token.clone();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                _ = scan.tick() => {
                    self.run_governor_scan(epoch_ms()).await;
                }
            }
        }
        tracing::debug!("governor loop stopped");
    }

    /// Compute this tick's credit grants from observed backlog (shared queue
    /// plus this replica's claimed buffer) and free worker capacity.
    async fn allocate(&self, now_ms: u64) -> TickAllocation {
        let global_depths = match self.queue.depths().await {
            Ok(depths) => depths,
            Err(err) => {
                tracing::warn!(%err, "queue depth read failed, granting no credits");
                return TickAllocation::empty();
            }
        };
        let local_depths = self.queue.local_depths();
        let depths = global_depths.map(|tier, depth| *depth + local_depths[tier]);

        let capacity = self.pool.free_slots();
        let granted = compute_allocation(
            &depths,
            capacity,
            &self.config.tiers,
            self.config.cap_redistribution,
        );
        for (tier, credits) in granted.iter() {
            if *credits > 0 {
                metrics::CREDITS_GRANTED
                    .with_label_values(&[tier.as_str()])
                    .inc_by(*credits as u64);
            }
        }
        TickAllocation::new(now_ms, granted)
    }

    /// Claim and dispatch eligible requests, tier order first, FIFO within
    /// a tier, bounded by the tick's remaining credits and free slots.
    async fn dispatch(&self, allocation: &mut TickAllocation, now_ms: u64) {
        for tier in TenantTier::ALL {
            loop {
                let credits = allocation.remaining(tier) as usize;
                if credits == 0 {
                    break;
                }
                let free = self.pool.free_slots();
                if free == 0 {
                    return;
                }

                let batch = match self.queue.dequeue_for_tier(tier, credits.min(free)).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        tracing::warn!(%err, tier = %tier, "dequeue failed");
                        return;
                    }
                };
                if batch.is_empty() {
                    break;
                }

                let mut batch = batch.into_iter();
                while let Some(request) = batch.next() {
                    // Logical cancellation: skip before taking a slot.
                    if self.cancelled.remove(&request.request_id).is_some() {
                        tracing::debug!(request_id = %request.request_id, "skipping cancelled request");
                        self.resolve(request.request_id, Err(SchedulerError::Cancelled));
                        continue;
                    }
                    // Claimed after its deadline passed mid-tick.
                    if request.is_expired(now_ms) {
                        if let Err(err) = self.dead_letter(request, now_ms).await {
                            tracing::warn!(%err, "failed to dead-letter expired claim");
                        }
                        continue;
                    }

                    let Some(permit) = WorkerPool::try_acquire(&self.pool, request.request_id, now_ms)
                    else {
                        // Out of slots mid-batch; keep the claims for the
                        // next pass.
                        let mut rest = vec![request];
                        rest.extend(batch);
                        self.queue.requeue_local(rest);
                        return;
                    };
                    allocation.consume(tier);
                    self.spawn_dispatch(request, permit, now_ms);
                }
            }
        }
    }

    fn spawn_dispatch(
        &self,
        mut request: ScheduledRequest,
        permit: crate::worker::SlotPermit,
        now_ms: u64,
    ) {
        request.status = RequestStatus::Dispatched;
        request.dispatched_ms = Some(now_ms);
        metrics::QUEUE_WAIT_SECONDS
            .with_label_values(&[request.tier.as_str()])
            .observe(request.wait_ms(now_ms) as f64 / 1_000.0);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            tracing::debug!(
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                tier = %request.tier,
                slot_id = permit.slot_id(),
                "dispatching to pipeline"
            );

            scheduler
                .governor
                .record_dispatch(&request.tenant_id, request.tier, epoch_ms());
            metrics::DISPATCHES
                .with_label_values(&[request.tier.as_str()])
                .inc();

            let result = scheduler
                .pipeline
                .execute(
                    request.request_id,
                    &request.tenant_id,
                    request.payload.clone(),
                )
                .await;
            metrics::DISPATCH_SECONDS.observe(started.elapsed().as_secs_f64());
            metrics::CREDITS_CONSUMED
                .with_label_values(&[request.tier.as_str()])
                .inc();

            match result {
                Ok(response) => scheduler.resolve(request.request_id, Ok(response)),
                Err(err) => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        tenant_id = %request.tenant_id,
                        %err,
                        "pipeline dispatch failed"
                    );
                    scheduler.resolve(
                        request.request_id,
                        Err(SchedulerError::DispatchFailure(err)),
                    );
                }
            }

            // Release the slot, then let the loop spend any credits the
            // freed capacity unlocks within the current tick.
            drop(permit);
            scheduler.arrival_notify.notify_one();
        });
    }

    async fn run_governor_scan(&self, now_ms: u64) {
        for action in self.governor.scan(now_ms) {
            match action {
                GovernorAction::Throttle {
                    tenant_id,
                    tier,
                    penalty_factor,
                } => {
                    if let Err(err) = self
                        .limiter
                        .apply_penalty(&tenant_id, tier, penalty_factor, now_ms)
                        .await
                    {
                        tracing::warn!(%err, %tenant_id, "failed to apply governor penalty");
                    }
                }
                GovernorAction::Restore { tenant_id, tier } => {
                    if let Err(err) = self.limiter.clear_penalty(&tenant_id, tier, now_ms).await {
                        tracing::warn!(%err, %tenant_id, "failed to clear governor penalty");
                    }
                }
            }
        }
        metrics::THROTTLED_TENANTS.set(self.governor.throttled_count() as i64);
    }

    async fn dead_letter(
        &self,
        request: ScheduledRequest,
        now_ms: u64,
    ) -> std::result::Result<DlqEntry, SchedulerError> {
        let request_id = request.request_id;
        let entry = self.dlq.record(request, DLQ_REASON_DEADLINE, now_ms).await?;
        metrics::REJECTIONS.with_label_values(&["timed_out"]).inc();
        self.resolve(request_id, Err(SchedulerError::QueueTimeout));
        Ok(entry)
    }

    /// Deliver a terminal outcome to the request's waiter, exactly once.
    fn resolve(
        &self,
        request_id: Uuid,
        result: std::result::Result<PipelineResponse, SchedulerError>,
    ) {
        self.cancelled.remove(&request_id);
        if let Some((_, waiter)) = self.pending.remove(&request_id) {
            let _ = waiter.send(result);
        }
    }
}

// Clones share all state; only the original owns the loop handles.
impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
            governor: self.governor.clone(),
            pool: self.pool.clone(),
            dlq: self.dlq.clone(),
            pipeline: self.pipeline.clone(),
            pending: self.pending.clone(),
            cancelled: self.cancelled.clone(),
            arrival_notify: self.arrival_notify.clone(),
            replica_id: self.replica_id.clone(),
            cancellation_token: self.cancellation_token.clone(),
            tasks: None,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Only the originating instance tears the loops down.
        if let Some(handles) = self.tasks.take() {
            self.cancellation_token.cancel();
            for handle in handles {
                handle.abort();
            }
        }
    }
}
