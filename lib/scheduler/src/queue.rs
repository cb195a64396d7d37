// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global priority queue over the shared store.
//!
//! One sorted set per tier, scored by `(tier band, arrival)` so range reads
//! are strict FIFO within the tier. All replicas enqueue into and claim from
//! the same sets; a successful `zrem` is the claim. Each replica keeps a
//! small bounded buffer of claimed-but-undispatched work to cut store
//! round-trips; buffered entries count as in-flight for this replica and
//! are drained back to the global sets on shutdown.
//!
//! Deadlines are `arrival + max_queue_wait`, so within a tier band the
//! arrival ordering is also the deadline ordering and the expiry scan reads
//! only the head of each band.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SchedulerError;
use crate::metrics;
use crate::request::{tier_score_range, ScheduledRequest};
use crate::store::{keys, SharedStore};
use crate::tier::{TenantTier, TierMap};

/// Store fetch batch for claim and expiry scans.
const SCAN_BATCH: usize = 32;

pub struct GlobalQueue {
    store: Arc<dyn SharedStore>,
    max_depth: usize,
    local_capacity: usize,
    /// Claimed-but-undispatched requests, FIFO per tier.
    local: Mutex<VecDeque<ScheduledRequest>>,
}

impl GlobalQueue {
    pub fn new(store: Arc<dyn SharedStore>, max_depth: usize, local_capacity: usize) -> Self {
        Self {
            store,
            max_depth,
            local_capacity,
            local: Mutex::new(VecDeque::new()),
        }
    }

    /// Depth of the shared queue across all tiers. Does not include any
    /// replica's local buffer.
    pub async fn global_depth(&self) -> Result<usize, SchedulerError> {
        let mut total = 0;
        for tier in TenantTier::ALL {
            total += self.store_zcard(&keys::tier_queue(tier)).await?;
        }
        Ok(total)
    }

    /// Per-tier depth of the shared queue, refreshing the depth gauges.
    pub async fn depths(&self) -> Result<TierMap<usize>, SchedulerError> {
        let mut depths = TierMap::<usize>::default();
        for tier in TenantTier::ALL {
            let depth = self.store_zcard(&keys::tier_queue(tier)).await?;
            depths[tier] = depth;
            metrics::QUEUE_DEPTH
                .with_label_values(&[tier.as_str()])
                .set(depth as i64);
        }
        Ok(depths)
    }

    pub fn local_depth(&self) -> usize {
        self.local.lock().len()
    }

    /// Per-tier count of locally claimed, undispatched requests. These are
    /// in-flight for this replica and must stay visible to allocation.
    pub fn local_depths(&self) -> TierMap<usize> {
        let local = self.local.lock();
        let mut depths = TierMap::<usize>::default();
        for request in local.iter() {
            depths[request.tier] += 1;
        }
        depths
    }

    /// Add an admitted request to its tier's sorted set. Rejects with
    /// `CapacityExhausted` at the global ceiling; this protects memory, and
    /// is distinct from per-tenant rate limiting.
    pub async fn enqueue(&self, request: &ScheduledRequest) -> Result<(), SchedulerError> {
        let depth = self.global_depth().await?;
        if depth >= self.max_depth {
            metrics::REJECTIONS
                .with_label_values(&["capacity_exhausted"])
                .inc();
            tracing::warn!(
                request_id = %request.request_id,
                depth,
                max_depth = self.max_depth,
                "rejecting admission, global queue at capacity"
            );
            return Err(SchedulerError::CapacityExhausted);
        }
        if depth >= self.max_depth * 4 / 5 {
            tracing::warn!(depth, max_depth = self.max_depth, "queue approaching capacity");
        }

        let member = serde_json::to_string(request)
            .map_err(|e| SchedulerError::Store(e.to_string()))?;
        self.store
            .zadd(
                &keys::tier_queue(request.tier),
                member,
                request.priority_score(),
            )
            .await
            .map_err(|e| SchedulerError::Store(e.to_string()))?;

        tracing::debug!(
            request_id = %request.request_id,
            tenant_id = %request.tenant_id,
            tier = %request.tier,
            depth = depth + 1,
            "enqueued"
        );
        Ok(())
    }

    /// Claim up to `max` requests of one tier, FIFO by arrival. Serves the
    /// local buffer first, then claims from the shared set, prefetching into
    /// the buffer while there is room.
    pub async fn dequeue_for_tier(
        &self,
        tier: TenantTier,
        max: usize,
    ) -> Result<Vec<ScheduledRequest>, SchedulerError> {
        let mut out = self.take_local(tier, max);
        if out.len() >= max {
            return Ok(out);
        }

        let set = keys::tier_queue(tier);
        let (min, band_max) = tier_score_range(tier);
        let prefetch_room = {
            let local = self.local.lock();
            self.local_capacity.saturating_sub(local.len())
        };
        let mut wanted = (max - out.len()) + prefetch_room;

        while wanted > 0 {
            let batch = self
                .store
                .zrange_by_score(&set, min, band_max, wanted.min(SCAN_BATCH))
                .await
                .map_err(|e| SchedulerError::Store(e.to_string()))?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();
            for scored in batch {
                // Another replica may win the claim; skip what we lose.
                let claimed = self
                    .store
                    .zrem(&set, &scored.member)
                    .await
                    .map_err(|e| SchedulerError::Store(e.to_string()))?;
                if !claimed {
                    continue;
                }
                let request: ScheduledRequest = serde_json::from_str(&scored.member)
                    .map_err(|e| SchedulerError::Store(e.to_string()))?;
                if out.len() < max {
                    out.push(request);
                } else {
                    self.local.lock().push_back(request);
                }
                wanted = wanted.saturating_sub(1);
            }
            if fetched < SCAN_BATCH.min(wanted.max(1)) {
                break;
            }
        }
        Ok(out)
    }

    /// Return claimed requests to the front of the local buffer, preserving
    /// FIFO, e.g. when the worker pool ran out of free slots mid-batch.
    pub fn requeue_local(&self, requests: Vec<ScheduledRequest>) {
        let mut local = self.local.lock();
        for request in requests.into_iter().rev() {
            local.push_front(request);
        }
    }

    /// Claim every queued request whose deadline has passed, from both the
    /// shared sets and this replica's buffer. Within a tier band entries are
    /// deadline-ordered, so each scan stops at the first live entry.
    pub async fn remove_expired(
        &self,
        now_ms: u64,
    ) -> Result<Vec<ScheduledRequest>, SchedulerError> {
        let mut expired = Vec::new();

        {
            let mut local = self.local.lock();
            let mut keep = VecDeque::with_capacity(local.len());
            for request in local.drain(..) {
                if request.is_expired(now_ms) {
                    expired.push(request);
                } else {
                    keep.push_back(request);
                }
            }
            *local = keep;
        }

        for tier in TenantTier::ALL {
            let set = keys::tier_queue(tier);
            let (min, max) = tier_score_range(tier);
            'scan: loop {
                let batch = self
                    .store
                    .zrange_by_score(&set, min, max, SCAN_BATCH)
                    .await
                    .map_err(|e| SchedulerError::Store(e.to_string()))?;
                if batch.is_empty() {
                    break;
                }
                let mut progressed = false;
                for scored in &batch {
                    let request: ScheduledRequest = serde_json::from_str(&scored.member)
                        .map_err(|e| SchedulerError::Store(e.to_string()))?;
                    if !request.is_expired(now_ms) {
                        break 'scan;
                    }
                    let claimed = self
                        .store
                        .zrem(&set, &scored.member)
                        .await
                        .map_err(|e| SchedulerError::Store(e.to_string()))?;
                    if claimed {
                        expired.push(request);
                        progressed = true;
                    }
                }
                if !progressed && batch.len() < SCAN_BATCH {
                    break;
                }
            }
        }
        Ok(expired)
    }

    /// Push any locally buffered claims back to the shared sets so another
    /// replica can serve them; used during shutdown.
    pub async fn drain_local_to_global(&self) -> Result<usize, SchedulerError> {
        let buffered: Vec<ScheduledRequest> = {
            let mut local = self.local.lock();
            local.drain(..).collect()
        };
        let drained = buffered.len();
        for request in buffered {
            let member = serde_json::to_string(&request)
                .map_err(|e| SchedulerError::Store(e.to_string()))?;
            self.store
                .zadd(&keys::tier_queue(request.tier), member, request.priority_score())
                .await
                .map_err(|e| SchedulerError::Store(e.to_string()))?;
        }
        Ok(drained)
    }

    fn take_local(&self, tier: TenantTier, max: usize) -> Vec<ScheduledRequest> {
        let mut local = self.local.lock();
        let mut out = Vec::new();
        let mut keep = VecDeque::with_capacity(local.len());
        for request in local.drain(..) {
            if request.tier == tier && out.len() < max {
                out.push(request);
            } else {
                keep.push_back(request);
            }
        }
        *local = keep;
        out
    }

    async fn store_zcard(&self, set: &str) -> Result<usize, SchedulerError> {
        self.store
            .zcard(set)
            .await
            .map_err(|e| SchedulerError::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue(max_depth: usize) -> GlobalQueue {
        GlobalQueue::new(Arc::new(MemoryStore::new()), max_depth, 100)
    }

    fn request(tenant: &str, tier: TenantTier, arrival_ms: u64) -> ScheduledRequest {
        ScheduledRequest::new(
            tenant,
            tier,
            serde_json::json!({}),
            arrival_ms,
            1_000,
            "replica-test",
        )
    }

    #[tokio::test]
    async fn test_fifo_within_tier() {
        let queue = queue(100);
        let a = request("a", TenantTier::Starter, 10);
        let b = request("b", TenantTier::Starter, 11);
        let c = request("c", TenantTier::Starter, 12);
        // Enqueue out of arrival order.
        queue.enqueue(&b).await.unwrap();
        queue.enqueue(&c).await.unwrap();
        queue.enqueue(&a).await.unwrap();

        let claimed = queue.dequeue_for_tier(TenantTier::Starter, 3).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![a.request_id, b.request_id, c.request_id]);
    }

    #[tokio::test]
    async fn test_tiers_are_claimed_independently() {
        let queue = queue(100);
        let free = request("f", TenantTier::Free, 1);
        let ent = request("e", TenantTier::Enterprise, 2);
        queue.enqueue(&free).await.unwrap();
        queue.enqueue(&ent).await.unwrap();

        let claimed = queue.dequeue_for_tier(TenantTier::Free, 4).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].request_id, free.request_id);

        let depths = queue.depths().await.unwrap();
        assert_eq!(depths[TenantTier::Enterprise], 1);
        assert_eq!(depths[TenantTier::Free], 0);
    }

    #[tokio::test]
    async fn test_capacity_ceiling() {
        let queue = queue(2);
        queue
            .enqueue(&request("a", TenantTier::Free, 1))
            .await
            .unwrap();
        queue
            .enqueue(&request("b", TenantTier::Enterprise, 2))
            .await
            .unwrap();

        let err = queue.enqueue(&request("c", TenantTier::Enterprise, 3)).await;
        assert!(matches!(err, Err(SchedulerError::CapacityExhausted)));
    }

    #[tokio::test]
    async fn test_remove_expired_claims_only_past_deadline() {
        let queue = queue(100);
        let dead = request("a", TenantTier::Free, 100); // deadline 1100
        let live = request("b", TenantTier::Free, 5_000); // deadline 6000
        queue.enqueue(&dead).await.unwrap();
        queue.enqueue(&live).await.unwrap();

        let expired = queue.remove_expired(2_000).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, dead.request_id);

        // The live request is still claimable exactly once.
        let claimed = queue.dequeue_for_tier(TenantTier::Free, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].request_id, live.request_id);
        let empty = queue.remove_expired(10_000).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_local_preserves_fifo() {
        let queue = queue(100);
        let a = request("a", TenantTier::Professional, 1);
        let b = request("b", TenantTier::Professional, 2);
        queue.enqueue(&a).await.unwrap();
        queue.enqueue(&b).await.unwrap();

        let claimed = queue
            .dequeue_for_tier(TenantTier::Professional, 2)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        queue.requeue_local(claimed);
        assert_eq!(queue.local_depth(), 2);

        let again = queue
            .dequeue_for_tier(TenantTier::Professional, 2)
            .await
            .unwrap();
        let ids: Vec<_> = again.iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![a.request_id, b.request_id]);
    }

    #[tokio::test]
    async fn test_two_replicas_never_claim_the_same_request() {
        // Two queue frontends over one shared store model two replicas.
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let q1 = GlobalQueue::new(store.clone(), 100, 10);
        let q2 = GlobalQueue::new(store.clone(), 100, 10);

        for i in 0..6 {
            q1.enqueue(&request("t", TenantTier::Starter, i)).await.unwrap();
        }

        let c1 = q1.dequeue_for_tier(TenantTier::Starter, 3).await.unwrap();
        let c2 = q2.dequeue_for_tier(TenantTier::Starter, 3).await.unwrap();

        let mut all: Vec<_> = c1.iter().chain(c2.iter()).map(|r| r.request_id).collect();
        // Claims from the buffers too; drain both to make the count total.
        all.extend(
            q1.dequeue_for_tier(TenantTier::Starter, 10)
                .await
                .unwrap()
                .iter()
                .map(|r| r.request_id),
        );
        all.extend(
            q2.dequeue_for_tier(TenantTier::Starter, 10)
                .await
                .unwrap()
                .iter()
                .map(|r| r.request_id),
        );
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 6, "every request claimed exactly once");
    }
}
