// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size worker slot pool.
//!
//! N slots per replica is the primary concurrency bound protecting the
//! downstream pipeline; it is never exceeded. Slots are an explicit table
//! rather than a bare semaphore so occupancy is observable: each slot knows
//! which request holds it and since when. A [`SlotPermit`] releases its
//! slot on drop, so a panicking dispatch task cannot leak capacity.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::metrics;

/// One of the N concurrent execution slots of a replica.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSlot {
    pub slot_id: usize,
    pub occupying_request_id: Option<Uuid>,
    /// Epoch milliseconds when the occupying request acquired the slot.
    pub acquired_at_ms: Option<u64>,
}

impl WorkerSlot {
    fn free(slot_id: usize) -> Self {
        Self {
            slot_id,
            occupying_request_id: None,
            acquired_at_ms: None,
        }
    }

    fn is_free(&self) -> bool {
        self.occupying_request_id.is_none()
    }
}

pub struct WorkerPool {
    slots: Mutex<Vec<WorkerSlot>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new((0..size).map(WorkerSlot::free).collect()),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_free()).count()
    }

    pub fn occupied_slots(&self) -> usize {
        self.size() - self.free_slots()
    }

    /// Snapshot of the slot table for inspection.
    pub fn snapshot(&self) -> Vec<WorkerSlot> {
        self.slots.lock().clone()
    }

    /// Claim a free slot for `request_id`. Returns `None` when all N slots
    /// are occupied. The permit keeps the pool alive and releases on drop.
    pub fn try_acquire(pool: &Arc<Self>, request_id: Uuid, now_ms: u64) -> Option<SlotPermit> {
        let mut slots = pool.slots.lock();
        let slot = slots.iter_mut().find(|s| s.is_free())?;
        slot.occupying_request_id = Some(request_id);
        slot.acquired_at_ms = Some(now_ms);
        let slot_id = slot.slot_id;
        drop(slots);

        metrics::WORKERS_BUSY.set(pool.occupied_slots() as i64);
        Some(SlotPermit {
            pool: Arc::clone(pool),
            slot_id,
        })
    }

    fn release(&self, slot_id: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(slot_id) {
            slot.occupying_request_id = None;
            slot.acquired_at_ms = None;
        }
        drop(slots);
        metrics::WORKERS_BUSY.set(self.occupied_slots() as i64);
    }
}

/// Exclusive hold on one worker slot; releasing is dropping.
pub struct SlotPermit {
    pool: Arc<WorkerPool>,
    slot_id: usize,
}

impl SlotPermit {
    pub fn slot_id(&self) -> usize {
        self.slot_id
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.pool.release(self.slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_never_exceeds_size() {
        let pool = WorkerPool::new(3);
        let permits: Vec<_> = (0..3)
            .map(|_| WorkerPool::try_acquire(&pool, Uuid::new_v4(), 1_000).unwrap())
            .collect();
        assert_eq!(pool.free_slots(), 0);
        assert!(WorkerPool::try_acquire(&pool, Uuid::new_v4(), 1_001).is_none());

        drop(permits);
        assert_eq!(pool.free_slots(), 3);
    }

    #[test]
    fn test_release_frees_specific_slot() {
        let pool = WorkerPool::new(2);
        let req_a = Uuid::new_v4();
        let req_b = Uuid::new_v4();
        let permit_a = WorkerPool::try_acquire(&pool, req_a, 10).unwrap();
        let _permit_b = WorkerPool::try_acquire(&pool, req_b, 11).unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].occupying_request_id, Some(req_a));
        assert_eq!(snapshot[0].acquired_at_ms, Some(10));

        let freed_id = permit_a.slot_id();
        drop(permit_a);
        let snapshot = pool.snapshot();
        assert!(snapshot[freed_id].is_free());
        assert_eq!(snapshot[1].occupying_request_id, Some(req_b));
        assert_eq!(pool.occupied_slots(), 1);
    }
}
