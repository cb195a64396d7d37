// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared-state store abstraction.
//!
//! Token bucket state and the global priority queue are the only mutable
//! state shared across replicas. This trait names the operations the
//! scheduler needs from whatever backs them (a Redis-class cache, a NATS KV
//! bucket, ...): revisioned compare-and-swap on single keys, sorted-set
//! insert/remove/range, and an append-only list for the DLQ. Nothing here
//! requires a lock spanning tenants or replicas; `zrem` returning `true` is
//! the atomic cross-replica claim primitive.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and
//! single-replica deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;

/// Store key namespaces.
pub mod keys {
    use crate::tier::TenantTier;

    pub const QUEUE_ROOT: &str = "v1/queue";
    pub const DLQ_LIST: &str = "v1/queue/dlq";

    /// Sorted set holding one tier's queued requests.
    pub fn tier_queue(tier: TenantTier) -> String {
        format!("{}/tier/{}", QUEUE_ROOT, tier.ordinal())
    }

    /// Token bucket state for one tenant.
    pub fn token_bucket(tenant_id: &str) -> String {
        format!("v1/bucket/{tenant_id}")
    }
}

/// Monotonic per-key revision; 0 means "key does not exist yet".
pub type Revision = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub data: Vec<u8>,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a key with its current revision.
    async fn kv_get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Compare-and-swap write. `expected_revision` 0 creates the key only
    /// if absent. Returns `false` when the revision no longer matches.
    async fn kv_put(&self, key: &str, value: Vec<u8>, expected_revision: Revision) -> Result<bool>;

    /// Insert (or re-score) a member in a sorted set.
    async fn zadd(&self, set: &str, member: String, score: f64) -> Result<()>;

    /// Members with score in `[min, max]`, ascending, at most `limit`.
    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>>;

    /// Remove a member. `true` means this caller won the removal; exactly
    /// one concurrent caller observes `true` for a given member.
    async fn zrem(&self, set: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, set: &str) -> Result<usize>;

    /// Append to a list (DLQ).
    async fn rpush(&self, list: &str, value: Vec<u8>) -> Result<()>;

    /// Read `count` list entries starting at `start`.
    async fn lrange(&self, list: &str, start: usize, count: usize) -> Result<Vec<Vec<u8>>>;

    async fn llen(&self, list: &str) -> Result<usize>;
}

/// One sorted set: score-ordered index plus member lookup for removal.
#[derive(Default)]
struct SortedSet {
    // f64 scores here are non-negative, so the raw bit pattern preserves
    // their ordering and can key a BTreeMap.
    by_score: BTreeMap<(u64, String), f64>,
    by_member: HashMap<String, f64>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: f64) {
        if let Some(old) = self.by_member.insert(member.clone(), score) {
            self.by_score.remove(&(old.to_bits(), member.clone()));
        }
        self.by_score.insert((score.to_bits(), member), score);
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => {
                self.by_score.remove(&(score.to_bits(), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range(&self, min: f64, max: f64, limit: usize) -> Vec<ScoredMember> {
        self.by_score
            .range((min.to_bits(), String::new())..)
            .take_while(|((_, _), score)| **score <= max)
            .take(limit)
            .map(|((_, member), score)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.by_member.len()
    }
}

/// In-process [`SharedStore`]. Interior mutability only; safe to share via
/// `Arc` between every component of a replica and between replicas in tests.
#[derive(Default)]
pub struct MemoryStore {
    kv: Mutex<HashMap<String, (Vec<u8>, Revision)>>,
    sets: Mutex<HashMap<String, SortedSet>>,
    lists: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn kv_get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let kv = self.kv.lock();
        Ok(kv.get(key).map(|(data, revision)| VersionedValue {
            data: data.clone(),
            revision: *revision,
        }))
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>, expected_revision: Revision) -> Result<bool> {
        let mut kv = self.kv.lock();
        let current = kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_revision {
            return Ok(false);
        }
        kv.insert(key.to_string(), (value, current + 1));
        Ok(true)
    }

    async fn zadd(&self, set: &str, member: String, score: f64) -> Result<()> {
        let mut sets = self.sets.lock();
        sets.entry(set.to_string()).or_default().insert(member, score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>> {
        let sets = self.sets.lock();
        Ok(sets
            .get(set)
            .map(|s| s.range(min, max, limit))
            .unwrap_or_default())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        let mut sets = self.sets.lock();
        Ok(sets.get_mut(set).map(|s| s.remove(member)).unwrap_or(false))
    }

    async fn zcard(&self, set: &str) -> Result<usize> {
        let sets = self.sets.lock();
        Ok(sets.get(set).map(SortedSet::len).unwrap_or(0))
    }

    async fn rpush(&self, list: &str, value: Vec<u8>) -> Result<()> {
        let mut lists = self.lists.lock();
        lists.entry(list.to_string()).or_default().push(value);
        Ok(())
    }

    async fn lrange(&self, list: &str, start: usize, count: usize) -> Result<Vec<Vec<u8>>> {
        let lists = self.lists.lock();
        Ok(lists
            .get(list)
            .map(|l| l.iter().skip(start).take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn llen(&self, list: &str) -> Result<usize> {
        let lists = self.lists.lock();
        Ok(lists.get(list).map(Vec::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_cas_create_and_conflict() {
        let store = MemoryStore::new();

        // Create succeeds only with revision 0.
        assert!(store.kv_put("k", b"v1".to_vec(), 0).await.unwrap());
        assert!(!store.kv_put("k", b"v2".to_vec(), 0).await.unwrap());

        let current = store.kv_get("k").await.unwrap().unwrap();
        assert_eq!(current.data, b"v1");
        assert_eq!(current.revision, 1);

        // Stale revision loses, current revision wins.
        assert!(!store.kv_put("k", b"v2".to_vec(), 7).await.unwrap());
        assert!(store.kv_put("k", b"v2".to_vec(), 1).await.unwrap());
        assert_eq!(store.kv_get("k").await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_zset_ordering_and_claim() {
        let store = MemoryStore::new();
        store.zadd("s", "b".into(), 2.0).await.unwrap();
        store.zadd("s", "a".into(), 1.0).await.unwrap();
        store.zadd("s", "c".into(), 3.0).await.unwrap();

        let all = store.zrange_by_score("s", 0.0, 10.0, 10).await.unwrap();
        let members: Vec<_> = all.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);

        let bounded = store.zrange_by_score("s", 2.0, 2.5, 10).await.unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].member, "b");

        // Exactly one removal claims the member.
        assert!(store.zrem("s", "b").await.unwrap());
        assert!(!store.zrem("s", "b").await.unwrap());
        assert_eq!(store.zcard("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_append_only() {
        let store = MemoryStore::new();
        store.rpush("l", b"one".to_vec()).await.unwrap();
        store.rpush("l", b"two".to_vec()).await.unwrap();

        assert_eq!(store.llen("l").await.unwrap(), 2);
        let tail = store.lrange("l", 1, 10).await.unwrap();
        assert_eq!(tail, vec![b"two".to_vec()]);
    }
}
