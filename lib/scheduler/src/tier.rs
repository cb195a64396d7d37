// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tenant tiers and dense per-tier storage.
//!
//! Tiers form a closed set with an explicit ordinal; lower ordinal is served
//! first within its allocated credits. All ordering is done on the
//! `(ordinal, arrival)` tuple so there is no dynamic dispatch on priority.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// Tenant subscription tier. Immutable for the lifetime of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TenantTier {
    Enterprise = 0,
    Professional = 1,
    Starter = 2,
    Free = 3,
}

impl TenantTier {
    /// All tiers in dispatch-priority order (lowest ordinal first).
    pub const ALL: [TenantTier; 4] = [
        TenantTier::Enterprise,
        TenantTier::Professional,
        TenantTier::Starter,
        TenantTier::Free,
    ];

    pub const COUNT: usize = 4;

    /// Priority ordinal; lower is served first within its credit allocation.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn from_ordinal(ordinal: usize) -> Option<TenantTier> {
        Self::ALL.get(ordinal).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantTier::Enterprise => "enterprise",
            TenantTier::Professional => "professional",
            TenantTier::Starter => "starter",
            TenantTier::Free => "free",
        }
    }
}

impl fmt::Display for TenantTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dense per-tier storage keyed by tier ordinal.
///
/// Used on hot paths (queue depths, credit ledgers) where a `HashMap` keyed
/// by tier would be wasteful.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierMap<T>([T; TenantTier::COUNT]);

impl<T> TierMap<T> {
    pub fn new(values: [T; TenantTier::COUNT]) -> Self {
        Self(values)
    }

    /// Build a map by evaluating `f` for each tier in ordinal order.
    pub fn from_fn(mut f: impl FnMut(TenantTier) -> T) -> Self {
        Self(TenantTier::ALL.map(&mut f))
    }

    pub fn get(&self, tier: TenantTier) -> &T {
        &self.0[tier.ordinal()]
    }

    pub fn get_mut(&mut self, tier: TenantTier) -> &mut T {
        &mut self.0[tier.ordinal()]
    }

    /// Iterate `(tier, value)` pairs in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = (TenantTier, &T)> {
        TenantTier::ALL.iter().copied().zip(self.0.iter())
    }

    pub fn map<U>(&self, mut f: impl FnMut(TenantTier, &T) -> U) -> TierMap<U> {
        TierMap(TenantTier::ALL.map(|tier| f(tier, self.get(tier))))
    }
}

impl<T> Index<TenantTier> for TierMap<T> {
    type Output = T;

    fn index(&self, tier: TenantTier) -> &T {
        self.get(tier)
    }
}

impl<T> IndexMut<TenantTier> for TierMap<T> {
    fn index_mut(&mut self, tier: TenantTier) -> &mut T {
        self.get_mut(tier)
    }
}

/// Named-field wire form of a [`TierMap`]; keeps config files readable
/// (`[tiers.enterprise]` rather than a positional array).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierMapRepr<T> {
    pub enterprise: T,
    pub professional: T,
    pub starter: T,
    pub free: T,
}

impl<T> From<TierMapRepr<T>> for TierMap<T> {
    fn from(repr: TierMapRepr<T>) -> Self {
        TierMap::new([repr.enterprise, repr.professional, repr.starter, repr.free])
    }
}

impl<T: Clone> From<TierMap<T>> for TierMapRepr<T> {
    fn from(map: TierMap<T>) -> Self {
        TierMapRepr {
            enterprise: map[TenantTier::Enterprise].clone(),
            professional: map[TenantTier::Professional].clone(),
            starter: map[TenantTier::Starter].clone(),
            free: map[TenantTier::Free].clone(),
        }
    }
}

impl<T: Serialize + Clone> Serialize for TierMap<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TierMapRepr::from(self.clone()).serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for TierMap<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(TierMapRepr::deserialize(deserializer)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_roundtrip() {
        for tier in TenantTier::ALL {
            assert_eq!(TenantTier::from_ordinal(tier.ordinal()), Some(tier));
        }
        assert_eq!(TenantTier::from_ordinal(4), None);
    }

    #[test]
    fn test_priority_order() {
        assert!(TenantTier::Enterprise < TenantTier::Professional);
        assert!(TenantTier::Professional < TenantTier::Starter);
        assert!(TenantTier::Starter < TenantTier::Free);
    }

    #[test]
    fn test_tier_map_indexing() {
        let mut map = TierMap::from_fn(|tier| tier.ordinal() * 10);
        assert_eq!(map[TenantTier::Free], 30);

        map[TenantTier::Starter] = 99;
        assert_eq!(map[TenantTier::Starter], 99);

        let tiers: Vec<_> = map.iter().map(|(tier, _)| tier).collect();
        assert_eq!(tiers, TenantTier::ALL.to_vec());
    }

    #[test]
    fn test_tier_map_named_fields() {
        let map = TierMap::from_fn(|tier| tier.ordinal() as u32);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["enterprise"], 0);
        assert_eq!(json["free"], 3);

        let back: TierMap<u32> = serde_json::from_value(json).unwrap();
        assert_eq!(back, map);
    }
}
