// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Weighted fair-share credit allocation.
//!
//! Once per tick, each tier is granted a number of dequeue credits out of
//! the tick's worker capacity. The math is a pure function of observed
//! queue depths so it can be tested without timers; the scheduler's tick
//! loop owns the [`TickAllocation`] ledger it produces. Unused credits do
//! not roll over to the next tick.

use crate::config::TierConfig;
use crate::tier::{TenantTier, TierMap};

/// Per-tick credit ledger: what each tier was granted and what it has
/// consumed so far within the tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickAllocation {
    pub tick_ms: u64,
    granted: TierMap<u32>,
    consumed: TierMap<u32>,
}

impl TickAllocation {
    pub fn new(tick_ms: u64, granted: TierMap<u32>) -> Self {
        Self {
            tick_ms,
            granted,
            consumed: TierMap::default(),
        }
    }

    /// Ledger with no credits; used before the first tick fires.
    pub fn empty() -> Self {
        Self::new(0, TierMap::default())
    }

    pub fn granted(&self, tier: TenantTier) -> u32 {
        self.granted[tier]
    }

    pub fn consumed(&self, tier: TenantTier) -> u32 {
        self.consumed[tier]
    }

    pub fn remaining(&self, tier: TenantTier) -> u32 {
        self.granted[tier].saturating_sub(self.consumed[tier])
    }

    /// Spend one credit; `false` when the tier's grant is exhausted.
    pub fn consume(&mut self, tier: TenantTier) -> bool {
        if self.remaining(tier) > 0 {
            self.consumed[tier] += 1;
            true
        } else {
            false
        }
    }
}

/// Compute one tick's per-tier credit grants.
///
/// 1. Base grant: `floor(capacity * fair_share / 100)`, demand-bounded by
///    the tier's backlog; a backlogged tier always gets at least one credit
///    so the lowest tier cannot starve.
/// 2. Leftover capacity (flooring remainders plus shares of idle tiers) is
///    redistributed to backlogged tiers, highest fair share first with the
///    tier rank breaking ties, so outcomes are deterministic.
/// 3. When `cap_redistribution` is set, no tier ever ends the tick granted
///    more than `ceil(capacity * hard_cap / 100)`, even if every other tier
///    is idle.
pub fn compute_allocation(
    depths: &TierMap<usize>,
    capacity: usize,
    tiers: &TierMap<TierConfig>,
    cap_redistribution: bool,
) -> TierMap<u32> {
    let mut granted = TierMap::<u32>::default();
    if capacity == 0 {
        return granted;
    }

    for (tier, config) in tiers.iter() {
        let depth = depths[tier];
        if depth == 0 {
            continue;
        }
        let base = capacity * config.fair_share_percent as usize / 100;
        // Demand-bounded, with the no-starvation floor.
        granted[tier] = base.clamp(1, depth) as u32;
    }

    let spent: usize = TenantTier::ALL.iter().map(|t| granted[*t] as usize).sum();
    let mut leftover = capacity.saturating_sub(spent);
    if leftover == 0 {
        return granted;
    }

    // Redistribution order: highest fair share first, then tier rank.
    let mut order = TenantTier::ALL;
    order.sort_by(|a, b| {
        tiers[*b]
            .fair_share_percent
            .cmp(&tiers[*a].fair_share_percent)
            .then(a.ordinal().cmp(&b.ordinal()))
    });

    for tier in order {
        if leftover == 0 {
            break;
        }
        let depth = depths[tier];
        if depth == 0 {
            continue;
        }
        let ceiling = if cap_redistribution {
            // ceil(capacity * hard_cap / 100)
            (capacity * tiers[tier].hard_cap_percent as usize).div_ceil(100)
        } else {
            capacity
        };
        let current = granted[tier] as usize;
        let headroom = ceiling.saturating_sub(current).min(depth.saturating_sub(current));
        let extra = headroom.min(leftover);
        granted[tier] = (current + extra) as u32;
        leftover -= extra;
    }

    granted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(shares: [u32; 4], caps: [u32; 4]) -> TierMap<TierConfig> {
        TierMap::new([
            TierConfig::new(shares[0], caps[0], 100.0, 200.0),
            TierConfig::new(shares[1], caps[1], 20.0, 40.0),
            TierConfig::new(shares[2], caps[2], 5.0, 10.0),
            TierConfig::new(shares[3], caps[3], 1.0, 2.0),
        ])
    }

    fn deep_backlog() -> TierMap<usize> {
        TierMap::new([1_000, 1_000, 1_000, 1_000])
    }

    #[test]
    fn test_exact_shares_under_full_backlog() {
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let granted = compute_allocation(&deep_backlog(), 20, &tiers, true);
        assert_eq!(granted[TenantTier::Enterprise], 10);
        assert_eq!(granted[TenantTier::Professional], 6);
        assert_eq!(granted[TenantTier::Starter], 3);
        assert_eq!(granted[TenantTier::Free], 1);
    }

    #[test]
    fn test_no_starvation_floor() {
        // 5% of 10 floors to 0; the backlogged Free tier still gets 1.
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let granted = compute_allocation(&deep_backlog(), 10, &tiers, true);
        assert!(granted[TenantTier::Free] >= 1);
        for tier in TenantTier::ALL {
            assert!(granted[tier] >= 1, "{tier} starved");
        }
    }

    #[test]
    fn test_empty_tiers_get_nothing() {
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let depths = TierMap::new([10, 0, 0, 10]);
        let granted = compute_allocation(&depths, 20, &tiers, true);
        assert_eq!(granted[TenantTier::Professional], 0);
        assert_eq!(granted[TenantTier::Starter], 0);
        assert!(granted[TenantTier::Enterprise] >= 10 * 50 / 100 as u32);
        assert!(granted[TenantTier::Free] >= 1);
    }

    #[test]
    fn test_redistribution_bounded_by_hard_cap() {
        // Only Enterprise is backlogged; with the cap on it absorbs idle
        // capacity up to 60%, never the whole tick.
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let depths = TierMap::new([1_000, 0, 0, 0]);
        let granted = compute_allocation(&depths, 20, &tiers, true);
        assert_eq!(granted[TenantTier::Enterprise], 12); // ceil(20 * 60%)
        assert_eq!(granted[TenantTier::Professional], 0);
    }

    #[test]
    fn test_redistribution_uncapped_when_disabled() {
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let depths = TierMap::new([1_000, 0, 0, 0]);
        let granted = compute_allocation(&depths, 20, &tiers, false);
        assert_eq!(granted[TenantTier::Enterprise], 20);
    }

    #[test]
    fn test_redistribution_is_demand_bounded() {
        // Free has one queued request and cannot absorb more than it.
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let depths = TierMap::new([0, 0, 0, 1]);
        let granted = compute_allocation(&depths, 20, &tiers, true);
        assert_eq!(granted[TenantTier::Free], 1);
    }

    #[test]
    fn test_redistribution_order_is_deterministic() {
        // Equal shares: the tie breaks by tier rank, so Professional (lower
        // ordinal) takes the leftover before Starter.
        let tiers = tiers([40, 25, 25, 10], [100, 30, 30, 20]);
        let depths = TierMap::new([0, 1_000, 1_000, 0]);
        let granted = compute_allocation(&depths, 20, &tiers, true);
        // Base: 5 each; leftover 10. Professional fills to its 30% cap
        // (ceil(6)) first, then Starter.
        assert_eq!(granted[TenantTier::Professional], 6);
        assert_eq!(granted[TenantTier::Starter], 6);
    }

    #[test]
    fn test_zero_capacity_grants_nothing() {
        let tiers = tiers([50, 30, 15, 5], [60, 40, 25, 20]);
        let granted = compute_allocation(&deep_backlog(), 0, &tiers, true);
        for tier in TenantTier::ALL {
            assert_eq!(granted[tier], 0);
        }
    }

    #[test]
    fn test_ledger_consume_and_remaining() {
        let mut ledger = TickAllocation::new(100, TierMap::new([2, 0, 0, 1]));
        assert_eq!(ledger.remaining(TenantTier::Enterprise), 2);
        assert!(ledger.consume(TenantTier::Enterprise));
        assert!(ledger.consume(TenantTier::Enterprise));
        assert!(!ledger.consume(TenantTier::Enterprise));
        assert_eq!(ledger.consumed(TenantTier::Enterprise), 2);
        assert!(!ledger.consume(TenantTier::Professional));
        assert!(ledger.consume(TenantTier::Free));
    }
}
