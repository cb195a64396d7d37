// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Noisy-neighbor feedback control.
//!
//! The fair-share allocator keeps tiers honest against each other; this
//! governor keeps tenants honest within a tier, since one tenant could
//! otherwise dominate its tier's whole credit allocation. It tracks each
//! tenant's share of dispatches over a sliding window and, when a tenant
//! holds more than its tier's hard cap for the sustain period, asks the
//! token bucket limiter to apply a temporary rate penalty. The penalty is
//! lifted once the tenant stays under the cap for the cooldown period.
//!
//! Throttling only slows admission; queued requests are never dropped by
//! the governor.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::tier::{TenantTier, TierMap};

/// Per-tenant control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    Normal,
    Throttled,
}

/// Instruction for the limiter, produced by a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorAction {
    Throttle {
        tenant_id: String,
        tier: TenantTier,
        penalty_factor: f64,
    },
    Restore {
        tenant_id: String,
        tier: TenantTier,
    },
}

#[derive(Debug)]
struct TenantWatch {
    tier: TenantTier,
    state: TenantState,
    /// Start of the current continuous over-cap stretch.
    over_cap_since_ms: Option<u64>,
    /// Start of the current continuous under-cap stretch while throttled.
    under_cap_since_ms: Option<u64>,
}

struct Window {
    /// Dispatch events `(at_ms, tenant_id)`, oldest first.
    events: VecDeque<(u64, String)>,
    per_tenant: HashMap<String, usize>,
}

impl Window {
    fn record(&mut self, tenant_id: &str, at_ms: u64) {
        self.events.push_back((at_ms, tenant_id.to_string()));
        *self.per_tenant.entry(tenant_id.to_string()).or_insert(0) += 1;
    }

    fn prune(&mut self, horizon_ms: u64) {
        while let Some((at_ms, tenant_id)) = self.events.front() {
            if *at_ms >= horizon_ms {
                break;
            }
            if let Some(count) = self.per_tenant.get_mut(tenant_id) {
                *count -= 1;
                if *count == 0 {
                    self.per_tenant.remove(tenant_id);
                }
            }
            self.events.pop_front();
        }
    }
}

pub struct NoisyNeighborGovernor {
    window_ms: u64,
    sustain_ms: u64,
    cooldown_ms: u64,
    penalty_factor: f64,
    hard_caps: TierMap<u32>,
    window: Mutex<Window>,
    watches: Mutex<HashMap<String, TenantWatch>>,
}

impl NoisyNeighborGovernor {
    pub fn new(
        window_ms: u64,
        sustain_ms: u64,
        cooldown_ms: u64,
        penalty_factor: f64,
        hard_caps: TierMap<u32>,
    ) -> Self {
        Self {
            window_ms,
            sustain_ms,
            cooldown_ms,
            penalty_factor,
            hard_caps,
            window: Mutex::new(Window {
                events: VecDeque::new(),
                per_tenant: HashMap::new(),
            }),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Record one dispatch for consumption accounting.
    pub fn record_dispatch(&self, tenant_id: &str, tier: TenantTier, now_ms: u64) {
        let mut window = self.window.lock();
        window.record(tenant_id, now_ms);
        window.prune(now_ms.saturating_sub(self.window_ms));
        drop(window);

        self.watches
            .lock()
            .entry(tenant_id.to_string())
            .or_insert(TenantWatch {
                tier,
                state: TenantState::Normal,
                over_cap_since_ms: None,
                under_cap_since_ms: None,
            })
            .tier = tier;
    }

    /// A tenant's share of all dispatches in the current window, 0..1.
    pub fn noisy_neighbor_score(&self, tenant_id: &str, now_ms: u64) -> f64 {
        let mut window = self.window.lock();
        window.prune(now_ms.saturating_sub(self.window_ms));
        let total = window.events.len();
        if total == 0 {
            return 0.0;
        }
        window
            .per_tenant
            .get(tenant_id)
            .map(|count| *count as f64 / total as f64)
            .unwrap_or(0.0)
    }

    pub fn state(&self, tenant_id: &str) -> TenantState {
        self.watches
            .lock()
            .get(tenant_id)
            .map(|w| w.state)
            .unwrap_or(TenantState::Normal)
    }

    /// Advance every tenant's state machine and emit limiter actions for the
    /// transitions that fired. Pure function of recorded events and `now_ms`.
    pub fn scan(&self, now_ms: u64) -> Vec<GovernorAction> {
        let shares: HashMap<String, f64> = {
            let mut window = self.window.lock();
            window.prune(now_ms.saturating_sub(self.window_ms));
            let total = window.events.len();
            if total == 0 {
                HashMap::new()
            } else {
                window
                    .per_tenant
                    .iter()
                    .map(|(tenant, count)| (tenant.clone(), *count as f64 / total as f64))
                    .collect()
            }
        };

        let mut actions = Vec::new();
        let mut watches = self.watches.lock();
        for (tenant_id, watch) in watches.iter_mut() {
            let share = shares.get(tenant_id).copied().unwrap_or(0.0);
            let cap = self.hard_caps[watch.tier] as f64 / 100.0;
            let over = share > cap;

            match watch.state {
                TenantState::Normal => {
                    if over {
                        let since = *watch.over_cap_since_ms.get_or_insert(now_ms);
                        if now_ms.saturating_sub(since) >= self.sustain_ms {
                            watch.state = TenantState::Throttled;
                            watch.over_cap_since_ms = None;
                            watch.under_cap_since_ms = None;
                            tracing::warn!(
                                %tenant_id,
                                tier = %watch.tier,
                                share,
                                cap,
                                "tenant exceeded its hard cap, throttling"
                            );
                            actions.push(GovernorAction::Throttle {
                                tenant_id: tenant_id.clone(),
                                tier: watch.tier,
                                penalty_factor: self.penalty_factor,
                            });
                        }
                    } else {
                        watch.over_cap_since_ms = None;
                    }
                }
                TenantState::Throttled => {
                    if over {
                        watch.under_cap_since_ms = None;
                    } else {
                        let since = *watch.under_cap_since_ms.get_or_insert(now_ms);
                        if now_ms.saturating_sub(since) >= self.cooldown_ms {
                            watch.state = TenantState::Normal;
                            watch.over_cap_since_ms = None;
                            watch.under_cap_since_ms = None;
                            tracing::info!(
                                %tenant_id,
                                tier = %watch.tier,
                                share,
                                "tenant back under its hard cap, restoring rate"
                            );
                            actions.push(GovernorAction::Restore {
                                tenant_id: tenant_id.clone(),
                                tier: watch.tier,
                            });
                        }
                    }
                }
            }
        }
        actions
    }

    /// Number of currently throttled tenants, for the metrics gauge.
    pub fn throttled_count(&self) -> usize {
        self.watches
            .lock()
            .values()
            .filter(|w| w.state == TenantState::Throttled)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> NoisyNeighborGovernor {
        // window 10s, sustain 2s, cooldown 3s, penalty 0.5
        NoisyNeighborGovernor::new(10_000, 2_000, 3_000, 0.5, TierMap::new([60, 40, 25, 20]))
    }

    fn flood(gov: &NoisyNeighborGovernor, tenant: &str, tier: TenantTier, from_ms: u64, n: u64) {
        for i in 0..n {
            gov.record_dispatch(tenant, tier, from_ms + i);
        }
    }

    #[test]
    fn test_throttles_after_sustained_overuse() {
        let gov = governor();
        // "hog" takes ~90% of dispatches against a 60% cap.
        flood(&gov, "hog", TenantTier::Enterprise, 1_000, 90);
        flood(&gov, "quiet", TenantTier::Enterprise, 1_000, 10);

        // Over cap, but not yet for the sustain period.
        assert!(gov.scan(1_500).is_empty());
        assert_eq!(gov.state("hog"), TenantState::Normal);

        // Still over cap after the sustain period: throttle fires once.
        let actions = gov.scan(3_600);
        assert_eq!(
            actions,
            vec![GovernorAction::Throttle {
                tenant_id: "hog".into(),
                tier: TenantTier::Enterprise,
                penalty_factor: 0.5,
            }]
        );
        assert_eq!(gov.state("hog"), TenantState::Throttled);
        assert_eq!(gov.state("quiet"), TenantState::Normal);
        assert_eq!(gov.throttled_count(), 1);

        // No repeated throttle action while already throttled.
        assert!(gov.scan(4_000).is_empty());
    }

    #[test]
    fn test_restores_after_cooldown() {
        let gov = governor();
        flood(&gov, "hog", TenantTier::Professional, 1_000, 100);
        gov.scan(1_000);
        let actions = gov.scan(3_100);
        assert_eq!(actions.len(), 1);
        assert_eq!(gov.state("hog"), TenantState::Throttled);

        // Window slides past the burst; the share drops to zero. Restore
        // only fires after the full cooldown under the cap.
        let quiet_start = 20_000;
        assert!(gov.scan(quiet_start).is_empty());
        assert!(gov.scan(quiet_start + 2_000).is_empty());
        let actions = gov.scan(quiet_start + 3_000);
        assert_eq!(
            actions,
            vec![GovernorAction::Restore {
                tenant_id: "hog".into(),
                tier: TenantTier::Professional,
            }]
        );
        assert_eq!(gov.state("hog"), TenantState::Normal);
    }

    #[test]
    fn test_brief_spike_does_not_throttle() {
        let gov = governor();
        flood(&gov, "spiky", TenantTier::Free, 1_000, 50);

        // Over cap at first scan, then the window slides past the spike
        // before the sustain period elapses.
        assert!(gov.scan(1_200).is_empty());
        assert!(gov.scan(12_500).is_empty());
        assert_eq!(gov.state("spiky"), TenantState::Normal);
    }

    #[test]
    fn test_score_reflects_share_of_window() {
        let gov = governor();
        flood(&gov, "a", TenantTier::Starter, 1_000, 30);
        flood(&gov, "b", TenantTier::Starter, 1_000, 10);

        let score = gov.noisy_neighbor_score("a", 2_000);
        assert!((score - 0.75).abs() < 1e-9);
        assert_eq!(gov.noisy_neighbor_score("unknown", 2_000), 0.0);

        // Everything ages out of the window.
        assert_eq!(gov.noisy_neighbor_score("a", 60_000), 0.0);
    }
}
