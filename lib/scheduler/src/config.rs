// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler configuration.
//!
//! Loaded once at startup, layered in priority order:
//!
//! 1. `TSCHED_`-prefixed environment variables (highest priority).
//! 2. Optional TOML file pointed to by `TSCHED_CONFIG_PATH`.
//! 3. Built-in defaults.
//!
//! All durations are plain millisecond fields so the same numbers flow
//! unchanged through config files, the shared store, and the pure policy
//! functions that take `now_ms` arguments.

use std::time::Duration;

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::tier::{TenantTier, TierMap};

/// Environment variable holding an optional TOML config path.
pub const CONFIG_PATH_ENV: &str = "TSCHED_CONFIG_PATH";

/// Prefix for environment variable overrides, e.g. `TSCHED_WORKER_POOL_SIZE=16`.
pub const ENV_PREFIX: &str = "TSCHED_";

/// Per-tier policy: fair share, noisy-neighbor ceiling, and admission rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TierConfig {
    /// Target percentage of dispatch capacity under contention.
    #[validate(range(min = 0, max = 100))]
    pub fair_share_percent: u32,

    /// Maximum percentage of capacity any single tenant of this tier may
    /// consume, regardless of idle capacity elsewhere. Must be >= the fair
    /// share.
    #[validate(range(min = 1, max = 100))]
    pub hard_cap_percent: u32,

    /// Token bucket refill rate in tokens (requests) per second.
    #[validate(range(min = 0.001))]
    pub sustained_rate: f64,

    /// Token bucket ceiling; the largest instantaneous burst admitted.
    #[validate(range(min = 1.0))]
    pub burst_capacity: f64,
}

impl TierConfig {
    pub fn new(
        fair_share_percent: u32,
        hard_cap_percent: u32,
        sustained_rate: f64,
        burst_capacity: f64,
    ) -> Self {
        Self {
            fair_share_percent,
            hard_cap_percent,
            sustained_rate,
            burst_capacity,
        }
    }
}

fn default_tiers() -> TierMap<TierConfig> {
    TierMap::new([
        // enterprise
        TierConfig::new(50, 60, 100.0, 200.0),
        // professional
        TierConfig::new(30, 40, 20.0, 40.0),
        // starter
        TierConfig::new(15, 25, 5.0, 10.0),
        // free
        TierConfig::new(5, 20, 1.0, 2.0),
    ])
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize, Validate)]
#[builder(pattern = "owned")]
pub struct SchedulerConfig {
    /// Per-tier shares, caps and admission rates.
    #[builder(default = "default_tiers()")]
    #[serde(default = "default_tiers")]
    pub tiers: TierMap<TierConfig>,

    /// Fixed number of concurrent worker slots per replica. The primary
    /// concurrency bound protecting the downstream pipeline.
    #[builder(default = "10")]
    #[validate(range(min = 1))]
    pub worker_pool_size: usize,

    /// Interval between fair-share allocation ticks.
    #[builder(default = "100")]
    #[validate(range(min = 1))]
    pub allocation_tick_ms: u64,

    /// Maximum time a request may sit queued before it is dead-lettered.
    #[builder(default = "30_000")]
    #[validate(range(min = 1))]
    pub max_queue_wait_ms: u64,

    /// Hard ceiling on global queue depth; admissions beyond it are
    /// rejected with `CapacityExhausted`.
    #[builder(default = "10_000")]
    #[validate(range(min = 1))]
    pub max_queue_depth: usize,

    /// Bound on the replica-local buffer of claimed-but-undispatched work.
    #[builder(default = "100")]
    #[validate(range(min = 1))]
    pub local_buffer_size: usize,

    /// Sliding window over which per-tenant consumption is measured.
    #[builder(default = "60_000")]
    #[validate(range(min = 1))]
    pub governor_window_ms: u64,

    /// Interval between noisy-neighbor scans.
    #[builder(default = "1_000")]
    #[validate(range(min = 1))]
    pub governor_scan_ms: u64,

    /// How long a tenant must stay over its hard cap before throttling.
    #[builder(default = "5_000")]
    pub governor_sustain_ms: u64,

    /// How long a tenant must stay under its hard cap before the throttle
    /// is lifted.
    #[builder(default = "10_000")]
    pub governor_cooldown_ms: u64,

    /// Multiplier applied to a throttled tenant's refill rate.
    #[builder(default = "0.5")]
    #[validate(range(min = 0.01, max = 1.0))]
    pub governor_penalty_factor: f64,

    /// When true (the default), idle-capacity redistribution never grants a
    /// tier more than its hard cap in a single tick, trading throughput for
    /// predictable fairness. When false a lone busy tier may absorb the
    /// whole tick's capacity.
    #[builder(default = "true")]
    pub cap_redistribution: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfigBuilder::default()
            .build()
            .expect("default scheduler config")
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Load from defaults <- optional TOML file <- `TSCHED_` env vars.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(SchedulerConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        let config: SchedulerConfig = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Field-level validation plus the cross-field tier invariants: fair
    /// shares sum to 100 and no tier's hard cap is below its fair share.
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|e| anyhow::anyhow!("invalid scheduler config: {e}"))?;

        let mut share_sum = 0u32;
        for (tier, cfg) in self.tiers.iter() {
            cfg.validate()
                .map_err(|e| anyhow::anyhow!("invalid config for tier {tier}: {e}"))?;
            if cfg.hard_cap_percent < cfg.fair_share_percent {
                anyhow::bail!(
                    "tier {tier}: hard_cap_percent ({}) is below fair_share_percent ({})",
                    cfg.hard_cap_percent,
                    cfg.fair_share_percent
                );
            }
            share_sum += cfg.fair_share_percent;
        }
        if share_sum != 100 {
            anyhow::bail!("fair_share_percent must sum to 100, got {share_sum}");
        }
        Ok(())
    }

    pub fn tier(&self, tier: TenantTier) -> &TierConfig {
        self.tiers.get(tier)
    }

    pub fn allocation_tick(&self) -> Duration {
        Duration::from_millis(self.allocation_tick_ms)
    }

    pub fn governor_scan(&self) -> Duration {
        Duration::from_millis(self.governor_scan_ms)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        config.ensure_valid().unwrap();
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.allocation_tick_ms, 100);
        assert_eq!(config.tier(TenantTier::Enterprise).fair_share_percent, 50);
    }

    #[test]
    fn test_shares_must_sum_to_100() {
        let mut config = SchedulerConfig::default();
        config.tiers[TenantTier::Free].fair_share_percent = 10;
        let err = config.ensure_valid().unwrap_err().to_string();
        assert!(err.contains("sum to 100"), "{err}");
    }

    #[test]
    fn test_hard_cap_must_cover_fair_share() {
        let mut config = SchedulerConfig::default();
        config.tiers[TenantTier::Enterprise].hard_cap_percent = 40;
        let err = config.ensure_valid().unwrap_err().to_string();
        assert!(err.contains("hard_cap_percent"), "{err}");
    }

    #[test]
    fn test_builder_overrides() {
        let config = SchedulerConfig::builder()
            .worker_pool_size(4)
            .allocation_tick_ms(10)
            .build()
            .unwrap();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.allocation_tick(), Duration::from_millis(10));
        config.ensure_valid().unwrap();
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(SchedulerConfig::default())).merge(
            Toml::string(
                r#"
                worker_pool_size = 3
                [tiers.free]
                fair_share_percent = 5
                hard_cap_percent = 30
                sustained_rate = 2.0
                burst_capacity = 4.0
                "#,
            ),
        );
        let config: SchedulerConfig = figment.extract().unwrap();
        assert_eq!(config.worker_pool_size, 3);
        assert_eq!(config.tier(TenantTier::Free).hard_cap_percent, 30);
        config.ensure_valid().unwrap();
    }
}
