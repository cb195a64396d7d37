// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Milliseconds since the Unix epoch. All timestamps that cross the shared
/// store use this clock so every policy function is a plain function of
/// `(state, now_ms)`.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Replica identity, unique per process, e.g. `replica-3f09c1d2`.
pub fn short_replica_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("replica-{}", &id[..8])
}
