//! Metrics Types

use serde::{Deserialize, Serialize};

/// Counter values served by the `/stats` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sessions_total: u64,
    pub active_sessions: i64,
    pub upstream_connect_failures: u64,
    pub bytes_miner_to_pool: u64,
    pub bytes_pool_to_miner: u64,
}
