//! Data Relay Module
//!
//! Handles bidirectional data relay between a miner and the pool.

pub mod engine;
pub mod pump;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use engine::RelayEngine;
pub use pump::{pump, PumpSettings};
pub use session::{close_quietly, CloseReason, RelaySession, SessionStats};

/// Which way a pump moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    MinerToPool,
    PoolToMiner,
}

impl Direction {
    /// Label used for metric series
    pub fn as_label(&self) -> &'static str {
        match self {
            Direction::MinerToPool => "miner_to_pool",
            Direction::PoolToMiner => "pool_to_miner",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::MinerToPool => f.write_str("miner -> pool"),
            Direction::PoolToMiner => f.write_str("pool -> miner"),
        }
    }
}
