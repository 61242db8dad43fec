//! Connection Management Module
//!
//! Accepts miner connections and dispatches relay sessions.

pub mod manager;

pub use manager::ConnectionManager;
