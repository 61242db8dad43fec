//! Relay Session
//!
//! Pairs one miner connection with one pool connection. Both directions run
//! as separate tasks; whichever finishes first flips a shared close signal,
//! the other one stops, and both sockets are shut down before the session
//! returns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::pump::{pump, PumpSettings};
use super::Direction;
use crate::error::{RelayError, RelayResult};

/// Represents an active relay session
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub miner_addr: SocketAddr,
    pub pool_addr: SocketAddr,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

/// Why a session ended
#[derive(Debug)]
pub enum CloseReason {
    /// Miner sent end-of-stream
    MinerClosed,
    /// Pool sent end-of-stream
    PoolClosed,
    /// A pump failed mid-stream
    Error(RelayError),
    /// Relay is shutting down
    Shutdown,
    /// A pump task panicked or was aborted
    TaskFailed(String),
}

/// Statistics for a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub miner_addr: SocketAddr,
    pub pool_addr: SocketAddr,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    pub close_reason: String,
}

enum PumpOutcome {
    Finished(RelayResult<u64>),
    Cancelled,
}

struct PumpReport {
    direction: Direction,
    outcome: PumpOutcome,
}

impl CloseReason {
    fn from_join(joined: Result<PumpReport, JoinError>) -> Self {
        match joined {
            Ok(PumpReport {
                direction,
                outcome: PumpOutcome::Finished(Ok(_)),
            }) => match direction {
                Direction::MinerToPool => CloseReason::MinerClosed,
                Direction::PoolToMiner => CloseReason::PoolClosed,
            },
            Ok(PumpReport {
                outcome: PumpOutcome::Finished(Err(e)),
                ..
            }) => CloseReason::Error(e),
            Ok(PumpReport {
                outcome: PumpOutcome::Cancelled,
                ..
            }) => CloseReason::Shutdown,
            Err(e) => CloseReason::TaskFailed(e.to_string()),
        }
    }

    /// Direction that failed, if the session ended on a forwarding error
    pub fn failed_direction(&self) -> Option<Direction> {
        match self {
            CloseReason::Error(e) => e.direction(),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::MinerClosed => f.write_str("miner closed the connection"),
            CloseReason::PoolClosed => f.write_str("pool closed the connection"),
            CloseReason::Error(e) => write!(f, "{}", e),
            CloseReason::Shutdown => f.write_str("relay shutting down"),
            CloseReason::TaskFailed(e) => write!(f, "pump task failed: {}", e),
        }
    }
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(miner_addr: SocketAddr, pool_addr: SocketAddr) -> Self {
        let session_id = Uuid::new_v4().to_string();
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, miner_addr, pool_addr
        );

        Self {
            session_id,
            miner_addr,
            pool_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes forwarded from the miner to the pool
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes forwarded from the pool to the miner
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::MinerToPool => &self.bytes_up,
            Direction::PoolToMiner => &self.bytes_down,
        }
    }

    /// Relay between the two sockets until one side is done.
    ///
    /// Returns once both pumps have exited and both sockets are shut down.
    /// A message on `shutdown` ends the session the same way an end-of-stream
    /// would.
    pub async fn relay(
        self: Arc<Self>,
        miner: TcpStream,
        pool: TcpStream,
        settings: PumpSettings,
        mut shutdown: broadcast::Receiver<()>,
    ) -> CloseReason {
        let (miner_read, miner_write) = miner.into_split();
        let (pool_read, pool_write) = pool.into_split();

        // first pump to finish wins; the flag tells the other one to stop
        let (close_tx, close_rx) = watch::channel(false);

        let mut pumps = JoinSet::new();
        pumps.spawn(run_pump(
            Arc::clone(&self),
            miner_read,
            pool_write,
            Direction::MinerToPool,
            settings,
            close_rx.clone(),
        ));
        pumps.spawn(run_pump(
            Arc::clone(&self),
            pool_read,
            miner_write,
            Direction::PoolToMiner,
            settings,
            close_rx,
        ));

        let reason = tokio::select! {
            Some(first) = pumps.join_next() => CloseReason::from_join(first),
            Ok(()) = shutdown.recv() => CloseReason::Shutdown,
        };

        // receivers may already be gone if both pumps finished together
        let _ = close_tx.send(true);

        while let Some(rest) = pumps.join_next().await {
            if let Err(e) = rest {
                error!(session_id = %self.session_id, error = %e, "Pump task failed");
            }
        }

        reason
    }

    /// Generate session statistics
    pub fn to_stats(&self, reason: &CloseReason) -> SessionStats {
        let duration = self.duration();

        SessionStats {
            session_id: self.session_id.clone(),
            miner_addr: self.miner_addr,
            pool_addr: self.pool_addr,
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
            close_reason: reason.to_string(),
        }
    }

    /// Log the session summary
    pub fn log_stats(&self, reason: &CloseReason) {
        info!(
            session_id = %self.session_id,
            miner = %self.miner_addr,
            pool = %self.pool_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            reason = %reason,
            "Relay session completed"
        );
    }
}

async fn run_pump<R, W>(
    session: Arc<RelaySession>,
    mut source: R,
    mut destination: W,
    direction: Direction,
    settings: PumpSettings,
    mut closed: watch::Receiver<bool>,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outcome = tokio::select! {
        result = pump(&mut source, &mut destination, direction, settings, session.counter(direction)) => {
            PumpOutcome::Finished(result)
        }
        // a dropped sender means the session itself went away
        _ = closed.changed() => PumpOutcome::Cancelled,
    };

    if let PumpOutcome::Finished(Err(e)) = &outcome {
        warn!(
            session_id = %session.session_id,
            miner = %session.miner_addr,
            %direction,
            error = %e,
            "Error while forwarding"
        );
    }

    close_quietly(&mut destination).await;
    PumpReport { direction, outcome }
}

/// Shut down the write side of a connection, ignoring failures.
///
/// Closing a socket the peer already reset, or closing it twice, is not an
/// error for the relay.
pub async fn close_quietly<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Ignoring error while closing connection");
    }
}
