//! Connection Manager Implementation
//!
//! The listening side of the relay: accepts miner connections and hands each
//! one to its own session task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{is_transient_accept_error, RelayError, RelayResult};
use crate::metrics::Metrics;
use crate::relay::RelayEngine;

/// Pause after a transient accept error before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts miner connections and dispatches them to sessions
pub struct ConnectionManager {
    listener: TcpListener,
    local_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    active_sessions: Arc<AtomicUsize>,
}

/// Keeps the active-session counts right however the session task ends
struct SessionGuard {
    active_sessions: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl SessionGuard {
    fn new(active_sessions: &Arc<AtomicUsize>, metrics: &Arc<Metrics>) -> Self {
        active_sessions.fetch_add(1, Ordering::Relaxed);
        metrics.session_opened();
        Self {
            active_sessions: Arc::clone(active_sessions),
            metrics: Arc::clone(metrics),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.metrics.session_closed();
    }
}

impl ConnectionManager {
    /// Bind the listening socket. Failure here is fatal to the process.
    pub async fn bind(config: Arc<Config>, metrics: Arc<Metrics>) -> RelayResult<Self> {
        let bind_addr = config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind {
                addr: bind_addr,
                source,
            })?;

        info!("Successfully bound to {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            engine: Arc::new(RelayEngine::new(config, metrics)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Address actually bound, useful when the configured port is 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle on the active-session count that stays valid after `run` consumes the manager
    pub fn active_sessions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_sessions)
    }

    /// Accept connections until `shutdown` fires or the listener fails.
    ///
    /// Sessions run on their own tasks, so a stalled session never holds up
    /// the next accept. After shutdown the manager waits up to the configured
    /// `shutdown_timeout` for sessions to drain.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> RelayResult<()> {
        let Self {
            listener,
            local_addr,
            engine,
            active_sessions,
        } = self;

        info!(
            listen_addr = %local_addr,
            pool = %engine.config().pool.target(),
            "Accepting miner connections"
        );

        let mut incoming = TcpListenerStream::new(listener);

        loop {
            tokio::select! {
                next = incoming.next() => match next {
                    Some(Ok(stream)) => {
                        spawn_session(&engine, &active_sessions, stream, shutdown.resubscribe());
                    }
                    Some(Err(e)) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Transient accept error, backing off");
                        sleep(ACCEPT_BACKOFF).await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Listener failed");
                        return Err(RelayError::Accept(e));
                    }
                    None => break,
                },
                Ok(()) = shutdown.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        wait_for_sessions_to_close(&active_sessions, engine.config().server.shutdown_timeout).await;
        Ok(())
    }
}

fn spawn_session(
    engine: &Arc<RelayEngine>,
    active_sessions: &Arc<AtomicUsize>,
    stream: TcpStream,
    shutdown: broadcast::Receiver<()>,
) {
    let miner_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(error = %e, "Dropping connection that closed before dispatch");
            return;
        }
    };

    info!(miner = %miner_addr, "Connection from miner");

    if engine.config().server.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(miner = %miner_addr, error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let guard = SessionGuard::new(active_sessions, engine.metrics());
    let engine = Arc::clone(engine);

    tokio::spawn(async move {
        let _guard = guard;
        let start_time = Instant::now();

        if let Err(e) = engine.run_session(stream, miner_addr, shutdown).await {
            debug!(miner = %miner_addr, error = %e, "Session ended without relaying");
        }

        info!(
            miner = %miner_addr,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Connection closed"
        );
    });
}

async fn wait_for_sessions_to_close(active_sessions: &AtomicUsize, shutdown_timeout: Duration) {
    let start_time = Instant::now();

    info!(
        "Waiting for {} active sessions to close (timeout: {:?})",
        active_sessions.load(Ordering::Relaxed),
        shutdown_timeout
    );

    while active_sessions.load(Ordering::Relaxed) > 0 && start_time.elapsed() < shutdown_timeout {
        sleep(Duration::from_millis(50)).await;
    }

    let remaining = active_sessions.load(Ordering::Relaxed);
    if remaining == 0 {
        info!("All sessions closed in {:?}", start_time.elapsed());
    } else {
        warn!(
            "Shutdown timeout reached after {:?} with {} sessions still active",
            start_time.elapsed(),
            remaining
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_on(addr: SocketAddr) -> Arc<Config> {
        let mut config = Config::default();
        config.server.bind_addr = addr;
        config.pool.host = "127.0.0.1".to_string();
        config.pool.port = 1;
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_bind_reports_actual_port() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = ConnectionManager::bind(config_on("127.0.0.1:0".parse().unwrap()), metrics)
            .await
            .unwrap();

        assert_ne!(manager.local_addr().port(), 0);
        assert_eq!(manager.active_sessions().load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());

        let err = match ConnectionManager::bind(config_on(addr), metrics).await {
            Ok(_) => panic!("second bind on {} succeeded", addr),
            Err(e) => e,
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = ConnectionManager::bind(config_on("127.0.0.1:0".parse().unwrap()), metrics)
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(manager.run(shutdown_rx));
        shutdown_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
