//! Relay Engine

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use super::session::close_quietly;
use super::{PumpSettings, RelaySession, SessionStats};
use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::metrics::Metrics;

/// Runs relay sessions against the configured pool
pub struct RelayEngine {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl RelayEngine {
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Open the upstream connection for one session.
    ///
    /// Exactly one attempt is made. Name resolution and connecting to the
    /// resolved addresses count as that single attempt and share the optional
    /// connect timeout.
    pub async fn connect_upstream(&self) -> RelayResult<TcpStream> {
        let target = self.config.pool.target();
        debug!("Connecting to pool {}", target);

        let connect = TcpStream::connect(target.as_str());
        let result = match self.config.server.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(RelayError::UpstreamTimeout {
                        target,
                        timeout: limit,
                    })
                }
            },
            None => connect.await,
        };

        let stream = result.map_err(|source| RelayError::UpstreamConnect { target, source })?;

        if self.config.server.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY on pool connection");
            }
        }

        Ok(stream)
    }

    /// Run one session from an accepted miner connection to completion.
    ///
    /// On upstream failure the miner connection is closed and the error is
    /// returned; no pump is started and nothing is retried. A shutdown that
    /// arrives while connecting abandons the attempt the same way.
    #[instrument(skip_all, fields(miner = %miner_addr))]
    pub async fn run_session(
        &self,
        mut miner: TcpStream,
        miner_addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> RelayResult<SessionStats> {
        let connected = tokio::select! {
            result = self.connect_upstream() => result,
            Ok(()) = shutdown.recv() => {
                info!(miner = %miner_addr, "Shutdown while connecting to pool");
                close_quietly(&mut miner).await;
                return Err(RelayError::ShutdownWhileConnecting {
                    target: self.config.pool.target(),
                });
            }
        };

        let pool = match connected {
            Ok(pool) => pool,
            Err(e) => {
                self.metrics.upstream_connect_failed();
                error!(
                    miner = %miner_addr,
                    pool = %self.config.pool.target(),
                    error = %e,
                    "Failed to connect to pool"
                );
                close_quietly(&mut miner).await;
                return Err(e);
            }
        };

        let pool_addr = match pool.peer_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.metrics.upstream_connect_failed();
                close_quietly(&mut miner).await;
                return Err(RelayError::UpstreamConnect {
                    target: self.config.pool.target(),
                    source,
                });
            }
        };

        info!(miner = %miner_addr, pool = %pool_addr, "Connected to pool");

        let session = Arc::new(RelaySession::new(miner_addr, pool_addr));
        let settings = PumpSettings::from(&self.config.server);
        let reason = Arc::clone(&session)
            .relay(miner, pool, settings, shutdown)
            .await;

        self.metrics.record_session(&session, &reason);
        session.log_stats(&reason);

        Ok(session.to_stats(&reason))
    }
}
