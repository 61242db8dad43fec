//! Byte Pump
//!
//! One direction of a relay session. The pump knows nothing about Stratum:
//! it moves whatever arrives on the source to the destination, one chunk at a
//! time, in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use super::Direction;
use crate::config::ServerConfig;
use crate::error::{RelayError, RelayResult};

/// Per-pump tuning taken from the server configuration
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl From<&ServerConfig> for PumpSettings {
    fn from(server: &ServerConfig) -> Self {
        Self {
            buffer_size: server.buffer_size,
            idle_timeout: server.idle_timeout,
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Copy `source` into `destination` until the source reaches end-of-stream.
///
/// Each chunk is written out and flushed before the next read, so at most one
/// buffer of data is ever in flight. `forwarded` is bumped after every chunk
/// and the total is returned on a clean end-of-stream.
pub async fn pump<R, W>(
    source: &mut R,
    destination: &mut W,
    direction: Direction,
    settings: PumpSettings,
    forwarded: &AtomicU64,
) -> RelayResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(settings.buffer_size);
    let mut total = 0u64;

    loop {
        buffer.clear();

        let read = match settings.idle_timeout {
            Some(limit) => timeout(limit, source.read_buf(&mut buffer))
                .await
                .map_err(|_| RelayError::Idle {
                    direction,
                    timeout: limit,
                })?,
            None => source.read_buf(&mut buffer).await,
        };
        let n = read.map_err(|source| RelayError::Read { direction, source })?;

        if n == 0 {
            trace!(%direction, total, "End of stream");
            return Ok(total);
        }

        destination
            .write_all(&buffer[..n])
            .await
            .map_err(|source| RelayError::Write { direction, source })?;
        destination
            .flush()
            .await
            .map_err(|source| RelayError::Write { direction, source })?;

        total += n as u64;
        forwarded.fetch_add(n as u64, Ordering::Relaxed);
    }
}
