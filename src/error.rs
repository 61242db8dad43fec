//! Relay Error Types
//!
//! Errors raised by the listener, the session and the pumps. Callers use
//! [`RelayError::is_fatal`] to tell process-fatal failures from the ones that
//! only end a single session.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::relay::Direction;

/// Result alias for relay operations
pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to connect to pool {target}: {source}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to pool {target} after {timeout:?}")]
    UpstreamTimeout { target: String, timeout: Duration },

    #[error("shutdown while connecting to pool {target}")]
    ShutdownWhileConnecting { target: String },

    #[error("read error while forwarding {direction}: {source}")]
    Read {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("write error while forwarding {direction}: {source}")]
    Write {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("no data {direction} for {timeout:?}")]
    Idle { direction: Direction, timeout: Duration },
}

impl RelayError {
    /// Whether the error must bring the whole process down.
    ///
    /// Only listener failures are fatal. Upstream and mid-stream errors end
    /// the session they happened in and nothing else.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Bind { .. } | RelayError::Accept(_))
    }

    /// Direction of the pump that failed, for mid-stream errors
    pub fn direction(&self) -> Option<Direction> {
        match self {
            RelayError::Read { direction, .. }
            | RelayError::Write { direction, .. }
            | RelayError::Idle { direction, .. } => Some(*direction),
            _ => None,
        }
    }
}

/// Accept errors the listener recovers from by backing off and retrying.
///
/// Aborted handshakes and descriptor exhaustion go away on their own; anything
/// else means the listening socket itself is unusable.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => err
            .raw_os_error()
            .is_some_and(|code| RESOURCE_EXHAUSTION_ERRNOS.contains(&code)),
    }
}

// ENOMEM, ENFILE, EMFILE and ENOBUFS have no stable ErrorKind. Only ENOBUFS
// is numbered differently between Linux and the BSD family.
#[cfg(target_os = "linux")]
const RESOURCE_EXHAUSTION_ERRNOS: &[i32] = &[12, 23, 24, 105];

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const RESOURCE_EXHAUSTION_ERRNOS: &[i32] = &[12, 23, 24, 55];

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const RESOURCE_EXHAUSTION_ERRNOS: &[i32] = &[];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let bind = RelayError::Bind {
            addr: "0.0.0.0:3333".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(bind.is_fatal());

        let upstream = RelayError::UpstreamConnect {
            target: "pool.example.com:3333".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(!upstream.is_fatal());
        assert_eq!(upstream.direction(), None);

        let read = RelayError::Read {
            direction: Direction::PoolToMiner,
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        };
        assert!(!read.is_fatal());
        assert_eq!(read.direction(), Some(Direction::PoolToMiner));
    }

    #[test]
    fn test_error_messages_name_the_cause() {
        let err = RelayError::Bind {
            addr: "127.0.0.1:3333".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:3333"));
        assert!(msg.contains("permission denied"));

        let err = RelayError::Write {
            direction: Direction::MinerToPool,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert!(err.to_string().contains("miner -> pool"));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descriptor_and_buffer_exhaustion_are_transient() {
        // EMFILE, ENFILE, ENOBUFS
        for code in [24, 23, 105] {
            assert!(is_transient_accept_error(&io::Error::from_raw_os_error(code)));
        }
        // EPROTO stays fatal
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(71)));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_enobufs_uses_the_bsd_number() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(55)));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }
}
