// src/error.rs
use std::io;
use thiserror::Error;

/// Reason codes carried in a handshake rejection response (request type
/// 1000..1999 on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    System,
    Peer,
    Resource,
    Rogue,
    Backlog,
    Ipe,
    Close,
    Version,
    RdvCookie,
    BadSecret,
    Unsecure,
    MessageApi,
    Congestion,
    Filter,
}

impl RejectReason {
    pub fn code(self) -> i32 {
        1000 + match self {
            RejectReason::System => 1,
            RejectReason::Peer => 2,
            RejectReason::Resource => 3,
            RejectReason::Rogue => 4,
            RejectReason::Backlog => 5,
            RejectReason::Ipe => 6,
            RejectReason::Close => 7,
            RejectReason::Version => 8,
            RejectReason::RdvCookie => 9,
            RejectReason::BadSecret => 10,
            RejectReason::Unsecure => 11,
            RejectReason::MessageApi => 12,
            RejectReason::Congestion => 13,
            RejectReason::Filter => 14,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code - 1000 {
            1 => RejectReason::System,
            2 => RejectReason::Peer,
            3 => RejectReason::Resource,
            4 => RejectReason::Rogue,
            5 => RejectReason::Backlog,
            6 => RejectReason::Ipe,
            7 => RejectReason::Close,
            8 => RejectReason::Version,
            9 => RejectReason::RdvCookie,
            10 => RejectReason::BadSecret,
            11 => RejectReason::Unsecure,
            12 => RejectReason::MessageApi,
            13 => RejectReason::Congestion,
            14 => RejectReason::Filter,
            _ => return None,
        })
    }
}

/// Errors raised during connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupCause {
    /// The handshake did not complete within the connection TTL.
    Timeout,
    /// The peer (or the local listener callback) rejected the handshake.
    Rejected(RejectReason),
    /// A local resource (port, multiplexer) could not be obtained.
    NoRes,
    /// Key-material negotiation failed under enforced encryption.
    Security,
}

/// Errors raised on a connection that was once established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCause {
    /// The connection was established and then broke.
    ConnLost,
    /// The operation requires an established connection and there is none.
    NoConn,
}

/// API misuse causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCause {
    /// Operation not allowed in the socket's current state.
    WrongState,
    /// Operation not available in the configured mode (stream vs message).
    WrongMode,
    /// A parameter was out of range or otherwise invalid.
    InvalidParam,
    /// The message is larger than the send buffer can ever hold.
    MessageTooLarge,
}

/// Would-block and timeout causes for non-blocking or bounded calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgainCause {
    /// No buffer space to write.
    WrAvail,
    /// No data ready to read.
    RdAvail,
    /// A bounded blocking call timed out.
    XmTimeout,
    /// Sending denied by congestion control.
    Congestion,
}

/// Top-level error type of the transport API, classified by major category
/// and minor cause.
#[derive(Error, Debug)]
pub enum SrtError {
    #[error("Connection setup failure: {0:?}")]
    Setup(SetupCause),

    #[error("Connection failure: {0:?}")]
    Connection(ConnCause),

    #[error("System resource failure: {0}")]
    SystemRes(String),

    #[error("Operation not supported: {0:?}")]
    NotSup(UsageCause),

    #[error("Operation would block: {0:?}")]
    Again(AgainCause),

    #[error("Peer signaled error code {0}")]
    PeerError(u32),

    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SrtError {
    /// Shorthand used all over the blocking call paths.
    pub(crate) fn conn_lost() -> Self {
        SrtError::Connection(ConnCause::ConnLost)
    }

    pub(crate) fn no_conn() -> Self {
        SrtError::Connection(ConnCause::NoConn)
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, SrtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_codes_round_trip() {
        for r in [
            RejectReason::System,
            RejectReason::Version,
            RejectReason::RdvCookie,
            RejectReason::BadSecret,
            RejectReason::Unsecure,
            RejectReason::Filter,
        ] {
            assert_eq!(RejectReason::from_code(r.code()), Some(r));
        }
        assert_eq!(RejectReason::from_code(999), None);
        assert_eq!(RejectReason::from_code(1999), None);
    }
}
