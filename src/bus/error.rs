//! Bus transport errors.

use std::io;

use thiserror::Error;

use crate::error::Transience;

/// Errors produced by connections and servers.
///
/// The enum is cloneable because a single terminal error fans out to every
/// pending send completion on the connection; io errors are captured as
/// `(kind, message)` for that reason.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("{context}: {kind:?}: {message}")]
    Io {
        context: &'static str,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("framing violation: {reason}")]
    Framing { reason: String },
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },
    #[error("terminated: {reason}")]
    Terminated { reason: String },
    #[error("connection is closed")]
    Closed,
    #[error("send aborted")]
    Aborted,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection stalled: no {what} progress")]
    Stalled { what: &'static str },
    #[error("bus server stopped")]
    ServerStopped,
    #[error("bind to {addr} failed after {attempts} attempts: {message}")]
    BindFailed {
        addr: String,
        attempts: u32,
        message: String,
    },
}

impl BusError {
    pub fn io(context: &'static str, err: &io::Error) -> Self {
        BusError::Io {
            context,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        BusError::Terminated {
            reason: reason.into(),
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            BusError::Io { .. }
            | BusError::Terminated { .. }
            | BusError::Closed
            | BusError::Aborted
            | BusError::PeerClosed
            | BusError::Stalled { .. }
            | BusError::ServerStopped
            | BusError::BindFailed { .. } => Transience::Retryable,
            BusError::Framing { .. } | BusError::Protocol { .. } => Transience::Permanent,
        }
    }
}
