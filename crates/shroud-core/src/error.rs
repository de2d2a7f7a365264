//! Error types for the tunnel engine.
//!
//! Every fallible operation inside a session funnels into [`EngineError`];
//! `Session::run` is the single frame that catches it and performs
//! reset-style teardown. Transient conditions (`EINTR`, `EAGAIN`,
//! TLS want-read/want-write) are never represented here — they are retried
//! inside the transfer loop and never surface.

use std::io;

use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that abort a session. Any of these causes a linger-reset close
/// of the session's sockets.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("TLS protocol fault: {0}")]
    Tls(#[from] rustls::Error),

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("no remote address could be reached")]
    Unreachable,

    #[error("IDENT refused user {0:?}")]
    IdentRejected(String),

    #[error("IDENT protocol error: {0}")]
    Ident(String),

    #[error("protocol negotiation failed: {0}")]
    Negotiate(String),

    #[error("transfer loop made no progress for {0} iterations")]
    Watchdog(u32),

    #[error("spawning local program: {0}")]
    Spawn(io::Error),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl EngineError {
    /// Wrap an `io::Error` with the name of the failed operation.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        EngineError::Io { op, source }
    }

    /// Fetch `errno` from the last libc call and wrap it.
    pub fn last_os(op: &'static str) -> Self {
        EngineError::Io {
            op,
            source: io::Error::last_os_error(),
        }
    }
}
