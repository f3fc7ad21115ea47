//! The error taxonomy shared by every layer of the proxy.
//!
//! Socket-level failures carry the raw `errno` alongside a human label so log
//! lines read like the syscall that produced them, not a generic "it broke".

use std::io;

/// Process exit codes, following the BSD `sysexits.h` convention the
/// original tool used for its two failure classes.
pub mod exit_code {
    /// Successful shutdown.
    pub const OK: i32 = 0;
    /// Bad input data: an unparsable or unresolvable address.
    pub const DATA_ERR: i32 = 65;
    /// Internal/software error: something the event loop could not recover from.
    pub const SOFTWARE: i32 = 70;
}

/// Errors that can occur while configuring or running the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A `host:port` string, or a raw `sockaddr`, did not name a valid
    /// IPv4 or IPv6 endpoint.
    #[error("invalid address \"{0}\"")]
    InvalidAddress(String),

    /// Name/service resolution failed, or resolved to more than one
    /// candidate where exactly one was required.
    #[error("could not resolve \"{host}:{service}\": {reason}")]
    ResolutionFailure {
        host: String,
        service: String,
        reason: String,
    },

    /// A syscall on a socket failed.
    #[error("{what}: {source}")]
    System {
        what: String,
        #[source]
        source: io::Error,
    },

    /// A non-blocking `connect()` completed with a pending error.
    #[error("connect to server failed: {source}")]
    ConnectFailed {
        #[source]
        source: io::Error,
    },

    /// Configuration was internally inconsistent (bad CLI combination, etc).
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps any other I/O failure encountered outside the connection engine
    /// (log file handling, PID file handling, daemonization).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Construct a [`ProxyError::System`] from the current `errno`-bearing
    /// [`io::Error`], labeled with the syscall that produced it.
    pub fn system(what: impl Into<String>, source: io::Error) -> Self {
        ProxyError::System {
            what: what.into(),
            source,
        }
    }

    /// The process exit code this error should map to when it escapes `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::InvalidAddress(_)
            | ProxyError::ResolutionFailure { .. }
            | ProxyError::Config(_) => exit_code::DATA_ERR,
            ProxyError::System { .. } | ProxyError::ConnectFailed { .. } | ProxyError::Io(_) => {
                exit_code::SOFTWARE
            }
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
