//! Error types for torify.
//!
//! Every variant is terminal for the operation that produced it. The only
//! internal retries are the bounded poll loops (cookie readiness, bootstrap
//! progress), which are not error recovery.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for torify operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The tor binary could not be spawned.
    #[error("failed to start tor process")]
    ProcessStart(#[source] std::io::Error),

    /// Tor's output ended without reporting its control port.
    #[error("tor did not report a control port")]
    ControlPortNotFound,

    /// Tor exited with a non-zero code while starting up.
    #[error("tor exited abnormally with code {0}")]
    AbnormalExit(i32),

    /// The control port or SOCKS proxy rejected our credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Tor reported no SOCKS listener.
    #[error("tor has no socks listener")]
    NoSocksListener,

    /// No SOCKS proxy could be resolved for an outbound connection.
    #[error("socks proxy unavailable: {0}")]
    ProxyUnavailable(String),

    /// The onion service descriptor was not published in time.
    #[error("onion service publication timed out")]
    PublicationTimeout,

    /// Bootstrapping did not reach 100% in time.
    #[error("tor bootstrap timed out")]
    BootstrapTimeout,

    /// The control auth cookie was not written in time.
    #[error("auth cookie not created")]
    CookieTimeout,

    /// The operation was aborted by a shutdown or close request.
    #[error("operation cancelled")]
    Cancelled,

    /// Reading or writing persisted state failed.
    #[error("failed to persist {}", path.display())]
    Persistence {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Operation attempted after shutdown was requested.
    #[error("shutdown already requested")]
    AlreadyShutdown,

    /// Operation requires a started tor session.
    #[error("tor is not started")]
    NotStarted,

    /// Operation requires a bound onion service.
    #[error("onion service is not bound")]
    NotBound,

    /// A readiness listener is already pending for this service.
    #[error("a ready listener is already registered for {0}")]
    ListenerAlreadyRegistered(String),

    /// Tor answered a control command with an error status.
    #[error("control command failed ({code}): {message}")]
    Command {
        /// Reply status code (4xx/5xx).
        code: u16,
        /// Reply text.
        message: String,
    },

    /// The control connection is closed.
    #[error("control connection closed")]
    ControlClosed,

    /// A control command was attempted before authentication.
    #[error("control session not authenticated")]
    NotAuthenticated,

    /// Malformed data on the control connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The SOCKS proxy refused the CONNECT request.
    #[error("socks connect failed with reply code {code}")]
    Socks {
        /// SOCKS5 reply field.
        code: u8,
    },

    /// Installing tor files failed.
    #[error("install failed: {0}")]
    Install(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic IO failure.
    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Result type alias using torify's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a persistence error for `path`.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Check if this error means the operation was aborted on request
    /// rather than failing on its own.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::AlreadyShutdown)
    }
}
