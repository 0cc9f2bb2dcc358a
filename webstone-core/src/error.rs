//! Error taxonomy for the server core
//!
//! Socket failures keep the OS error code so accept-loop retry decisions
//! and request-abort logging can tell transient conditions from fatal
//! ones. Parsing problems surface as `RequestProcessing` and become HTTP
//! 5xx responses at the worker boundary.

use std::io;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, WebstoneError>;

#[derive(Debug, thiserror::Error)]
pub enum WebstoneError {
    /// OS-level socket failure with the raw error code when available
    #[error("socket error ({code}): {message}")]
    Socket { code: i32, message: String },

    /// Malformed request (bad header line, broken multipart part, ...)
    #[error("request processing failed: {0}")]
    RequestProcessing(String),

    /// `start` called while the acceptor is already running
    #[error("server already started")]
    AlreadyStarted,

    /// Write attempted after `end()`, or a double `end()`
    #[error("response already sent")]
    ResponseAlreadySent,

    /// Cooperative cancellation of a worker
    #[error("worker thread interrupted")]
    ThreadInterrupted,

    /// Configuration file could not be loaded or validated
    #[error("settings loading failed: {0}")]
    SettingsLoad(String),

    /// Any other unexpected condition
    #[error("{0}")]
    Application(String),
}

impl WebstoneError {
    pub fn socket(message: impl Into<String>) -> Self {
        WebstoneError::Socket { code: 0, message: message.into() }
    }

    pub fn request(message: impl Into<String>) -> Self {
        WebstoneError::RequestProcessing(message.into())
    }
}

impl From<io::Error> for WebstoneError {
    fn from(err: io::Error) -> Self {
        WebstoneError::Socket {
            code: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }
}

/// Peer dropped the connection mid-transfer
pub fn is_connection_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Timeout expiry on a socket with SO_RCVTIMEO / SO_SNDTIMEO set.
/// Platforms disagree on the kind reported, so both are checked.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Accept-loop errors that should be logged at debug and retried
pub fn is_retriable_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_os_code() {
        let io_err = io::Error::from_raw_os_error(104);
        match WebstoneError::from(io_err) {
            WebstoneError::Socket { code, .. } => assert_eq!(code, 104),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(WebstoneError::AlreadyStarted.to_string(), "server already started");
        assert_eq!(
            WebstoneError::request("no colon in header").to_string(),
            "request processing failed: no colon in header"
        );
    }

    #[test]
    fn test_timeout_classification() {
        assert!(is_timeout(&io::Error::new(io::ErrorKind::WouldBlock, "t")));
        assert!(is_timeout(&io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(!is_timeout(&io::Error::new(io::ErrorKind::ConnectionReset, "t")));
    }
}
