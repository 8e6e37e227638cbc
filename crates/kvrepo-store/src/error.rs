//! Error types for the store boundary.
//!
//! [`StoreError`] is what every backend reports. It carries just enough
//! classification for the retry layer: [`StoreError::is_transient`] says
//! whether repeating the call could succeed.

/// Errors that can occur while talking to the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The call did not complete within the command timeout.
    #[error("store call timed out")]
    Timeout,

    /// A network-level failure on an established connection.
    #[error("I/O error: {0}")]
    Io(String),

    /// The server rejected the command.
    #[error("server error: {0}")]
    Server(String),

    /// The server does not know the referenced script handle.
    #[error("script not found: {0}")]
    NoScript(String),

    /// The server is out of memory.
    #[error("server out of memory: {0}")]
    ResourceExhausted(String),

    /// The server refused a transaction as a whole, e.g. `EXECABORT` after a
    /// command was rejected while queueing. Nothing was applied.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// `EXEC` was sent but no reply arrived; the transaction may have been
    /// applied.
    #[error("transaction outcome unknown: {0}")]
    Unconfirmed(String),

    /// A reply could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection has been shut down.
    #[error("connection closed")]
    Closed,
}

impl StoreError {
    /// Classify a server error reply by its leading error code.
    pub fn from_reply(message: &str) -> Self {
        if message.starts_with("NOSCRIPT") {
            Self::NoScript(message.to_owned())
        } else if message.starts_with("OOM") {
            Self::ResourceExhausted(message.to_owned())
        } else {
            Self::Server(message.to_owned())
        }
    }

    /// Returns `true` if repeating the call could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Io(_) | Self::Server(_))
    }

    /// Returns `true` for an evicted or unknown script handle.
    pub const fn is_no_script(&self) -> bool {
        matches!(self, Self::NoScript(_))
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_elapsed: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl From<fred::error::Error> for StoreError {
    fn from(err: fred::error::Error) -> Self {
        use fred::error::ErrorKind;

        let details = err.details();
        if details.contains("NOSCRIPT") {
            return Self::NoScript(details.to_owned());
        }
        if details.starts_with("OOM") {
            return Self::ResourceExhausted(details.to_owned());
        }
        match err.kind() {
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::IO => Self::Io(details.to_owned()),
            ErrorKind::Canceled => Self::Closed,
            ErrorKind::Config | ErrorKind::Url | ErrorKind::Auth => {
                Self::Connect(details.to_owned())
            }
            ErrorKind::Protocol | ErrorKind::Parse => Self::Protocol(details.to_owned()),
            _ => Self::Server(details.to_owned()),
        }
    }
}
