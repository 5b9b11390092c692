//! Error types for the MiniAgents runtime

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime.
///
/// Every variant carries owned strings, so the whole enum is `Clone`. That is
/// load-bearing: a promise caches its outcome and replays the *same* error to
/// every consumer that awaits it later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No runtime context is active on the current task
    #[error("no active context: {0}")]
    NoActiveContext(String),

    /// A context was activated a second time
    #[error("context is not reentrant: {0}")]
    ContextReentered(String),

    /// An appender was used before it was opened
    #[error("appender is not open: {0}")]
    AppenderNotOpen(String),

    /// An appender was used after it was closed
    #[error("appender is closed: {0}")]
    AppenderClosed(String),

    /// A field name or field value was rejected
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// A resolver awaited its own promise
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// The task resolving a promise was cancelled mid-flight
    #[error("promise resolution was cancelled")]
    Cancelled,

    /// Failure raised by an agent body or streamer
    #[error("{0}")]
    Raised(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new no-active-context error
    pub fn no_active_context(msg: impl Into<String>) -> Self {
        Error::NoActiveContext(msg.into())
    }

    /// Create a new context-reentered error
    pub fn context_reentered(msg: impl Into<String>) -> Self {
        Error::ContextReentered(msg.into())
    }

    /// Create a new appender-not-open error
    pub fn appender_not_open(msg: impl Into<String>) -> Self {
        Error::AppenderNotOpen(msg.into())
    }

    /// Create a new appender-closed error
    pub fn appender_closed(msg: impl Into<String>) -> Self {
        Error::AppenderClosed(msg.into())
    }

    /// Create a new invalid-field error
    pub fn invalid_field(msg: impl Into<String>) -> Self {
        Error::InvalidField(msg.into())
    }

    /// Create a new invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new deadlock error
    pub fn deadlock(msg: impl Into<String>) -> Self {
        Error::Deadlock(msg.into())
    }

    /// Create a new raised error (failure originating in user code)
    pub fn raised(msg: impl Into<String>) -> Self {
        Error::Raised(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Short class-like name of this error kind, used when an error is
    /// reified into an in-band message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::NoActiveContext(_) => "NoActiveContext",
            Error::ContextReentered(_) => "ContextReentered",
            Error::AppenderNotOpen(_) => "AppenderNotOpen",
            Error::AppenderClosed(_) => "AppenderClosed",
            Error::InvalidField(_) => "InvalidField",
            Error::InvalidInput(_) => "InvalidInput",
            Error::Json(_) => "JsonError",
            Error::Deadlock(_) => "Deadlock",
            Error::Cancelled => "Cancelled",
            Error::Raised(_) => "Error",
            Error::Other(_) => "Error",
        }
    }

    /// The bare payload of this error, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::NoActiveContext(m)
            | Error::ContextReentered(m)
            | Error::AppenderNotOpen(m)
            | Error::AppenderClosed(m)
            | Error::InvalidField(m)
            | Error::InvalidInput(m)
            | Error::Json(m)
            | Error::Deadlock(m)
            | Error::Raised(m)
            | Error::Other(m) => m,
            Error::Cancelled => "promise resolution was cancelled",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}
