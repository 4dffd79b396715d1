use std::{fmt, time::Duration};

/// Core error type for the engine.
///
/// Adapter crates map their specific errors into this type so the loop and the
/// dispatcher can classify failures consistently (transient vs permanent).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportFailure),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("store error: {0}")]
    Store(String),

    #[error("store is closed")]
    StoreClosed,

    #[error("cursor regression on `{stream}`: stored {current}, requested {requested}")]
    CursorRegression {
        stream: String,
        current: i64,
        requested: i64,
    },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Whether retrying the same request later can reasonably succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Transport-layer failure as reported by an adapter (Telegram, HTTP).
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected credentials: {0}")]
    Unauthorized(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportFailure::Timeout
            | TransportFailure::Connection(_)
            | TransportFailure::RateLimited { .. } => FailureKind::Transient,
            TransportFailure::Status { code, .. } if *code >= 500 || *code == 429 => {
                FailureKind::Transient
            }
            TransportFailure::Status { .. }
            | TransportFailure::Malformed(_)
            | TransportFailure::Unauthorized(_)
            | TransportFailure::Rejected(_) => FailureKind::Permanent,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportFailure::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A classified failure of a call made through the dispatcher.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{service}: {kind} failure: {message}")]
pub struct DispatchError {
    pub service: String,
    pub kind: FailureKind,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl Error {
    /// Classify any engine error. Anything that is not a known transport
    /// condition is treated as permanent.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Transport(t) => t.kind(),
            Error::Dispatch(d) => d.kind,
            Error::Io(_) => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transport(t) => t.retry_after(),
            Error::Dispatch(d) => d.retry_after,
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}
