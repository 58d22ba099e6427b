//! Typed errors for the crawl core.
//!
//! Every adapter and store call reports through these types so each call
//! site decides explicitly whether to retry, record a deletion, or abort.

use std::fmt;
use thiserror::Error;

/// Why a transient failure happened. Drives proxy blame and log wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The call did not finish within the configured timeout
    Timeout,
    /// Connection refused, reset, or DNS failure
    Connection,
    /// The marketplace refused the request (403, 429, captcha page)
    Blocked,
    /// The page arrived but did not have the expected structure
    Extraction,
}

impl TransientKind {
    /// Whether the egress identity that made the call should be dropped.
    pub fn implicates_egress(self) -> bool {
        matches!(self, Self::Timeout | Self::Connection | Self::Blocked)
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Blocked => "blocked",
            Self::Extraction => "extraction",
        };
        f.write_str(label)
    }
}

/// Errors raised while crawling.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Worth retrying, within a bounded budget
    #[error("transient {kind} error: {message}")]
    Transient { kind: TransientKind, message: String },

    /// The marketplace (or geocoder) confirms the thing does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Nothing the crawl can do about it
    #[error("fatal: {0}")]
    Fatal(String),

    /// The session was cancelled while the call waited for an egress identity
    #[error("cancelled")]
    Cancelled,

    /// Persistence failed
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl CrawlError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Kind of a transient error, `None` for everything else.
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            Self::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransientKind::Timeout
        } else if err.is_decode() {
            TransientKind::Extraction
        } else {
            TransientKind::Connection
        };
        Self::transient(kind, err.to_string())
    }
}

/// Errors raised by a [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {key} does not exist")]
    Missing { entity: &'static str, key: String },

    #[error("corrupt {entity} row: {reason}")]
    Corrupt { entity: &'static str, reason: String },
}

impl StoreError {
    pub fn missing(entity: &'static str, key: impl ToString) -> Self {
        Self::Missing {
            entity,
            key: key.to_string(),
        }
    }
}

/// Result type alias for crawl operations.
pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
