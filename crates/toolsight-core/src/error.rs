//! Crate-wide error taxonomy
//!
//! Components return this error so the pipeline and the transport can
//! pattern-match on kind instead of unwinding. An empty search result is a
//! value, never an error.

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Error kinds shared across the service
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Image URL/path cannot be fetched or decoded; surfaced to the user
    #[error("image source unreadable: {0}")]
    SourceUnreadable(String),
    /// Embedding forward pass raised; surfaced as a generic processing failure
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    /// Token bucket empty; surfaced with a retry hint
    #[error("rate limited, retry in {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the next request is expected to pass admission
        retry_after_seconds: u64,
    },
    /// Pipeline queue full; surfaced with a generic retry
    #[error("pipeline overloaded, try again later")]
    Overloaded,
    /// A per-stage or total budget was exceeded; partial work is discarded
    #[error("timed out during {stage}")]
    Timeout {
        /// The stage that ran out of budget
        stage: &'static str,
    },
    /// The transport signalled cancellation; no partial result is returned
    #[error("request cancelled")]
    Cancelled,
    /// Session / item / model missing
    #[error("not found: {0}")]
    NotFound(String),
    /// The trainer cannot proceed with the available examples
    #[error("insufficient training data: have {available}, need {needed}")]
    InsufficientData {
        /// Unconsumed usable examples on hand
        available: usize,
        /// Minimum required to start a session
        needed: usize,
    },
    /// A new artifact was saved but not activated; needs manual reconciliation
    #[error("model {version} saved but not promoted: {reason}")]
    PartialPromotion {
        /// Version of the orphaned artifact
        version: String,
        /// What went wrong after the save
        reason: String,
    },
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be read or parsed
    #[error("config error: {0}")]
    Config(String),
    /// Invariant violation; logged at error and surfaced generically
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::embedding::EmbedError> for Error {
    fn from(e: crate::embedding::EmbedError) -> Self {
        use crate::embedding::EmbedError;
        match e {
            EmbedError::SourceUnreadable(msg) | EmbedError::DecodeFailed(msg) => {
                Error::SourceUnreadable(msg)
            }
            EmbedError::InferenceFailed(msg) => Error::InferenceFailed(msg),
            EmbedError::ModelLoad(msg) => Error::InferenceFailed(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {e}"))
    }
}

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure is safe to show to an end user verbatim
    pub fn user_visible(&self) -> bool {
        matches!(
            self,
            Error::SourceUnreadable(_)
                | Error::RateLimited { .. }
                | Error::Overloaded
                | Error::Timeout { .. }
                | Error::Cancelled
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
