//! Error taxonomy shared by the adapters, the indexer, and the retriever.
//!
//! Every failure that can reach the calling assistant is a [`KbError`]. The
//! assistant renders errors to an end user, so each variant carries a stable
//! machine-readable [`kind`](KbError::kind) plus a human-readable message and
//! is serialized as an [`ErrorBody`], never as a backtrace.
//!
//! | Kind | Raised when | Retryable |
//! |------|-------------|-----------|
//! | `source_unavailable` | Upstream unreachable or credential rejected | yes |
//! | `permission_denied` | Bot is not a member of a channel | no |
//! | `rate_limited` | Upstream throttled the request | yes |
//! | `embedding_failed` | Embedding model failed after all retries | no |
//! | `index_unavailable` | Index missing, corrupt, or built with another model | no |
//! | `index_busy` | The index file is locked or the pool is exhausted | yes |
//! | `ingestion_in_progress` | Another writer holds the index | no |
//! | `configuration_error` | A required setting is missing or invalid | no |
//! | `not_found` | Unknown document, source, or tool | no |
//! | `invalid_request` | Malformed operation input | no |

use serde::Serialize;
use thiserror::Error;

/// Errors returned by knowledge-base operations.
#[derive(Debug, Error)]
pub enum KbError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Seconds the upstream asked us to wait, when it said so.
        retry_after: Option<u64>,
    },

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("index busy: {0}")]
    IndexBusy(String),

    #[error("ingestion already in progress (held by {holder})")]
    IngestionInProgress { holder: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result alias for knowledge-base operations.
pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    /// Stable snake_case code used in structured responses.
    pub fn kind(&self) -> &'static str {
        match self {
            KbError::SourceUnavailable(_) => "source_unavailable",
            KbError::PermissionDenied(_) => "permission_denied",
            KbError::RateLimited { .. } => "rate_limited",
            KbError::EmbeddingFailed(_) => "embedding_failed",
            KbError::IndexUnavailable(_) => "index_unavailable",
            KbError::IndexBusy(_) => "index_busy",
            KbError::IngestionInProgress { .. } => "ingestion_in_progress",
            KbError::Configuration(_) => "configuration_error",
            KbError::NotFound(_) => "not_found",
            KbError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KbError::SourceUnavailable(_) | KbError::RateLimited { .. } | KbError::IndexBusy(_)
        )
    }

    /// Structured form sent to callers.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Primary SQLite result code of a database error (extended codes folded).
pub fn sqlite_code(err: &sqlx::Error) -> Option<i32> {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff),
        _ => None,
    }
}

/// Whether `err` says the index file itself is damaged.
pub fn is_corruption(err: &sqlx::Error) -> bool {
    matches!(sqlite_code(err), Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB))
}

impl From<sqlx::Error> for KbError {
    fn from(err: sqlx::Error) -> Self {
        match (&err, sqlite_code(&err)) {
            (sqlx::Error::PoolTimedOut, _)
            | (_, Some(SQLITE_BUSY))
            | (_, Some(SQLITE_LOCKED)) => KbError::IndexBusy(err.to_string()),
            _ => KbError::IndexUnavailable(err.to_string()),
        }
    }
}

/// Serialized error shape: `{ "kind": "...", "message": "..." }`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Classify an arbitrary error chain, falling back to `internal`.
pub fn error_body(err: &anyhow::Error) -> ErrorBody {
    match err.downcast_ref::<KbError>() {
        Some(kb) => kb.to_body(),
        None => ErrorBody {
            kind: "internal".to_string(),
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            KbError::PermissionDenied("x".into()).kind(),
            "permission_denied"
        );
        assert_eq!(
            KbError::Configuration("x".into()).kind(),
            "configuration_error"
        );
        assert_eq!(
            KbError::IngestionInProgress {
                holder: "run".into()
            }
            .kind(),
            "ingestion_in_progress"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(KbError::SourceUnavailable("down".into()).is_retryable());
        assert!(KbError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(3)
        }
        .is_retryable());
        assert!(!KbError::PermissionDenied("not_in_channel".into()).is_retryable());
        assert!(!KbError::EmbeddingFailed("boom".into()).is_retryable());
        assert!(KbError::IndexBusy("locked".into()).is_retryable());
        assert!(!KbError::IndexUnavailable("gone".into()).is_retryable());
    }

    #[test]
    fn test_sqlx_errors_split_busy_from_unavailable() {
        let busy = KbError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(busy.kind(), "index_busy");
        assert!(busy.is_retryable());

        let closed = KbError::from(sqlx::Error::PoolClosed);
        assert_eq!(closed.kind(), "index_unavailable");
        assert!(!is_corruption(&sqlx::Error::PoolClosed));

        let missing = KbError::from(sqlx::Error::RowNotFound);
        assert_eq!(missing.kind(), "index_unavailable");
    }

    #[test]
    fn test_error_body_downcasts() {
        let err = anyhow::Error::new(KbError::NotFound("doc".into()));
        let body = error_body(&err);
        assert_eq!(body.kind, "not_found");
        assert_eq!(body.message, "not found: doc");

        let other = anyhow::anyhow!("something odd");
        assert_eq!(error_body(&other).kind, "internal");
    }
}
