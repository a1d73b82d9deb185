use crate::rate_limit::RateLimitExceeded;
use thiserror::Error;
use vellum_codec::CryptoError;
use vellum_models::audit::ChainBreak;
use vellum_models::gateway::{
    ERR_ACCESS_DENIED, ERR_BAD_REQUEST, ERR_CONFLICT, ERR_EDIT_WINDOW_EXPIRED, ERR_INTERNAL,
    ERR_NOT_FOUND, ERR_RATE_LIMITED,
};
use vellum_models::{InvalidArgument, TenantId};
use vellum_util::validation::ValidationError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error("edit window of {window_minutes} minutes has expired")]
    EditWindowExpired { window_minutes: i64 },
    #[error("encryption failed: {0}")]
    Encryption(CryptoError),
    #[error("decryption failed: {0}")]
    Decryption(CryptoError),
    #[error(transparent)]
    Integrity(#[from] ChainBreak),
    #[error("audit chain for tenant {0} is frozen")]
    ChainFrozen(TenantId),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(vellum_db::DbError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<vellum_db::DbError> for CoreError {
    fn from(err: vellum_db::DbError) -> Self {
        match err {
            vellum_db::DbError::NotFound => Self::NotFound,
            other => Self::Database(other),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(vellum_db::DbError::Sqlx(err))
    }
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<InvalidArgument> for CoreError {
    fn from(err: InvalidArgument) -> Self {
        Self::BadRequest(err.0)
    }
}

impl CoreError {
    /// Stable `(code, message)` shown to clients. Crypto, integrity and
    /// storage failures collapse into one generic reason.
    pub fn client_reason(&self) -> (&'static str, String) {
        match self {
            Self::NotFound => (ERR_NOT_FOUND, "not found".into()),
            Self::AccessDenied => (ERR_ACCESS_DENIED, "not a participant".into()),
            Self::RateLimited(e) => (
                ERR_RATE_LIMITED,
                format!("rate limited, retry in {}s", e.retry_after),
            ),
            Self::EditWindowExpired { window_minutes } => (
                ERR_EDIT_WINDOW_EXPIRED,
                format!("messages can only be edited within {window_minutes} minutes"),
            ),
            Self::BadRequest(msg) => (ERR_BAD_REQUEST, msg.clone()),
            Self::Conflict(msg) => (ERR_CONFLICT, msg.clone()),
            Self::Encryption(_)
            | Self::Decryption(_)
            | Self::Integrity(_)
            | Self::ChainFrozen(_)
            | Self::Database(_)
            | Self::Internal(_) => (ERR_INTERNAL, "internal error".into()),
        }
    }

    /// Unique-constraint violations surface as `Conflict` instead of a
    /// storage failure.
    pub fn from_insert(err: vellum_db::DbError, what: &str) -> Self {
        match &err {
            vellum_db::DbError::Sqlx(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Self::Conflict(format!("{what} already exists"))
            }
            _ => err.into(),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited(e) => Some(e.retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_failures_do_not_leak_detail() {
        let err = CoreError::Decryption(CryptoError::UnknownKey("t1-v1".into()));
        let (code, message) = err.client_reason();
        assert_eq!(code, ERR_INTERNAL);
        assert!(!message.contains("t1-v1"));

        let err = CoreError::Integrity(ChainBreak {
            tenant_id: 1,
            record_id: 4,
            expected_hash: "aa".into(),
            actual_hash: "bb".into(),
        });
        assert_eq!(err.client_reason().0, ERR_INTERNAL);
    }

    #[test]
    fn rate_limit_carries_retry_hint() {
        let err = CoreError::RateLimited(RateLimitExceeded {
            limit: 3,
            window_seconds: 60,
            scope: "user:1".into(),
            retry_after: 12,
        });
        assert_eq!(err.retry_after_secs(), Some(12));
        assert_eq!(err.client_reason().0, ERR_RATE_LIMITED);
        assert_eq!(CoreError::AccessDenied.retry_after_secs(), None);
    }

    #[test]
    fn storage_errors_are_prefixed_once() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        let text = err.to_string();
        assert!(text.starts_with("database error: "));
        assert_eq!(text.matches("database error").count(), 1);
        assert!(matches!(CoreError::from(vellum_db::DbError::NotFound), CoreError::NotFound));
    }
}
