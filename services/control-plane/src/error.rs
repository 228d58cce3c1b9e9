//! Domain error taxonomy shared by every component and the command surface.

use thiserror::Error;

use crate::store::StoreError;

/// Result alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by control-plane operations.
///
/// Validation, duplicate and budget errors are never retried; they are
/// returned to the caller as-is. Connectivity errors are only produced after
/// local retries are exhausted.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input to a mutating operation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown account, node, budget or service.
    #[error("not found: {0}")]
    NotFound(String),

    /// Registration of a name that already exists.
    #[error("already exists: {0}")]
    Duplicate(String),

    /// Vendor, scheduler or network endpoint unreachable.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Provisioning denied by the budget enforcer.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Unexpected store or transaction failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Data-less discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Duplicate,
    Connectivity,
    BudgetExceeded,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Duplicate => "duplicate",
            Self::Connectivity => "connectivity",
            Self::BudgetExceeded => "budget-exceeded",
            Self::Internal => "internal",
        }
    }

    /// Stable process exit code for scripts.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation => 2,
            Self::NotFound => 3,
            Self::Duplicate => 4,
            Self::Connectivity => 5,
            Self::BudgetExceeded => 6,
            Self::Internal => 10,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Human-readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Validation(r)
            | Self::NotFound(r)
            | Self::Duplicate(r)
            | Self::Connectivity(r)
            | Self::BudgetExceeded(r)
            | Self::Internal(r) => r,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Duplicate(what) => Self::Duplicate(what),
            StoreError::Invalid(what) => Self::Validation(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Duplicate,
            ErrorKind::Connectivity,
            ErrorKind::BudgetExceeded,
            ErrorKind::Internal,
        ];

        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_store_error_mapping() {
        let err: Error = StoreError::NotFound("node rcc-aws-t1-001".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.reason(), "node rcc-aws-t1-001");

        let err: Error = StoreError::Duplicate("account rcc-aws".into()).into();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }
}
