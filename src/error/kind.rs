use std::fmt;

use serde::Serialize;

use super::AppError;

/// Stable taxonomy bucket of an [`AppError`], taken from the `KIND/` code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    NotFound,
    Forbidden,
    /// The child is not assigned (or not enabled) on the routine.
    UnassignedChild,
    /// Illegal state transition.
    InvalidState,
    /// Unique constraint or status-transition conflict.
    Conflict,
    InsufficientBalance,
    /// Transient store failure. Retryable by the caller.
    StoreUnavailable,
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Validation,
        ErrorKind::NotFound,
        ErrorKind::Forbidden,
        ErrorKind::UnassignedChild,
        ErrorKind::InvalidState,
        ErrorKind::Conflict,
        ErrorKind::InsufficientBalance,
        ErrorKind::StoreUnavailable,
        ErrorKind::Internal,
    ];

    /// Returns the stable machine-readable prefix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::UnassignedChild => "UNASSIGNED_CHILD",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// HTTP-equivalent status the API layer should answer with.
    #[must_use]
    pub fn status_hint(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden | ErrorKind::UnassignedChild => 403,
            ErrorKind::InvalidState | ErrorKind::Conflict => 409,
            ErrorKind::InsufficientBalance => 422,
            ErrorKind::StoreUnavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Parses the `KIND` prefix of a `KIND/DETAIL` code. Unknown prefixes are internal.
    #[must_use]
    pub fn from_code(code: &str) -> ErrorKind {
        let prefix = code.split('/').next().unwrap_or_default();
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == prefix)
            .unwrap_or(ErrorKind::Internal)
    }

    /// Whether the failure was caused by the caller rather than the store.
    #[must_use]
    pub fn is_caller_error(self) -> bool {
        !matches!(self, ErrorKind::StoreUnavailable | ErrorKind::Internal)
    }

    #[must_use]
    pub fn error(self, detail: &str, message: impl Into<String>) -> AppError {
        AppError::new(format!("{}/{}", self.as_str(), detail), message)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    /// Validation failure naming the offending field.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        ErrorKind::Validation
            .error("INVALID_FIELD", message)
            .with_context("field", field)
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        ErrorKind::NotFound
            .error(&entity.to_ascii_uppercase(), format!("{entity} not found"))
            .with_context("entity", entity)
            .with_context("id", id)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ErrorKind::Forbidden.error("DENIED", message)
    }

    pub fn unassigned_child(routine_id: &str, child_profile_id: &str) -> Self {
        ErrorKind::UnassignedChild
            .error(
                "NOT_ASSIGNED",
                "Child is not assigned to this routine",
            )
            .with_context("routine_id", routine_id)
            .with_context("child_profile_id", child_profile_id)
    }

    pub fn conflict(detail: &str, message: impl Into<String>) -> Self {
        ErrorKind::Conflict.error(detail, message)
    }

    pub fn insufficient_balance(balance: i64, requested: i64) -> Self {
        ErrorKind::InsufficientBalance
            .error("NEGATIVE_RESULT", "Not enough points for this transaction")
            .with_context("balance", balance.to_string())
            .with_context("points_delta", requested.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_code_prefix() {
        for kind in ErrorKind::ALL {
            let err = kind.error("SOMETHING", "msg");
            assert_eq!(err.kind(), kind, "{}", err.code());
        }
    }

    #[test]
    fn unknown_prefix_is_internal() {
        assert_eq!(ErrorKind::from_code("E_TZ_UNKNOWN"), ErrorKind::Internal);
        assert_eq!(ErrorKind::from_code(""), ErrorKind::Internal);
    }

    #[test]
    fn status_hints_cover_the_taxonomy() {
        assert_eq!(ErrorKind::Validation.status_hint(), 400);
        assert_eq!(ErrorKind::UnassignedChild.status_hint(), 403);
        assert_eq!(ErrorKind::InvalidState.status_hint(), 409);
        assert_eq!(ErrorKind::StoreUnavailable.status_hint(), 503);
    }

    #[test]
    fn validation_errors_name_the_field() {
        let err = AppError::validation("pointsDelta", "must not be zero");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.context().get("field").map(String::as_str), Some("pointsDelta"));
    }

    #[test]
    fn not_found_carries_entity_and_id() {
        let err = AppError::not_found("routine_session", "abc");
        assert_eq!(err.code(), "NOT_FOUND/ROUTINE_SESSION");
        assert_eq!(err.context().get("id").map(String::as_str), Some("abc"));
    }
}
