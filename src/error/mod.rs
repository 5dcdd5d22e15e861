use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

mod kind;

pub use kind::ErrorKind;

/// A structured error that travels unmodified from the core to the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code, `KIND/DETAIL`.
    pub code: String,
    /// Human friendly message.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "INTERNAL/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "INTERNAL/GENERIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Taxonomy bucket derived from the code prefix.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(&self.code)
    }

    /// Whether the caller may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("STORE_UNAVAILABLE/IO_{:?}", error.kind()).to_ascii_uppercase();
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "VALIDATION/JSON_DATA"
        } else if error.is_syntax() {
            "VALIDATION/JSON_SYNTAX"
        } else if error.is_eof() {
            "VALIDATION/JSON_EOF"
        } else {
            "INTERNAL/JSON"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

// SQLite primary result codes that mean "try again later".
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("NOT_FOUND/ROW", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("INTERNAL/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "STORE_UNAVAILABLE/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => {
                AppError::new("STORE_UNAVAILABLE/POOL_CLOSED", "Database pool is closed")
            }
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let sqlite_code = db.code().map(|code| code.to_string());
                let message = db.message().to_string();
                let mut app_error = if sqlite_code
                    .as_deref()
                    .is_some_and(|code| SQLITE_BUSY_CODES.contains(&code))
                {
                    AppError::new("STORE_UNAVAILABLE/BUSY", "The store is busy; retry later.")
                } else if db.is_unique_violation() {
                    AppError::new("CONFLICT/UNIQUE", "Unique constraint violated")
                } else if db.is_foreign_key_violation() {
                    AppError::new("CONFLICT/FOREIGN_KEY", "Foreign key constraint violated")
                } else if db.is_check_violation() {
                    AppError::new("VALIDATION/CHECK", "Value rejected by a store constraint")
                } else {
                    AppError::new("INTERNAL/DATABASE", message.clone())
                };
                app_error = app_error.with_context("store_message", message);
                if let Some(code) = sqlite_code {
                    app_error = app_error.with_context("store_code", code);
                }
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint.to_string());
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new("INTERNAL/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            SqlxError::Decode(decode_err) => {
                AppError::new("INTERNAL/DECODE", decode_err.to_string())
            }
            other => AppError::new("INTERNAL/SQLX", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("VALIDATION/INVALID_FIELD", "Something went wrong")
            .with_context("field", "points")
            .with_context("id", "1234")
            .with_cause(AppError::from("inner failure"));

        assert_eq!(error.code(), "VALIDATION/INVALID_FIELD");
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(error.context().get("field"), Some(&"points".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
        assert_eq!(cause.kind(), ErrorKind::Internal);
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to save ledger")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "failed to save ledger");

        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn converts_anyhow_preserves_existing_app_error() {
        let inner = AppError::new("CONFLICT/SLUG_TAKEN", "nope").with_context("field", "slug");
        let converted = AppError::from(AnyhowError::from(inner.clone()));
        assert_eq!(converted, inner);
    }

    #[test]
    fn sqlx_row_not_found_is_not_found_kind() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn pool_timeouts_are_retryable() {
        let app_error = AppError::from(SqlxError::PoolTimedOut);
        assert_eq!(app_error.kind(), ErrorKind::StoreUnavailable);
        assert!(app_error.is_retryable());
        assert!(!AppError::new("CONFLICT/UNIQUE", "dup").is_retryable());
    }

    #[test]
    fn io_errors_map_to_store_unavailable() {
        let app_error = AppError::from(IoError::from_raw_os_error(2));
        assert_eq!(app_error.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn json_shape_is_flat_struct() {
        let error =
            AppError::new("VALIDATION/INVALID_FIELD", "nope").with_context("field", "name");
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(
            value.get("code").and_then(|v| v.as_str()),
            Some("VALIDATION/INVALID_FIELD")
        );
        assert_eq!(
            value
                .get("context")
                .and_then(|c| c.get("field"))
                .and_then(|v| v.as_str()),
            Some("name")
        );
        assert!(value.get("cause").is_none());
    }
}
