use std::fmt;
use std::path::PathBuf;

/// Store failures classified so the dispatcher can tell a uniqueness
/// violation from a missing row from transient lock contention.
#[derive(Debug)]
pub enum StoreError {
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    Constraint {
        message: String,
    },
    NotFound {
        message: String,
    },
    Busy {
        message: String,
    },
    Misuse {
        message: String,
    },
    Sqlite(rusqlite::Error),
}

impl StoreError {
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }

    /// Classifies a raw rusqlite failure by its native result code.
    pub fn from_sqlite(source: rusqlite::Error) -> Self {
        match source {
            rusqlite::Error::SqliteFailure(inner, detail) => {
                let message = detail.unwrap_or_else(|| inner.to_string());
                match inner.code {
                    rusqlite::ErrorCode::ConstraintViolation => Self::Constraint { message },
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                        Self::Busy { message }
                    }
                    _ => Self::Sqlite(rusqlite::Error::SqliteFailure(inner, Some(message))),
                }
            }
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound {
                message: "no matching row".to_owned(),
            },
            other => Self::Sqlite(other),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "failed to open store at '{}': {source}", path.display())
            }
            Self::Constraint { message } => write!(f, "constraint violation: {message}"),
            Self::NotFound { message } => write!(f, "not found: {message}"),
            Self::Busy { message } => write!(f, "store busy: {message}"),
            Self::Misuse { message } => write!(f, "invalid store request: {message}"),
            Self::Sqlite(source) => write!(f, "store error: {source}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        Self::from_sqlite(source)
    }
}
