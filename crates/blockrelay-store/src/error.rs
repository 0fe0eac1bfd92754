use blockrelay_core::errors::{FlagError, HistoryError, LogError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// The database was locked by another writer; retrying may succeed.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Busy(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for HistoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => HistoryError::NotFound(what),
            other => HistoryError::Backend(other.to_string()),
        }
    }
}

impl From<StoreError> for LogError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => LogError::NotFound(what),
            StoreError::Busy(msg) => LogError::Backend {
                message: msg,
                transient: true,
            },
            other => LogError::Backend {
                message: other.to_string(),
                transient: false,
            },
        }
    }
}

impl From<StoreError> for FlagError {
    fn from(e: StoreError) -> Self {
        FlagError::Backend(e.to_string())
    }
}
