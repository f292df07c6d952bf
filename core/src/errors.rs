use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanFlowError {
    #[error("Database unavailable")]
    DbUnavailable(#[source] r2d2::Error),
    #[error("Database query failed: {0}")]
    Database(#[source] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Constraint violation: {0}")]
    Conflict(String),
    #[error("Project has no charter to work from")]
    CharterMissing,
    #[error("Job queue error: {0}")]
    Queue(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type PlanFlowResult<T> = Result<T, PlanFlowError>;

impl PlanFlowError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DbUnavailable(_) => "DB-1001",
            Self::Database(_) => "DB-1002",
            Self::NotFound(_) => "REC-1001",
            Self::Validation(_) => "VAL-1001",
            Self::BadRequest(_) => "VAL-1002",
            Self::Conflict(_) => "DB-1009",
            Self::CharterMissing => "CHR-1001",
            Self::Queue(_) => "JOB-1001",
            Self::Unknown(_) => "GEN-1000",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::DbUnavailable(_) => "The application could not obtain a SQLite connection.",
            Self::Database(_) => "A SQL statement failed to execute.",
            Self::NotFound(_) => "No record exists for the requested ID.",
            Self::Validation(_) => "The request payload failed field validation.",
            Self::BadRequest(_) => "The request cannot be served in the current state.",
            Self::Conflict(_) => "The write would break a uniqueness or foreign-key rule.",
            Self::CharterMissing => "Release extraction needs a project charter.",
            Self::Queue(_) => "The background job queue rejected the operation.",
            Self::Unknown(_) => "An unspecified error occurred.",
        }
    }
}

impl From<r2d2::Error> for PlanFlowError {
    fn from(err: r2d2::Error) -> Self {
        Self::DbUnavailable(err)
    }
}

impl From<rusqlite::Error> for PlanFlowError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("Record"),
            rusqlite::Error::SqliteFailure(inner, msg)
                if inner.code == ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(msg.clone().unwrap_or_else(|| inner.to_string()))
            }
            _ => Self::Database(err),
        }
    }
}

impl From<tokio::task::JoinError> for PlanFlowError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_failures_map_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER NOT NULL REFERENCES parent (id));",
        )
        .unwrap();
        let err = conn
            .execute("INSERT INTO child (parent_id) VALUES (42)", [])
            .unwrap_err();
        let mapped = PlanFlowError::from(err);
        assert_eq!(mapped.code(), "DB-1009");
    }

    #[test]
    fn missing_rows_map_to_not_found() {
        let mapped = PlanFlowError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(mapped, PlanFlowError::NotFound(_)));
        assert_eq!(mapped.explain(), "No record exists for the requested ID.");
    }
}
