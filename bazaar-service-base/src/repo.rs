use bazaar_common::SafeDisplay;

/// Error surface of the repo layer. Unique-constraint violations are split
/// out so services can map them onto conflict responses instead of 500s.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("database error: {0}")]
    Internal(sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                RepoError::UniqueViolation(db_error.constraint().unwrap_or("unknown").to_string())
            }
            _ => RepoError::Internal(error),
        }
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::UniqueViolation(_) => self.to_string(),
            // connection strings and SQL fragments stay out of client responses
            RepoError::Internal(_) => "internal database error".to_string(),
        }
    }
}
