pub mod api_key;
pub mod model;
pub mod team;
pub mod upload;
pub mod user;

pub use bazaar_service_base::repo::RepoError;

/// Outcome of a guarded state-machine transition executed under a row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome<S> {
    Applied { from: S },
    /// Row already carries the requested status.
    Unchanged,
    Refused { current: S },
    NotFound,
}

pub(crate) fn decode_error(message: impl Into<String>) -> RepoError {
    RepoError::Internal(sqlx::Error::Decode(message.into().into()))
}
