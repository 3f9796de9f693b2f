use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session id already used: {0}")]
    Duplicate(String),

    #[error("Owner {owner} already holds {limit} sessions")]
    LimitReached { owner: String, limit: usize },
}
