use thiserror::Error;

/// Errors surfaced by the account coordinator and its store adapters.
#[derive(Debug, Error)]
pub enum AccountsError {
    /// A versioned write was rejected because a newer version exists.
    /// Internal: the update engine retries these.
    #[error("contested write: a newer version of the account exists")]
    Contested,

    #[error("username is already taken")]
    UsernameNotAvailable,

    #[error("optimistic update retry limit exceeded")]
    RetryLimitExceeded,

    #[error("interrupted while waiting for an account lease")]
    Interrupted,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode account as JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
