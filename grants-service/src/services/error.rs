use service_core::error::AppError;
use thiserror::Error;

/// Every failure a [`Storer`](super::Storer) can report.
///
/// All variants but `Backend` are part of the storage contract and are
/// identical across backends.
#[derive(Error, Debug)]
pub enum GrantError {
    #[error("grant not found")]
    NotFound,

    #[error("grant with that ID already exists")]
    AlreadyExists,

    #[error("grant source already used to generate a grant, cannot be used to create another grant")]
    SourceAlreadyUsed,

    #[error("grant already used, cannot be exchanged again")]
    AlreadyUsed,

    #[error("grant revoked, cannot be used")]
    Revoked,

    #[error("invalid grant: {0}")]
    Invalid(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl GrantError {
    /// True for the state conflicts a caller can act on (duplicate ID, reused
    /// source, terminal state).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            GrantError::AlreadyExists
                | GrantError::SourceAlreadyUsed
                | GrantError::AlreadyUsed
                | GrantError::Revoked
        )
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            GrantError::NotFound => "not_found",
            GrantError::AlreadyExists => "already_exists",
            GrantError::SourceAlreadyUsed => "source_already_used",
            GrantError::AlreadyUsed => "already_used",
            GrantError::Revoked => "revoked",
            GrantError::Invalid(_) => "invalid_grant",
            GrantError::Backend(_) => "backend_error",
        }
    }

    pub(crate) fn backend(err: impl Into<anyhow::Error>) -> Self {
        GrantError::Backend(err.into())
    }
}

impl From<GrantError> for AppError {
    fn from(err: GrantError) -> Self {
        match err {
            GrantError::NotFound => AppError::NotFound(anyhow::anyhow!("Grant not found")),
            GrantError::Invalid(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            GrantError::Backend(e) => AppError::DatabaseError(e),
            e @ (GrantError::AlreadyExists
            | GrantError::SourceAlreadyUsed
            | GrantError::AlreadyUsed
            | GrantError::Revoked) => AppError::Conflict(anyhow::anyhow!(e.to_string())),
        }
    }
}
