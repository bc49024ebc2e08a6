use std::fmt;

/// Stable error taxonomy for the memory substrate (see design notes, `§7`).
///
/// Every public operation on the core returns `Result<_, Error>`. Transports
/// map these variants onto their own status codes; the core itself never
/// interprets them further.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("internal invariant broken: {0}")]
    Internal(String),
}

impl Error {
    /// The stable tag used by transports to render a response code. Kept
    /// separate from `Display` because the latter carries free-form context
    /// that should never be pattern-matched on.
    pub fn tag(&self) -> ErrorTag {
        match self {
            Error::InvalidInput(_) => ErrorTag::InvalidInput,
            Error::SchemaViolation(_) => ErrorTag::SchemaViolation,
            Error::NotFound(_) => ErrorTag::NotFound,
            Error::Conflict(_) => ErrorTag::Conflict,
            Error::QuotaExceeded(_) => ErrorTag::QuotaExceeded,
            Error::Unavailable(_) => ErrorTag::Unavailable,
            Error::DeadlineExceeded(_) => ErrorTag::DeadlineExceeded,
            Error::Internal(_) => ErrorTag::Internal,
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn invalid(what: impl fmt::Display) -> Self {
        Error::InvalidInput(what.to_string())
    }

    pub fn internal(what: impl fmt::Display) -> Self {
        Error::Internal(what.to_string())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    InvalidInput,
    SchemaViolation,
    NotFound,
    Conflict,
    QuotaExceeded,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Unavailable(other.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
