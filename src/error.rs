use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Channel,
    Contact,
    Msg,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Entity::Channel => "channel",
            Entity::Contact => "contact",
            Entity::Msg => "msg",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{entity} not found: {detail}")]
    NotFound { entity: Entity, detail: String },

    #[error("channel {uuid} is of type {actual}, expected {expected}")]
    WrongType {
        uuid: String,
        expected: String,
        actual: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed record: {0}")]
    Malformed(String),

    // A bug or schema mismatch; retrying cannot help.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn not_found(entity: Entity, detail: impl Into<String>) -> Self {
        BackendError::NotFound {
            entity,
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Conflict(_))
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => BackendError::not_found(Entity::Msg, "row not found"),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                BackendError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => BackendError::Internal(err.to_string()),
            _ => BackendError::Unavailable(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        BackendError::Unavailable(format!("fast store: {err}"))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Malformed(err.to_string())
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Unavailable(format!("io: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for BackendError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BackendError::Unavailable("deadline exceeded".to_string())
    }
}
