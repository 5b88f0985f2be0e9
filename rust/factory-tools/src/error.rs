use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Failure kinds a tool call can end in.
///
/// None of these reach the caller as a transport fault: the dispatcher
/// renders every variant into the `{error, tool, arguments}` payload.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    RejectedStatement(String),

    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend query failed: {0}")]
    Backend(String),
}

impl ServiceError {
    /// Business-rule rejections the caller can fix by correcting its input.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ServiceError::UnknownTool(_)
                | ServiceError::InvalidArguments(_)
                | ServiceError::RejectedStatement(_)
        )
    }
}

impl From<tokio_postgres::Error> for ServiceError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => ServiceError::Backend(db.message().to_string()),
            None => ServiceError::Backend(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ServiceError::Connection(err.to_string())
        } else {
            ServiceError::Backend(err.to_string())
        }
    }
}
