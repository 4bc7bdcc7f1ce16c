//! Error types for the orchestration core.

use thiserror::Error;

/// Main error type for scan, download and batch operations.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Operation failed: {message}")]
    Operation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    /// Wraps a collaborator failure that carries no underlying error value.
    pub fn operation(message: impl Into<String>) -> Self {
        TaskError::Operation {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a collaborator failure together with its cause.
    pub fn operation_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Operation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Stable machine-readable code, shared by the raised error and the
    /// emitted `ServiceError` record.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::Validation(_) => "VALIDATION_ERROR",
            TaskError::Conflict(_) => "CONFLICT_ERROR",
            TaskError::InvalidState(_) => "INVALID_STATE_ERROR",
            TaskError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED_ERROR",
            TaskError::Operation { .. } => "OPERATION_ERROR",
            TaskError::NotFound(_) => "NOT_FOUND_ERROR",
            TaskError::Io(_) => "IO_ERROR",
            TaskError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Structured details for the event channel, when the variant has any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            TaskError::Operation {
                source: Some(source),
                ..
            } => Some(serde_json::json!({ "cause": source.to_string() })),
            TaskError::Io(err) => Some(serde_json::json!({ "kind": format!("{:?}", err.kind()) })),
            _ => None,
        }
    }

    /// Collaborator and I/O failures may succeed when attempted again;
    /// rejections of the request itself never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Operation { .. } | TaskError::Io(_))
    }
}

impl serde::Serialize for TaskError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias for orchestration operations.
pub type TaskResult<T> = Result<T, TaskError>;
