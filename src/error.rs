//! Top-level error types for hivecore.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Credential verification failures at handshake or consume time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unknown bot: {0}")]
    UnknownBot(String),

    #[error("invalid credential")]
    InvalidCredential,

    #[error("one-time token consumed by a concurrent handshake")]
    Conflict,
}

/// Wire decode failures. All are terminal for the connection that
/// produced them.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,

    #[error("malformed field: {0}")]
    MalformedField(&'static str),

    #[error("unknown payload variant: {0}")]
    UnknownVariant(u8),

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(u8),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure causes surfaced to a dispatch waiter. Dispatch is never
/// retried at this layer; the task manager owns retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no active instance with the required capability")]
    NoCapableInstance,

    #[error("instance left the active state mid-dispatch")]
    InstanceGone,

    #[error("dispatch deadline exceeded")]
    Timeout,

    #[error("dispatch cancelled by caller")]
    Cancelled,

    #[error("instance reported execution error: {0}")]
    ExecutionError(String),

    #[error("instance rejected arguments: {0}")]
    InvalidArguments(String),
}

/// Task manager errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("task {task_id} is already {state} and cannot be cancelled")]
    TerminalState { task_id: uuid::Uuid, state: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
