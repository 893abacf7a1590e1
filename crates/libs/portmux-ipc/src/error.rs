use serde::{Deserialize, Serialize};

/// Boxed error returned by a [`ChannelHandler`](crate::ChannelHandler).
///
/// Handlers may fail with anything; [`IpcError`] values keep their code on
/// the wire, everything else is reported as [`ErrorCode::Unknown`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error kinds carried by the structured error payload.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorCode {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    Unimplemented,
    Internal,
    Unavailable,
    Aborted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::Unauthenticated => "unauthenticated",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a handler can raise with a stable, wire-visible code.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum IpcError {
    #[error("canceled: {reason}")]
    Canceled { reason: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("not implemented: {method}")]
    Unimplemented { method: String },

    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("aborted: {reason}")]
    Aborted { reason: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl IpcError {
    /// The wire code this error is reported with.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Canceled { .. } => ErrorCode::Canceled,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::Unauthenticated { .. } => ErrorCode::Unauthenticated,
            Self::Unimplemented { .. } => ErrorCode::Unimplemented,
            Self::Unavailable { .. } => ErrorCode::Unavailable,
            Self::Aborted { .. } => ErrorCode::Aborted,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::Canceled {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }
}

/// Failures of the duplex channel primitive.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("channel closed: {name}")]
    Closed { name: String },

    #[error("channel refused: {name}: {reason}")]
    Refused { name: String, reason: String },

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChannelError {
    /// `true` when the failure only means the other side went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}
