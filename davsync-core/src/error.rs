use std::io;

use thiserror::Error;

const STATUS_UNAUTHORIZED: u16 = 401;
const STATUS_FORBIDDEN: u16 = 403;
const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
const STATUS_REQUEST_TIMEOUT: u16 = 408;
const STATUS_CONFLICT: u16 = 409;
const STATUS_TOO_EARLY: u16 = 425;
const STATUS_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("request was canceled")]
    Canceled,
    #[error("reply was dropped before completion")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    /// The target already exists. For directory creation this is success.
    AlreadyExists,
    Transient,
    Permanent,
}

impl DavError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        DavError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn classification(&self) -> Option<ErrorClass> {
        match self {
            DavError::Status { status, .. } => Some(classify_status(*status)),
            DavError::Transport(_) | DavError::Io(_) | DavError::Disconnected => {
                Some(ErrorClass::Transient)
            }
            DavError::Canceled => None,
        }
    }

    /// MKCOL on an existing collection answers "405 Method Not Allowed".
    pub fn is_idempotent_conflict(&self) -> bool {
        self.classification() == Some(ErrorClass::AlreadyExists)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, DavError::Canceled)
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == Some(ErrorClass::Transient)
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        STATUS_UNAUTHORIZED | STATUS_FORBIDDEN => ErrorClass::Auth,
        STATUS_METHOD_NOT_ALLOWED => ErrorClass::AlreadyExists,
        STATUS_REQUEST_TIMEOUT | STATUS_CONFLICT | STATUS_TOO_EARLY | STATUS_TOO_MANY_REQUESTS => {
            ErrorClass::Transient
        }
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_allowed_is_idempotent_conflict() {
        let err = DavError::status(405, "Method Not Allowed");
        assert!(err.is_idempotent_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(DavError::status(503, "Service Unavailable").is_retryable());
        assert!(DavError::Transport("connection reset".into()).is_retryable());
        assert_eq!(
            DavError::status(401, "Unauthorized").classification(),
            Some(ErrorClass::Auth)
        );
        assert_eq!(
            DavError::status(404, "Not Found").classification(),
            Some(ErrorClass::Permanent)
        );
    }

    #[test]
    fn cancellation_is_never_classified() {
        assert!(DavError::Canceled.is_canceled());
        assert_eq!(DavError::Canceled.classification(), None);
        assert!(!DavError::Canceled.is_idempotent_conflict());
    }
}
