//! Core error type shared by every console operation.
//!
//! # Purpose
//! Each failure carries an [`ErrorKind`] (what the caller can do about it) and a
//! user-safe message. Driver or crypto details are captured separately in
//! `detail` for logs and never reach the browser.
use crate::auth::sealer::SealError;
use crate::backend::BackendError;
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected WHERE fragment, unknown column.
    Validation,
    /// Login failed, cookie tampered or expired, session unknown.
    Auth,
    /// Login succeeded at the backend but the role can see nothing.
    NoResources,
    /// The access cache says the role may not do this.
    GateDenied,
    /// The backend refused an operation the gate approved.
    BackendDenied,
    /// Pool exhausted, network failure, timeout, or a backend statement error.
    BackendUnavailable,
    NotFound,
    /// Duplicate active transaction.
    Conflict,
    /// An update or delete matched no row at commit time.
    StaleRow,
    /// The transaction is committing.
    Busy,
    /// The transaction deadline passed.
    Expired,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NoResources => "no_resources",
            ErrorKind::GateDenied => "gate_denied",
            ErrorKind::BackendDenied => "backend_denied",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StaleRow => "stale_row",
            ErrorKind::Busy => "busy",
            ErrorKind::Expired => "expired",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds that belong to the `auth` family and force a re-login.
    pub fn is_auth(self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::NoResources)
    }

    /// Kinds that belong to the `conflict` family.
    pub fn is_conflict(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::StaleRow | ErrorKind::Busy)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .kind.code())]
pub struct ConsoleError {
    pub kind: ErrorKind,
    pub message: String,
    /// Underlying cause, for logs only.
    pub detail: Option<String>,
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

impl ConsoleError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn gate_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::GateDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expired, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "operation canceled")
    }

    /// Invariant violation. Always logged at the point of construction.
    pub fn internal(message: impl Into<String>) -> Self {
        let err = Self::new(ErrorKind::Internal, message);
        tracing::error!(message = %err.message, "internal invariant violation");
        err
    }
}

impl From<BackendError> for ConsoleError {
    fn from(err: BackendError) -> Self {
        let kind = match &err {
            BackendError::AuthFailed => ErrorKind::Auth,
            BackendError::Denied(_) => ErrorKind::BackendDenied,
            BackendError::Canceled => ErrorKind::Canceled,
            BackendError::Unavailable(_) | BackendError::Query(_) => ErrorKind::BackendUnavailable,
        };
        let message = match kind {
            ErrorKind::Auth => "login failed",
            ErrorKind::BackendDenied => "the database refused this operation",
            ErrorKind::Canceled => "operation canceled",
            _ => "the database reported an error",
        };
        ConsoleError::new(kind, message).with_detail(err)
    }
}

impl From<SealError> for ConsoleError {
    fn from(err: SealError) -> Self {
        ConsoleError::auth("session is no longer valid, please log in again").with_detail(err)
    }
}
