//! Error taxonomy shared by every keel crate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    #[error("'{id}' is not a valid resource id: {reason}")]
    InvalidResourceId { id: String, reason: String },
    #[error("no plane is registered for provider '{0}'")]
    UnsupportedProvider(String),
    #[error("resource type '{0}' is not supported")]
    UnsupportedResourceType(String),
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
    #[error("dependency '{0}' does not exist")]
    DependencyNotFound(String),
    #[error("{0}")]
    BindingNotFound(String),
    #[error("operation {operation} is already in progress for '{target}'")]
    ConflictingOperation { target: String, operation: String },
    #[error("'{0}' was not found")]
    NotFound(String),
    #[error("{0}")]
    BackendTransient(String),
    #[error("{0}")]
    BackendFatal(String),
    #[error("polling '{token}' did not reach a terminal state within {waited_secs}s")]
    PollTimeout { token: String, waited_secs: u64 },
    #[error("{0}")]
    Validation(String),
    #[error("precondition failed for '{0}'")]
    Conflict(String),
    #[error("operation was canceled")]
    Canceled,
    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidResourceId { id: id.into(), reason: reason.into() }
    }

    /// Only transient backend failures and store conflicts are worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::BackendTransient(_) | Error::Conflict(_))
    }

    /// Stable machine-readable code, used in operation and API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidResourceId { .. } => "InvalidResourceId",
            Error::UnsupportedProvider(_) => "UnsupportedProvider",
            Error::UnsupportedResourceType(_) => "UnsupportedResourceType",
            Error::CyclicDependency(_) => "CyclicDependency",
            Error::DependencyNotFound(_) => "DependencyNotFound",
            Error::BindingNotFound(_) => "BindingNotFound",
            Error::ConflictingOperation { .. } => "ConflictingOperation",
            Error::NotFound(_) => "NotFound",
            Error::BackendTransient(_) => "BackendTransient",
            Error::BackendFatal(_) => "BackendFatal",
            Error::PollTimeout { .. } => "PollTimeout",
            Error::Validation(_) => "BadRequest",
            Error::Conflict(_) => "Conflict",
            Error::Canceled => "Canceled",
            Error::Internal(_) => "Internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Validation(e.to_string()) }
}
