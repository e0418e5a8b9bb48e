//! Error types for `safekeep-core`.
//!
//! Every error variant carries the offending identifier (safe path, role
//! name, accessor, principal) so the controller layer can map it to a
//! protocol status through [`Error::kind`] without parsing messages. Secret
//! id values never appear in errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use safekeep_storage::StorageError;

use crate::policy::Action;
use crate::transfer::TransferStage;

/// Errors from the pure permission model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The permission string is not one of `deny`, `read`, `write`, `owner`.
    #[error("invalid permission '{raw}'")]
    InvalidPermission { raw: String },

    /// The path is malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Errors returned by a secret store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing is stored at the path.
    #[error("not found in secret store: {path}")]
    NotFound { path: String },

    /// A conditional write lost against a concurrent writer.
    #[error("version conflict on '{path}'")]
    Conflict { path: String },

    /// The store could not be reached or failed internally.
    #[error("secret store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The call did not complete within the configured timeout.
    #[error("secret store call '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A stored record could not be decoded.
    #[error("corrupt record at '{path}': {reason}")]
    Corrupt { path: String, reason: String },
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        Self::Unavailable {
            reason: e.to_string(),
        }
    }
}

/// Errors from audit operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Every configured sink failed to record the event.
    #[error("all audit sinks failed")]
    AllSinksFailed,

    /// A specific sink failed.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// Serialization of the audit event failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Stable, machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Conflict,
    NotEmpty,
    CannotRemoveOwner,
    PartialFailure,
    UpstreamUnavailable,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::InvalidArgument => "invalid_argument",
            Self::Conflict => "conflict",
            Self::NotEmpty => "not_empty",
            Self::CannotRemoveOwner => "cannot_remove_owner",
            Self::PartialFailure => "partial_failure",
            Self::UpstreamUnavailable => "upstream_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Safe,
    Folder,
    Grant,
    AppRole,
    AwsRole,
    Accessor,
    Principal,
    Association,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Safe => "safe",
            Self::Folder => "folder",
            Self::Grant => "grant",
            Self::AppRole => "approle",
            Self::AwsRole => "aws role",
            Self::Accessor => "secret id accessor",
            Self::Principal => "principal",
            Self::Association => "association",
        })
    }
}

/// Outcome of one step of a multi-step operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step name, e.g. `revoke_secret_id:<accessor>`.
    pub step: String,
    /// Whether the step succeeded.
    pub ok: bool,
    /// Failure description when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    #[must_use]
    pub fn ok(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ok: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(step: impl Into<String>, error: &impl fmt::Display) -> Self {
        Self {
            step: step.into(),
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

/// Errors from core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The principal lacks the permission the action requires.
    #[error("{principal} is not permitted to {action} on '{target}'")]
    PermissionDenied {
        principal: String,
        target: String,
        action: Action,
    },

    /// The referenced entity does not exist.
    #[error("{resource} not found: {id}")]
    NotFound { resource: Resource, id: String },

    /// The entity already exists.
    #[error("{resource} already exists: {id}")]
    AlreadyExists { resource: Resource, id: String },

    /// A request parameter is malformed or out of range.
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// Concurrent modification kept winning; safe to retry.
    #[error("concurrent modification of '{path}' after {attempts} attempts")]
    Conflict { path: String, attempts: u32 },

    /// The safe still contains secrets or folders.
    #[error("safe '{path}' is not empty")]
    NotEmpty { path: String },

    /// The grant is the safe's owner grant.
    #[error("cannot remove the owner of safe '{path}'")]
    CannotRemoveOwner { path: String },

    /// A multi-step operation completed some steps but not all.
    #[error("{operation} on '{target}' partially failed ({} of {} steps failed)", failed_steps(.steps), .steps.len())]
    PartialFailure {
        operation: String,
        target: String,
        steps: Vec<StepOutcome>,
    },

    /// The secret store timed out or failed after bounded retries.
    #[error("secret store unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    /// An ownership transfer stopped at `at`. Retrying resumes from there.
    #[error("ownership transfer of '{safe}' failed at {at}: {source}")]
    TransferFailed {
        safe: String,
        at: TransferStage,
        #[source]
        source: Box<Error>,
    },
}

fn failed_steps(steps: &[StepOutcome]) -> usize {
    steps.iter().filter(|s| !s.ok).count()
}

impl Error {
    /// The stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotEmpty { .. } => ErrorKind::NotEmpty,
            Self::CannotRemoveOwner { .. } => ErrorKind::CannotRemoveOwner,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::TransferFailed { source, .. } => source.kind(),
        }
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(resource: Resource, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Map a store error for an operation on a known entity: `NotFound`
    /// becomes a `NotFound` for that entity, `Conflict` an `AlreadyExists`.
    pub(crate) fn from_store_for(resource: Resource, id: impl fmt::Display, e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::not_found(resource, id),
            StoreError::Conflict { .. } => Self::AlreadyExists {
                resource,
                id: id.to_string(),
            },
            other => other.into(),
        }
    }
}

impl From<PolicyError> for Error {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::InvalidPermission { .. } => Self::invalid("permission", e.to_string()),
            PolicyError::InvalidPath { .. } => Self::invalid("path", e.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { path } => Self::NotFound {
                resource: Resource::Folder,
                id: path,
            },
            StoreError::Conflict { path } => Self::Conflict { path, attempts: 1 },
            other => Self::UpstreamUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
