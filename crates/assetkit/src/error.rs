//! Error types for bundle export and import.
//!
//! Errors are split by blast radius. Entity-scoped errors only sink the
//! entity they were raised for and end up in a report; operation-scoped
//! errors abort the whole run before any write reaches a target.

use crate::entity::{EntityKind, Handle, Reference};
use crate::template::TemplateError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// Recovered per entity; the run continues with independent entities
    Entity,
    /// Aborts the whole run
    Operation,
}

/// Flat classification of [`Error`], stable enough to put in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedPayload,
    UnsafeInput,
    CyclicDependency,
    DanglingReference,
    CredentialUnresolved,
    ConflictDetected,
    TargetWriteFailed,
    UnresolvedVariable,
    DigestMismatch,
    UnsupportedFormat,
    InvalidArchive,
    Store,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// Whether this kind of error is recovered per entity or aborts the run.
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::MalformedPayload
            | Self::CredentialUnresolved
            | Self::ConflictDetected
            | Self::TargetWriteFailed
            | Self::UnresolvedVariable => ErrorScope::Entity,
            Self::UnsafeInput
            | Self::CyclicDependency
            | Self::DanglingReference
            | Self::DigestMismatch
            | Self::UnsupportedFormat
            | Self::InvalidArchive
            | Self::Store
            | Self::Cancelled
            | Self::Io => ErrorScope::Operation,
        }
    }

    /// Short user-facing description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "Malformed payload",
            Self::UnsafeInput => "Escape marker collision",
            Self::CyclicDependency => "Cyclic dependency",
            Self::DanglingReference => "Dangling reference",
            Self::CredentialUnresolved => "Credential unresolved",
            Self::ConflictDetected => "Conflict detected",
            Self::TargetWriteFailed => "Target write failed",
            Self::UnresolvedVariable => "Unresolved template variable",
            Self::DigestMismatch => "Bundle digest mismatch",
            Self::UnsupportedFormat => "Unsupported bundle format",
            Self::InvalidArchive => "Invalid bundle archive",
            Self::Store => "Remote store error",
            Self::Cancelled => "Cancelled",
            Self::Io => "I/O error",
        }
    }

    /// Actionable advice for the operator.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "Fix the required field in the source entity or bundle file",
            Self::UnsafeInput => "Remove the escape marker sequence from the source field",
            Self::CyclicDependency => "Break the reference cycle between the listed entities",
            Self::DanglingReference => {
                "Export with dependencies, or pick an external reference policy"
            }
            Self::CredentialUnresolved => "Supply the secret with --secret or the environment",
            Self::ConflictDetected => "Re-run with --conflict overwrite or --conflict skip",
            Self::TargetWriteFailed => "Check the target environment and retry the run",
            Self::UnresolvedVariable => "Pass the variable with --var or give it a default",
            Self::DigestMismatch => "Re-export the bundle; it was edited or corrupted",
            Self::UnsupportedFormat => "Re-export the bundle with this version of ferry",
            Self::InvalidArchive => "Check the bundle directory layout and file contents",
            Self::Store => "Check connectivity to the source environment",
            Self::Cancelled => "Re-run to continue; completed entities are reported",
            Self::Io => "Check file permissions and available disk space",
        }
    }
}

/// Errors raised by a Remote Store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No entity with that handle
    #[error("{kind} with handle {handle} not found")]
    NotFound { kind: EntityKind, handle: Handle },

    /// Timeouts, dropped connections, throttling
    #[error("transient store error: {message}")]
    Transient { message: String },

    /// The store understood the request and refused it
    #[error("store rejected request: {message}")]
    Rejected { message: String },
}

impl StoreError {
    /// Whether the failed call is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors that can occur while exporting or importing a bundle.
#[derive(Debug, Error)]
pub enum Error {
    /// A kind-specific required field is absent or has the wrong shape
    #[error("malformed {kind} payload for {uuid}: {reason}")]
    MalformedPayload {
        kind: EntityKind,
        uuid: Uuid,
        reason: String,
    },

    /// Escaping or rendering a field failed
    #[error("template error in {uuid}: {source}")]
    Template {
        uuid: Uuid,
        #[source]
        source: TemplateError,
    },

    /// The reference graph contains a cycle
    #[error("cyclic dependency between {}", join_uuids(.involved))]
    CyclicDependency { involved: Vec<Uuid> },

    /// A reference that does not resolve inside the operation's closure
    #[error("{from} references {to}, which is not part of this operation")]
    DanglingReference { from: Uuid, to: Reference },

    /// No usable value could be found for a secret field
    #[error("could not resolve secret `{field}` for {uuid}: {reason}")]
    CredentialUnresolved {
        uuid: Uuid,
        field: String,
        reason: String,
    },

    /// The target already holds an entity with this stable identifier
    #[error("{kind} {uuid} already exists at the target")]
    ConflictDetected { kind: EntityKind, uuid: Uuid },

    /// The target refused or failed a create/update
    #[error("writing {kind} {uuid} failed: {source}")]
    TargetWriteFailed {
        kind: EntityKind,
        uuid: Uuid,
        #[source]
        source: StoreError,
    },

    /// The manifest digest does not match the entity files
    #[error("bundle digest mismatch: manifest has {expected}, files hash to {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Bundle written by an incompatible format version
    #[error("unsupported bundle format version {version}")]
    UnsupportedFormat { version: String },

    /// Layout or content problem in a bundle directory
    #[error("invalid bundle at {}: {message}", .path.display())]
    InvalidArchive { path: PathBuf, message: String },

    /// YAML parse/serialize error on a bundle file
    #[error("YAML error in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Reading from a Remote Store failed
    #[error("remote store error: {0}")]
    Store(#[from] StoreError),

    /// The run was cancelled between two steps
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Flat classification for reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            Error::Template { source, .. } => match source {
                TemplateError::UnsafeInput { .. } => ErrorKind::UnsafeInput,
                TemplateError::UnresolvedVariable { .. } => ErrorKind::UnresolvedVariable,
            },
            Error::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Error::DanglingReference { .. } => ErrorKind::DanglingReference,
            Error::CredentialUnresolved { .. } => ErrorKind::CredentialUnresolved,
            Error::ConflictDetected { .. } => ErrorKind::ConflictDetected,
            Error::TargetWriteFailed { .. } => ErrorKind::TargetWriteFailed,
            Error::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Error::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Error::InvalidArchive { .. } | Error::Yaml { .. } => ErrorKind::InvalidArchive,
            Error::Store(_) => ErrorKind::Store,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Shortcut for `self.kind().scope()`.
    pub fn scope(&self) -> ErrorScope {
        self.kind().scope()
    }

    pub(crate) fn malformed(kind: EntityKind, uuid: Uuid, reason: impl Into<String>) -> Self {
        Error::MalformedPayload {
            kind,
            uuid,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::InvalidArchive {
            path: path.into(),
            message: message.into(),
        }
    }
}

fn join_uuids(uuids: &[Uuid]) -> String {
    uuids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for bundle operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_scope() {
        assert_eq!(ErrorKind::MalformedPayload.scope(), ErrorScope::Entity);
        assert_eq!(ErrorKind::CredentialUnresolved.scope(), ErrorScope::Entity);
        assert_eq!(ErrorKind::TargetWriteFailed.scope(), ErrorScope::Entity);
        assert_eq!(ErrorKind::CyclicDependency.scope(), ErrorScope::Operation);
        assert_eq!(ErrorKind::UnsafeInput.scope(), ErrorScope::Operation);
    }

    #[test]
    fn test_template_error_kind() {
        let err = Error::Template {
            uuid: Uuid::nil(),
            source: TemplateError::UnsafeInput {
                field: "payload.sql".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::UnsafeInput);
        assert_eq!(err.scope(), ErrorScope::Operation);

        let err = Error::Template {
            uuid: Uuid::nil(),
            source: TemplateError::UnresolvedVariable {
                name: "env".into(),
                field: "name".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::UnresolvedVariable);
        assert_eq!(err.scope(), ErrorScope::Entity);
    }

    #[test]
    fn test_cycle_message_lists_uuids() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let err = Error::CyclicDependency {
            involved: vec![a, b],
        };
        let message = err.to_string();
        assert!(message.contains(&a.to_string()));
        assert!(message.contains(&b.to_string()));
    }

    #[test]
    fn test_store_error_retryable() {
        assert!(
            StoreError::Transient {
                message: "timeout".into()
            }
            .is_retryable()
        );
        assert!(
            !StoreError::Rejected {
                message: "bad request".into()
            }
            .is_retryable()
        );
    }
}
