//! Run reports
//!
//! Every entity a run touches ends up in exactly one terminal state. The
//! reports are plain data so the binary can print them or dump them as
//! JSON.

use crate::bundle::ExternalReference;
use crate::entity::{EntityKind, Handle};
use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How far an entity got through the import steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Validated,
    Rendered,
    Credentialed,
    Applied,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Rendered => "rendered",
            Self::Credentialed => "credentialed",
            Self::Applied => "applied",
        };
        f.write_str(name)
    }
}

/// Why an entity was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Already present at the target and the conflict policy said skip
    Conflict,
    /// A dependency failed or was blocked itself
    BlockedByDependencyFailure,
    /// A dependency was skipped on purpose (conflict skip excluded)
    DependencySkipped,
    /// Holds an external reference the policy asked to skip
    ExternalReference,
    /// An earlier entity aborted the run
    RunAborted,
    /// The run was cancelled before this entity was reached
    Cancelled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::BlockedByDependencyFailure => "blocked_by_dependency_failure",
            Self::DependencySkipped => "dependency_skipped",
            Self::ExternalReference => "external_reference",
            Self::RunAborted => "run_aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum EntityState {
    Created,
    Updated,
    Skipped { reason: SkipReason },
    Failed,
}

impl EntityState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Self::Skipped {
                reason: SkipReason::BlockedByDependencyFailure
            }
        )
    }

    /// Created or updated (or would be, in a dry run)
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// An error as it appears in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ReportedError {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// What happened to one entity during an import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub uuid: Uuid,
    pub kind: EntityKind,
    pub name: String,
    pub phase_reached: Phase,
    #[serde(flatten)]
    pub state: EntityState,
    /// Target handle, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
}

/// Per-state totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Result of one import run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Name of the target environment
    pub target: String,
    pub dry_run: bool,
    /// One outcome per bundled entity, in apply order
    pub outcomes: Vec<EntityOutcome>,
    /// Set when a conflict under the `fail` policy or a cancellation
    /// stopped the run early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<ReportedError>,
}

impl ImportReport {
    pub fn new(target: impl Into<String>, dry_run: bool) -> Self {
        Self {
            target: target.into(),
            dry_run,
            outcomes: Vec::new(),
            aborted: None,
        }
    }

    /// Not aborted, with zero failed entities and zero entities blocked by
    /// a failure
    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
            && !self
                .outcomes
                .iter()
                .any(|o| o.state.is_failed() || o.state.is_blocked())
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for outcome in &self.outcomes {
            match outcome.state {
                EntityState::Created => counts.created += 1,
                EntityState::Updated => counts.updated += 1,
                EntityState::Skipped { .. } => counts.skipped += 1,
                EntityState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn outcome(&self, uuid: &Uuid) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|o| o.uuid == *uuid)
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(|o| o.state.is_failed())
    }
}

/// An entity left out of an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportFailure {
    pub uuid: Uuid,
    pub kind: EntityKind,
    pub name: String,
    pub error: ReportedError,
}

/// Result of one export run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub source_env: String,
    /// Bundled entity count per kind
    pub bundled: Vec<(EntityKind, usize)>,
    pub external: Vec<ExternalReference>,
    pub failures: Vec<ExportFailure>,
}

impl ExportReport {
    pub fn total_bundled(&self) -> usize {
        self.bundled.iter().map(|(_, n)| n).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}
