//! Domain model types used throughout OrgSync.
//!
//! These types bridge the instance manager, the conflict subsystem, and the
//! store. Status fields are closed enums; the store persists them through
//! [`InstanceStatus::as_str`] / [`InstanceStatus::parse`] and friends.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictType;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Lifecycle status of an instance.
///
/// `active → merging → completed → archived`, with `failed` reachable from
/// `active` and `merging`, and `archived` reachable directly from `active`
/// when work is abandoned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Merging,
    Completed,
    Archived,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "merging" => Some(Self::Merging),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Active, Merging)
                | (Active, Archived)
                | (Active, Failed)
                | (Merging, Merging)
                | (Merging, Active)
                | (Merging, Completed)
                | (Merging, Failed)
                | (Completed, Archived)
                | (Failed, Archived)
        )
    }

    /// Instances in these states own a workspace under `active/`.
    pub fn has_active_workspace(&self) -> bool {
        matches!(self, Self::Active | Self::Merging | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative bookkeeping record of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub created_from: String,
    pub created_by: String,
    pub purpose: String,
    pub themes: Vec<String>,
    pub flows: Vec<String>,
    pub status: InstanceStatus,
    pub workspace_path: PathBuf,
    pub db_path: PathBuf,
    pub git_base_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contents of `.branch-info.json`, the portable per-workspace metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    pub instance_id: String,
    pub created_from: String,
    pub created_at: String,
    pub created_by: String,
    pub purpose: String,
    pub primary_themes: Vec<String>,
    pub related_flows: Vec<String>,
    pub expected_duration: String,
    pub status: InstanceStatus,
}

impl BranchInfo {
    pub fn from_instance(instance: &Instance, expected_duration: &str) -> Self {
        Self {
            instance_id: instance.id.clone(),
            created_from: instance.created_from.clone(),
            created_at: instance.created_at.to_rfc3339(),
            created_by: instance.created_by.clone(),
            purpose: instance.purpose.clone(),
            primary_themes: instance.themes.clone(),
            related_flows: instance.flows.clone(),
            expected_duration: expected_duration.to_string(),
            status: instance.status,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Status of a merge record. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStatus {
    Pending,
    InProgress,
    /// No conflicts; can be completed without resolutions.
    Ready,
    Completed,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Ready => "ready",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in-progress" => Some(Self::InProgress),
            "ready" => Some(Self::Ready),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merge of one instance into a target workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeRecord {
    pub merge_id: String,
    pub source: String,
    pub target: String,
    pub status: MergeStatus,
    pub conflicts_detected: u32,
    pub conflicts_resolved: u32,
    pub conflict_types: BTreeSet<ConflictType>,
    /// Conflict id → strategy label applied to it.
    pub resolution_strategy: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MergeRecord {
    /// A fresh pending merge of `source` into `target`.
    pub fn new(source: &str, target: &str) -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            merge_id: format!(
                "merge-{}-{}-{}",
                source,
                now.format("%Y%m%d%H%M%S"),
                &suffix[..6]
            ),
            source: source.to_string(),
            target: target.to_string(),
            status: MergeStatus::Pending,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            conflict_types: BTreeSet::new(),
            resolution_strategy: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Conflicts that still need a resolution.
    pub fn unresolved(&self) -> u32 {
        self.conflicts_detected.saturating_sub(self.conflicts_resolved)
    }
}

/// Outcome fields written back to a merge record in one update.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub conflicts_detected: Option<u32>,
    pub conflicts_resolved: Option<u32>,
    pub conflict_types: Option<BTreeSet<ConflictType>>,
    pub resolution_strategy: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Code-change reconciliation
// ---------------------------------------------------------------------------

/// Whether organizational state has caught up with a detected code change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// First observation; nothing to reconcile against.
    Baseline,
    /// No relevant change since the last known hash.
    Current,
    /// Code changed; affected themes need review.
    Pending,
    /// A reviewer marked the change as reflected in state.
    Reconciled,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Current => "current",
            Self::Pending => "pending",
            Self::Reconciled => "reconciled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(Self::Baseline),
            "current" => Some(Self::Current),
            "pending" => Some(Self::Pending),
            "reconciled" => Some(Self::Reconciled),
            _ => None,
        }
    }
}

/// One row of the append-only code-change history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitProjectState {
    pub id: i64,
    pub project_root: String,
    pub current_hash: String,
    pub last_known_hash: Option<String>,
    pub change_summary: String,
    pub affected_themes: Vec<String>,
    pub reconciliation_status: ReconciliationStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Per-file impact of a detected code change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChangeImpact {
    pub file_path: String,
    pub change_kind: String,
    pub themes: Vec<String>,
}
