//! Recovery points and rollback.
//!
//! A recovery point is a backup taken before a risky operation, chosen by a
//! per-operation path policy, plus one line in
//! `.instances/.recovery/recovery-points.jsonl`. Rollbacks are logged to the
//! same file. Readers skip lines they cannot parse.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backup::{BackupEntry, BackupStore, EntryKind};
use crate::config::RecoveryConfig;
use crate::errors::RecoveryError;
use crate::fsutil;
use crate::layout::ProjectLayout;
use crate::models::{InstanceStatus, MergeStatus};
use crate::store::InstanceStore;

const RECOVERY_LOG_FILE: &str = "recovery-points.jsonl";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Operation kinds that take a recovery point first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    InstanceCreation,
    Merge,
    ConflictResolution,
    DatabaseOperation,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceCreation => "instance_creation",
            Self::Merge => "merge",
            Self::ConflictResolution => "conflict_resolution",
            Self::DatabaseOperation => "database_operation",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a rollback puts back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackLevel {
    /// Single captured files only (databases, ledgers).
    Minimal,
    /// Every captured path.
    Partial,
    /// Every captured path, then the store rows the operation created.
    Complete,
}

/// What a recovery point is about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl RecoveryContext {
    pub fn for_instance(id: &str) -> Self {
        Self {
            instance_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_merge(instance_id: &str, merge_id: &str) -> Self {
        Self {
            instance_id: Some(instance_id.to_string()),
            merge_id: Some(merge_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub id: String,
    pub operation: OperationType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub context: RecoveryContext,
    pub backup_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackReport {
    pub recovery_point: String,
    pub level: RollbackLevel,
    pub restored: Vec<PathBuf>,
    /// Store rows reverted, as human-readable notes.
    pub reverted: Vec<String>,
}

impl RollbackReport {
    pub fn summary(&self) -> String {
        let mut s = format!("restored {} path(s)", self.restored.len());
        if !self.reverted.is_empty() {
            s.push_str(&format!(", reverted {}", self.reverted.join(", ")));
        }
        s
    }
}

/// Outcome of [`RecoveryManager::handle_operation_failure`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReport {
    pub operation: OperationType,
    pub error: String,
    pub recovery_point: Option<String>,
    pub rollback: Option<RollbackReport>,
    pub rollback_error: Option<String>,
    pub cleanup: Vec<String>,
    /// Whether the environment is back to its pre-operation state.
    pub recovered: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum LogEntry {
    Point(RecoveryPoint),
    Rollback {
        recovery_point: String,
        level: RollbackLevel,
        restored: usize,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct RecoveryManager {
    layout: ProjectLayout,
    backups: Arc<BackupStore>,
    store: Arc<dyn InstanceStore>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        layout: ProjectLayout,
        backups: Arc<BackupStore>,
        store: Arc<dyn InstanceStore>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            layout,
            backups,
            store,
            config,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    fn log_path(&self) -> PathBuf {
        self.layout.recovery_dir().join(RECOVERY_LOG_FILE)
    }

    /// Paths captured before an operation of type `op`.
    pub fn backup_paths(&self, op: OperationType, context: &RecoveryContext) -> Vec<PathBuf> {
        let l = &self.layout;
        match op {
            OperationType::InstanceCreation => {
                vec![l.state_dir().to_path_buf(), l.instances_dir().to_path_buf()]
            }
            OperationType::Merge => {
                let mut paths = vec![l.state_dir().to_path_buf()];
                if let Some(id) = &context.instance_id {
                    paths.push(l.active_workspace(id));
                }
                paths
            }
            OperationType::ConflictResolution => {
                let mut paths = vec![l.state_dir().to_path_buf()];
                if let Some(merge_id) = &context.merge_id {
                    paths.push(l.conflict_workspace(merge_id));
                }
                paths
            }
            OperationType::DatabaseOperation => vec![l.canonical_database()],
        }
    }

    /// Snapshot the policy paths for `op` and record a recovery point.
    pub fn create_recovery_point(
        &self,
        op: OperationType,
        description: &str,
        context: RecoveryContext,
    ) -> Result<String, RecoveryError> {
        let paths = self.backup_paths(op, &context);
        let manifest = self
            .backups
            .create_backup(&paths, &format!("{op}: {description}"))?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let point = RecoveryPoint {
            id: format!("rp-{}-{}", op, &suffix[..12]),
            operation: op,
            description: description.to_string(),
            timestamp: Utc::now(),
            context,
            backup_id: manifest.backup_id,
        };
        self.append(&LogEntry::Point(point.clone()))?;
        info!(
            id = %point.id,
            operation = %op,
            backup_id = %point.backup_id,
            "recovery point created"
        );
        Ok(point.id)
    }

    fn append(&self, entry: &LogEntry) -> Result<(), RecoveryError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fsutil::append_line(&self.log_path(), &line)?;
        Ok(())
    }

    /// All recorded recovery points, oldest first.
    pub fn list_points(&self) -> Vec<RecoveryPoint> {
        let raw = match fs::read_to_string(self.log_path()) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<LogEntry>(line) {
                Ok(LogEntry::Point(p)) => Some(p),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "skipping malformed recovery log line");
                    None
                }
            })
            .collect()
    }

    pub fn get_point(&self, id: &str) -> Result<RecoveryPoint, RecoveryError> {
        self.list_points()
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| RecoveryError::PointNotFound(id.to_string()))
    }

    /// Put back what recovery point `id` captured. Restores are idempotent,
    /// so repeating a rollback is harmless.
    pub fn rollback(&self, id: &str, level: RollbackLevel) -> Result<RollbackReport, RecoveryError> {
        let point = self.get_point(id)?;
        info!(id, operation = %point.operation, ?level, "rolling back");

        let restore = match level {
            RollbackLevel::Minimal => self
                .backups
                .restore_where(&point.backup_id, |e: &BackupEntry| e.kind == EntryKind::File)?,
            RollbackLevel::Partial | RollbackLevel::Complete => {
                self.backups.restore_backup(&point.backup_id)?
            }
        };

        let reverted = if level == RollbackLevel::Complete {
            self.revert_rows(&point)?
        } else {
            Vec::new()
        };

        self.append(&LogEntry::Rollback {
            recovery_point: point.id.clone(),
            level,
            restored: restore.restored.len(),
            timestamp: Utc::now(),
        })?;

        Ok(RollbackReport {
            recovery_point: point.id,
            level,
            restored: restore.restored,
            reverted,
        })
    }

    /// Undo the store rows an operation of this kind creates or advances.
    fn revert_rows(&self, point: &RecoveryPoint) -> Result<Vec<String>, RecoveryError> {
        let mut reverted = Vec::new();
        match point.operation {
            OperationType::InstanceCreation => {
                if let Some(id) = &point.context.instance_id {
                    if self.store.delete_instance(id)? {
                        reverted.push(format!("instance row {id}"));
                    }
                }
            }
            OperationType::Merge | OperationType::ConflictResolution => {
                if let Some(merge_id) = &point.context.merge_id {
                    if let Some(merge) = self.store.get_merge_record(merge_id)? {
                        if !merge.status.is_terminal() {
                            self.store.update_merge_status(merge_id, MergeStatus::Failed)?;
                            reverted.push(format!("merge {merge_id} -> failed"));
                        }
                    }
                }
                if let Some(id) = &point.context.instance_id {
                    if let Some(instance) = self.store.get_instance(id)? {
                        if instance.status == InstanceStatus::Merging {
                            self.store
                                .update_instance_status(id, InstanceStatus::Active)?;
                            reverted.push(format!("instance {id} -> active"));
                        }
                    }
                }
            }
            OperationType::DatabaseOperation => {}
        }
        Ok(reverted)
    }

    /// Best-effort recovery after `op` failed. Never returns an error: every
    /// problem ends up in the report.
    pub fn handle_operation_failure(
        &self,
        op: OperationType,
        error: &str,
        context: &RecoveryContext,
    ) -> FailureReport {
        warn!(operation = %op, error, "handling operation failure");
        let cutoff = Utc::now() - Duration::seconds(self.config.recency_window_secs as i64);
        let point = self
            .list_points()
            .into_iter()
            .filter(|p| p.operation == op && p.timestamp >= cutoff)
            .filter(|p| matches_context(&p.context, context))
            .last();

        let mut report = FailureReport {
            operation: op,
            error: error.to_string(),
            recovery_point: point.as_ref().map(|p| p.id.clone()),
            rollback: None,
            rollback_error: None,
            cleanup: Vec::new(),
            recovered: false,
            message: String::new(),
        };

        if let Some(point) = &point {
            match self.rollback(&point.id, RollbackLevel::Partial) {
                Ok(rollback) => report.rollback = Some(rollback),
                Err(e) => {
                    error!(id = %point.id, error = %e, "automatic rollback failed");
                    report.rollback_error = Some(e.to_string());
                }
            }
        }

        self.cleanup_after_failure(op, context, &mut report.cleanup);

        report.recovered = report.rollback.is_some();
        report.message = match (&report.rollback, &report.rollback_error) {
            (Some(r), _) => format!("{op} failed; {}", r.summary()),
            (None, Some(e)) => format!("{op} failed; rollback failed: {e}"),
            (None, None) => format!("{op} failed; no recent recovery point"),
        };
        if !report.cleanup.is_empty() {
            report.message.push_str(&format!("; cleanup: {}", report.cleanup.join(", ")));
        }
        report
    }

    fn cleanup_after_failure(
        &self,
        op: OperationType,
        context: &RecoveryContext,
        notes: &mut Vec<String>,
    ) {
        match op {
            OperationType::InstanceCreation => {
                let Some(id) = &context.instance_id else { return };
                let workspace = self.layout.active_workspace(id);
                if workspace.exists() {
                    match fs::remove_dir_all(&workspace) {
                        Ok(()) => notes.push(format!("removed workspace {id}")),
                        Err(e) => warn!(id = %id, error = %e, "failed to remove orphan workspace"),
                    }
                }
                match self.store.delete_instance(id) {
                    Ok(true) => notes.push(format!("deleted instance row {id}")),
                    Ok(false) => {}
                    Err(e) => warn!(id = %id, error = %e, "failed to delete dangling row"),
                }
            }
            OperationType::Merge | OperationType::ConflictResolution => {
                let Some(merge_id) = &context.merge_id else { return };
                match self.store.get_merge_record(merge_id) {
                    Ok(Some(merge)) if !merge.status.is_terminal() => {
                        match self.store.update_merge_status(merge_id, MergeStatus::Failed) {
                            Ok(()) => notes.push(format!("marked merge {merge_id} failed")),
                            Err(e) => warn!(merge_id = %merge_id, error = %e, "failed to mark merge failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(merge_id = %merge_id, error = %e, "failed to read merge"),
                }
            }
            OperationType::DatabaseOperation => {}
        }
    }

    /// Prune backups past the configured retention.
    pub fn cleanup_old_backups(&self) -> Result<usize, RecoveryError> {
        Ok(self.backups.cleanup(self.config.backup_retention_days)?)
    }
}

/// A point matches when every id the failure names agrees with it.
fn matches_context(point: &RecoveryContext, failure: &RecoveryContext) -> bool {
    let agree = |a: &Option<String>, b: &Option<String>| match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    };
    agree(&point.instance_id, &failure.instance_id) && agree(&point.merge_id, &failure.merge_id)
}
