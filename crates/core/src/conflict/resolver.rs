//! Conflict presentation, resolution and merge completion.
//!
//! The [`ConflictResolver`] is the only component that writes canonical
//! state during a merge. Every write happens under a recovery point and a
//! process-local lock; the source workspace is never read while applying,
//! only the content the caller supplied.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditEventType, AuditLevel, AuditLog};
use crate::config::ConflictConfig;
use crate::db::Database;
use crate::errors::{ConflictError, CoreError, InstanceError};
use crate::fsutil;
use crate::instance::workspace;
use crate::layout::ProjectLayout;
use crate::models::{InstanceStatus, MergeOutcome, MergeRecord, MergeStatus};
use crate::recovery::{OperationType, RecoveryContext, RecoveryManager};
use crate::store::InstanceStore;

use super::detector::{
    Conflict, ConflictDetector, ConflictType, DetectionResult, FLOWS_DIR, THEMES_DIR,
};
use super::resolution::{
    valid_strategies, DatabaseResolution, FlowResolution, Resolution, TaskResolution,
    ThemeResolution,
};
use super::log_merge_event;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Everything a caller needs to choose a resolution for one conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictPresentation {
    pub conflict_id: String,
    pub merge_id: String,
    pub conflict_type: ConflictType,
    pub subtype: String,
    pub file: String,
    pub main_excerpt: Option<String>,
    pub instance_excerpt: Option<String>,
    /// True when either excerpt was cut at the configured line count.
    pub truncated: bool,
    /// Unified diff from main to instance content.
    pub diff: Option<String>,
    pub strategies: Vec<String>,
    pub review_file: PathBuf,
    /// Content hashes of both sides when this was presented.
    #[serde(default)]
    pub source_hash: Option<String>,
    #[serde(default)]
    pub main_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub strategy: Option<String>,
    pub success: bool,
    /// Workspace-relative files written.
    pub written: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionReport {
    pub merge_id: String,
    pub success: bool,
    pub status: MergeStatus,
    pub detected: u32,
    pub resolved: u32,
    pub outcomes: Vec<ResolutionOutcome>,
    pub diagnostics: Vec<String>,
    pub recovery_point: String,
    /// Set when a failed attempt was rolled back.
    pub rollback: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionReport {
    pub merge_id: String,
    pub source: String,
    pub target: String,
    pub archived_workspace: PathBuf,
    pub additions_merged: Vec<String>,
    pub recovery_point: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct ConflictResolver {
    layout: ProjectLayout,
    config: ConflictConfig,
    detector: Arc<ConflictDetector>,
    store: Arc<dyn InstanceStore>,
    recovery: Arc<RecoveryManager>,
    audit: Arc<AuditLog>,
    canonical_lock: Mutex<()>,
}

impl ConflictResolver {
    pub fn new(
        layout: ProjectLayout,
        config: ConflictConfig,
        detector: Arc<ConflictDetector>,
        store: Arc<dyn InstanceStore>,
        recovery: Arc<RecoveryManager>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            layout,
            config,
            detector,
            store,
            recovery,
            audit,
            canonical_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.canonical_lock.lock().unwrap_or_else(|poisoned| {
            warn!("canonical lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn merge_record(&self, merge_id: &str) -> Result<MergeRecord, CoreError> {
        self.store
            .get_merge_record(merge_id)?
            .ok_or_else(|| ConflictError::MergeNotFound(merge_id.to_string()).into())
    }

    /// Build the review bundle for `conflict` and write it to
    /// `.instances/conflicts/<merge_id>/`.
    pub fn present(
        &self,
        conflict: &Conflict,
        merge_id: &str,
    ) -> Result<ConflictPresentation, ConflictError> {
        let lines = self.config.excerpt_lines;
        let main = conflict.main_content.as_deref().map(|c| excerpt(c, lines));
        let instance = conflict.source_content.as_deref().map(|c| excerpt(c, lines));
        let truncated =
            main.as_ref().is_some_and(|e| e.1) || instance.as_ref().is_some_and(|e| e.1);
        let diff = match (&conflict.main_content, &conflict.source_content) {
            (Some(main), Some(instance)) => Some(diffy::create_patch(main, instance).to_string()),
            _ => None,
        };

        let review_file = self
            .layout
            .conflict_workspace(merge_id)
            .join(format!("{}.json", review_file_stem(&conflict.id)));
        let presentation = ConflictPresentation {
            conflict_id: conflict.id.clone(),
            merge_id: merge_id.to_string(),
            conflict_type: conflict.conflict_type,
            subtype: conflict.subtype.as_str().to_string(),
            file: conflict.file.clone(),
            main_excerpt: main.map(|(text, _)| text),
            instance_excerpt: instance.map(|(text, _)| text),
            truncated,
            diff,
            strategies: valid_strategies(conflict.conflict_type)
                .iter()
                .map(|s| s.to_string())
                .collect(),
            review_file: review_file.clone(),
            source_hash: conflict.source_hash.clone(),
            main_hash: conflict.main_hash.clone(),
        };
        let json = serde_json::to_vec_pretty(&presentation)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fsutil::write_atomic(&review_file, &json)?;
        debug!(conflict_id = %conflict.id, file = %review_file.display(), "conflict presented");
        Ok(presentation)
    }

    /// The presentations on file for `merge_id`, keyed by conflict id.
    fn reviewed(&self, merge_id: &str) -> Result<BTreeMap<String, ConflictPresentation>, ConflictError> {
        let mut reviewed = BTreeMap::new();
        for (_, path) in fsutil::list_files(&self.layout.conflict_workspace(merge_id), ".json")? {
            match serde_json::from_slice::<ConflictPresentation>(&fs::read(&path)?) {
                Ok(presentation) => {
                    reviewed.insert(presentation.conflict_id.clone(), presentation);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "unreadable review file"),
            }
        }
        Ok(reviewed)
    }

    /// Reject `detection` unless it is exactly the set of conflicts that was
    /// presented, with both sides unchanged.
    fn ensure_unchanged_since_review(
        &self,
        merge_id: &str,
        detection: &DetectionResult,
    ) -> Result<(), ConflictError> {
        let reviewed = self.reviewed(merge_id)?;
        let mut changes = Vec::new();
        for conflict in &detection.conflicts {
            match reviewed.get(&conflict.id) {
                None => changes.push(format!("{} was never presented", conflict.file)),
                Some(seen)
                    if seen.source_hash != conflict.source_hash
                        || seen.main_hash != conflict.main_hash =>
                {
                    changes.push(format!("{} was modified", conflict.file))
                }
                Some(_) => {}
            }
        }
        for seen in reviewed.values() {
            if detection.find(&seen.conflict_id).is_none() {
                changes.push(format!("{} no longer conflicts", seen.file));
            }
        }
        if changes.is_empty() {
            return Ok(());
        }
        warn!(merge_id, changes = changes.len(), "merge changed since review");
        Err(ConflictError::ChangedSinceReview {
            merge_id: merge_id.to_string(),
            detail: changes.join("; "),
        })
    }

    /// Apply one resolution per detected conflict of `merge_id`.
    ///
    /// Conflicts are re-detected first and must match the review files
    /// written when they were presented; resolutions naming unknown
    /// conflicts or the wrong family are rejected before anything is
    /// written. The merge ends `completed` only if every detected conflict
    /// resolved; otherwise it ends `failed` and canonical state is rolled
    /// back.
    #[instrument(skip(self, resolutions), fields(count = resolutions.len()))]
    pub fn apply_resolutions(
        &self,
        merge_id: &str,
        resolutions: &BTreeMap<String, Resolution>,
        actor: &str,
    ) -> Result<ResolutionReport, CoreError> {
        let merge = self.merge_record(merge_id)?;
        if !matches!(merge.status, MergeStatus::InProgress | MergeStatus::Ready) {
            return Err(ConflictError::InvalidMergeState {
                merge_id: merge_id.to_string(),
                status: merge.status.to_string(),
                expected: "in-progress or ready".into(),
            }
            .into());
        }

        let detection = self
            .detector
            .detect_conflicts(merge_id, &merge.source, &merge.target)?;
        self.ensure_unchanged_since_review(merge_id, &detection)?;
        let target_root = self.layout.workspace_for(&merge.target);
        for (id, resolution) in resolutions {
            let conflict = detection
                .find(id)
                .ok_or_else(|| ConflictError::NotFound(id.clone()))?;
            validate(&target_root, &merge.source, conflict, resolution)?;
        }

        let _guard = self.lock();
        let context = RecoveryContext::for_merge(&merge.source, merge_id).with_actor(actor);
        let point = self.recovery.create_recovery_point(
            OperationType::ConflictResolution,
            &format!("apply {} resolution(s) to {merge_id}", resolutions.len()),
            context.clone(),
        )?;

        let mut outcomes = Vec::with_capacity(detection.count());
        let mut diagnostics = Vec::new();
        for conflict in &detection.conflicts {
            let outcome = match resolutions.get(&conflict.id) {
                None => ResolutionOutcome {
                    conflict_id: conflict.id.clone(),
                    conflict_type: conflict.conflict_type,
                    strategy: None,
                    success: false,
                    written: Vec::new(),
                    error: Some("no resolution supplied".into()),
                },
                Some(resolution) => {
                    match apply_one(&target_root, &merge.source, conflict, resolution) {
                        Ok(written) => ResolutionOutcome {
                            conflict_id: conflict.id.clone(),
                            conflict_type: conflict.conflict_type,
                            strategy: Some(resolution.strategy().to_string()),
                            success: true,
                            written,
                            error: None,
                        },
                        Err(e) => {
                            warn!(conflict_id = %conflict.id, error = %e, "resolution failed");
                            ResolutionOutcome {
                                conflict_id: conflict.id.clone(),
                                conflict_type: conflict.conflict_type,
                                strategy: Some(resolution.strategy().to_string()),
                                success: false,
                                written: Vec::new(),
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
            };
            if let Some(e) = &outcome.error {
                diagnostics.push(format!("{}: {e}", outcome.conflict_id));
            }
            outcomes.push(outcome);
        }

        let detected = detection.count() as u32;
        let resolved = outcomes.iter().filter(|o| o.success).count() as u32;
        let success = resolved == detected;
        let status = if success {
            MergeStatus::Completed
        } else {
            MergeStatus::Failed
        };

        let strategies: BTreeMap<String, String> = resolutions
            .iter()
            .map(|(id, r)| (id.clone(), r.strategy().to_string()))
            .collect();
        let outcome = MergeOutcome {
            conflicts_detected: Some(detected),
            conflicts_resolved: Some(resolved),
            conflict_types: Some(detection.types()),
            resolution_strategy: Some(strategies.clone()),
            error: (!success).then(|| diagnostics.join("; ")),
        };
        let persisted = self
            .store
            .update_merge_outcome(merge_id, &outcome)
            .and_then(|()| self.store.update_merge_status(merge_id, status));
        if let Err(e) = persisted {
            let failure = self.recovery.handle_operation_failure(
                OperationType::ConflictResolution,
                &e.to_string(),
                &context,
            );
            self.audit_failure(AuditEventType::OperationFailed, actor, merge_id, &failure.message);
            return Err(InstanceError::OperationFailed {
                operation: "apply_resolutions".into(),
                detail: e.to_string(),
                rollback: Some(failure.message),
            }
            .into());
        }

        let mut rollback = None;
        let message = if success {
            self.audit.log_event(
                AuditEventType::ConflictResolved,
                actor,
                &format!("resolved {resolved} conflict(s) for {merge_id}"),
                json!({
                    "merge_id": merge_id,
                    "detected": detected,
                    "resolved": resolved,
                    "strategies": strategies,
                }),
                AuditLevel::Standard,
            );
            info!(merge_id, resolved, "merge resolutions applied");
            format!("resolved {resolved} of {detected} conflict(s)")
        } else {
            let failure = self.recovery.handle_operation_failure(
                OperationType::ConflictResolution,
                &diagnostics.join("; "),
                &context,
            );
            self.restore_source_status(&merge.source);
            self.audit_failure(AuditEventType::MergeFailed, actor, merge_id, &failure.message);
            warn!(merge_id, resolved, detected, "merge resolution failed");
            rollback = Some(failure.message.clone());
            format!(
                "resolved {resolved} of {detected} conflict(s); merge failed: {}",
                failure.message
            )
        };

        if let Ok(record) = self.merge_record(merge_id) {
            log_merge_event(&self.layout, &record, "resolutions_applied");
        }

        Ok(ResolutionReport {
            merge_id: merge_id.to_string(),
            success,
            status,
            detected,
            resolved,
            outcomes,
            diagnostics,
            recovery_point: point,
            rollback,
            message,
        })
    }

    /// Fold a resolved merge into its target: copy instance-only files,
    /// move the source workspace to `completed/`, archive the instance.
    #[instrument(skip(self))]
    pub fn complete_merge(&self, merge_id: &str, actor: &str) -> Result<CompletionReport, CoreError> {
        let merge = self.merge_record(merge_id)?;
        if !matches!(merge.status, MergeStatus::Completed | MergeStatus::Ready) {
            return Err(ConflictError::InvalidMergeState {
                merge_id: merge_id.to_string(),
                status: merge.status.to_string(),
                expected: "completed".into(),
            }
            .into());
        }
        if merge.unresolved() > 0 {
            return Err(ConflictError::Unresolved {
                merge_id: merge_id.to_string(),
                remaining: merge.unresolved(),
            }
            .into());
        }
        if merge.status == MergeStatus::Ready {
            // Nothing was reviewed, so the workspace must still merge cleanly.
            let fresh = self
                .detector
                .detect_conflicts(merge_id, &merge.source, &merge.target)?;
            if fresh.count() > 0 {
                return Err(ConflictError::Unresolved {
                    merge_id: merge_id.to_string(),
                    remaining: fresh.count() as u32,
                }
                .into());
            }
        }
        let source = self
            .store
            .get_instance(&merge.source)?
            .ok_or_else(|| InstanceError::NotFound(merge.source.clone()))?;
        if !source.status.can_transition_to(InstanceStatus::Completed) {
            return Err(InstanceError::InvalidTransition {
                id: source.id.clone(),
                from: source.status.to_string(),
                to: InstanceStatus::Completed.to_string(),
            }
            .into());
        }
        let active = self.layout.active_workspace(&merge.source);
        if !active.is_dir() {
            return Err(ConflictError::WorkspaceMissing(merge.source.clone()).into());
        }

        let _guard = self.lock();
        let context = RecoveryContext::for_merge(&merge.source, merge_id).with_actor(actor);
        let point = self.recovery.create_recovery_point(
            OperationType::Merge,
            &format!("complete {merge_id}"),
            context.clone(),
        )?;

        let archived = self.layout.completed_workspace(&merge.source);
        let additions = match self.fold_into_target(&merge, &active, &archived) {
            Ok(additions) => additions,
            Err(e) => {
                error!(merge_id, error = %e, "merge completion failed");
                let failure = self.recovery.handle_operation_failure(
                    OperationType::Merge,
                    &e.to_string(),
                    &context,
                );
                if active.is_dir() && archived.is_dir() {
                    if let Err(e) = fs::remove_dir_all(&archived) {
                        warn!(error = %e, "failed to remove partial archive");
                    }
                }
                if let Err(e) = self
                    .store
                    .update_instance_status(&merge.source, InstanceStatus::Merging)
                {
                    warn!(error = %e, "failed to restore instance status");
                }
                self.audit_failure(AuditEventType::OperationFailed, actor, merge_id, &failure.message);
                return Err(InstanceError::OperationFailed {
                    operation: "complete_merge".into(),
                    detail: e.to_string(),
                    rollback: Some(failure.message),
                }
                .into());
            }
        };

        let conflict_dir = self.layout.conflict_workspace(merge_id);
        if conflict_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&conflict_dir) {
                warn!(merge_id, error = %e, "failed to remove conflict review files");
            }
        }

        let record = self.merge_record(merge_id)?;
        log_merge_event(&self.layout, &record, "completed");
        self.audit.log_event(
            AuditEventType::MergeCompleted,
            actor,
            &format!("merged {} into {}", merge.source, merge.target),
            json!({
                "merge_id": merge_id,
                "source": merge.source,
                "target": merge.target,
                "conflicts_detected": record.conflicts_detected,
                "conflicts_resolved": record.conflicts_resolved,
                "additions_merged": additions,
            }),
            AuditLevel::Standard,
        );
        info!(merge_id, additions = additions.len(), "merge completed");

        Ok(CompletionReport {
            merge_id: merge_id.to_string(),
            source: merge.source.clone(),
            target: merge.target.clone(),
            archived_workspace: archived,
            message: format!(
                "merged {} into {} ({} addition(s))",
                merge.source,
                merge.target,
                additions.len()
            ),
            additions_merged: additions,
            recovery_point: point,
        })
    }

    /// The fallible part of completion. Store rows change last so a failure
    /// before them leaves only files for the rollback to restore.
    fn fold_into_target(
        &self,
        merge: &MergeRecord,
        active: &Path,
        archived: &Path,
    ) -> Result<Vec<String>, CoreError> {
        let detection = self
            .detector
            .detect_conflicts(&merge.merge_id, &merge.source, &merge.target)?;
        let target_root = self.layout.workspace_for(&merge.target);
        let mut merged = Vec::new();
        for addition in &detection.additions {
            let dst = target_root.join(&addition.file);
            if dst.exists() {
                continue;
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(active.join(&addition.file), &dst)?;
            merged.push(addition.file.clone());
        }

        if archived.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", archived.display()),
            )
            .into());
        }
        fsutil::move_dir(active, archived)?;
        if let Err(e) = workspace::set_branch_status(archived, InstanceStatus::Archived) {
            warn!(error = %e, "failed to update archived branch info");
        }

        if merge.status == MergeStatus::Ready {
            self.store
                .update_merge_status(&merge.merge_id, MergeStatus::Completed)?;
        }
        self.store
            .update_instance_status(&merge.source, InstanceStatus::Completed)?;
        self.store.archive_instance(&merge.source, archived)?;
        Ok(merged)
    }

    fn restore_source_status(&self, source: &str) {
        match self.store.get_instance(source) {
            Ok(Some(instance)) if instance.status == InstanceStatus::Merging => {
                if let Err(e) = self.store.update_instance_status(source, InstanceStatus::Active) {
                    warn!(source, error = %e, "failed to return instance to active");
                    return;
                }
                let active = self.layout.active_workspace(source);
                if let Err(e) = workspace::set_branch_status(&active, InstanceStatus::Active) {
                    warn!(source, error = %e, "failed to update branch info");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(source, error = %e, "failed to read instance"),
        }
    }

    fn audit_failure(&self, event_type: AuditEventType, actor: &str, merge_id: &str, message: &str) {
        self.audit.log_event(
            event_type,
            actor,
            message,
            json!({ "merge_id": merge_id }),
            AuditLevel::Detailed,
        );
    }
}

// ---------------------------------------------------------------------------
// Applying
// ---------------------------------------------------------------------------

/// Reject a resolution that cannot apply, before anything is written.
fn validate(
    target_root: &Path,
    source: &str,
    conflict: &Conflict,
    resolution: &Resolution,
) -> Result<(), ConflictError> {
    if resolution.conflict_type() != conflict.conflict_type {
        return Err(ConflictError::ResolutionTypeMismatch {
            id: conflict.id.clone(),
            given: resolution.conflict_type().to_string(),
            expected: conflict.conflict_type.to_string(),
        });
    }
    let invalid = |detail: String| ConflictError::InvalidPayload {
        id: conflict.id.clone(),
        detail,
    };
    match resolution {
        Resolution::Theme(ThemeResolution::SplitApproach { new_theme: name, .. })
        | Resolution::Flow(FlowResolution::SplitFlows { new_flow: name, .. }) => {
            let dir = if conflict.conflict_type == ConflictType::Theme {
                THEMES_DIR
            } else {
                FLOWS_DIR
            };
            let rel = split_target(dir, name, &conflict.file).map_err(&invalid)?;
            if target_root.join(&rel).exists() {
                return Err(invalid(format!("{rel} already exists")));
            }
        }
        Resolution::Task(TaskResolution::PreserveBoth { .. }) => {
            let rel = preserved_path(&conflict.file, source);
            if target_root.join(&rel).exists() {
                return Err(invalid(format!("{rel} already exists")));
            }
        }
        Resolution::Database(DatabaseResolution::AcceptInstance { snapshot }) => {
            if !snapshot.is_file() {
                return Err(invalid(format!("snapshot {} not found", snapshot.display())));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Apply one resolution to the target workspace. Returns the files written.
fn apply_one(
    target_root: &Path,
    source: &str,
    conflict: &Conflict,
    resolution: &Resolution,
) -> Result<Vec<String>, CoreError> {
    let write = |rel: &str, content: &str| -> Result<Vec<String>, CoreError> {
        fsutil::write_atomic(&target_root.join(rel), content.as_bytes())?;
        Ok(vec![rel.to_string()])
    };
    match resolution {
        Resolution::Theme(r) => match r {
            ThemeResolution::AcceptMain => Ok(Vec::new()),
            ThemeResolution::AcceptInstance { content } | ThemeResolution::ManualMerge { content } => {
                write(&conflict.file, content)
            }
            ThemeResolution::SplitApproach { new_theme, content } => {
                let rel = split_target(THEMES_DIR, new_theme, &conflict.file)
                    .map_err(|detail| invalid_payload(conflict, detail))?;
                write(&rel, content)
            }
        },
        Resolution::Flow(r) => match r {
            FlowResolution::AcceptMain => Ok(Vec::new()),
            FlowResolution::AcceptInstance { content } | FlowResolution::ManualMerge { content } => {
                write(&conflict.file, content)
            }
            FlowResolution::SplitFlows { new_flow, content } => {
                let rel = split_target(FLOWS_DIR, new_flow, &conflict.file)
                    .map_err(|detail| invalid_payload(conflict, detail))?;
                write(&rel, content)
            }
        },
        Resolution::Task(r) => match r {
            TaskResolution::AcceptMain => Ok(Vec::new()),
            TaskResolution::AcceptInstance { content } | TaskResolution::ManualMerge { content } => {
                write(&conflict.file, content)
            }
            TaskResolution::PreserveBoth { content } => {
                write(&preserved_path(&conflict.file, source), content)
            }
        },
        Resolution::Database(r) => {
            let db_path = target_root.join(&conflict.file);
            match r {
                DatabaseResolution::AcceptMain => Ok(Vec::new()),
                DatabaseResolution::AcceptInstance { snapshot } => {
                    replace_database(&db_path, snapshot)?;
                    Ok(vec![conflict.file.clone()])
                }
                DatabaseResolution::MergeData { statements } => {
                    run_statements(&db_path, statements, false)?;
                    Ok(vec![conflict.file.clone()])
                }
                DatabaseResolution::SchemaUpgrade { migrations } => {
                    run_statements(&db_path, migrations, true)?;
                    Ok(vec![conflict.file.clone()])
                }
            }
        }
    }
}

fn invalid_payload(conflict: &Conflict, detail: String) -> ConflictError {
    ConflictError::InvalidPayload {
        id: conflict.id.clone(),
        detail,
    }
}

/// `<dir>/<name><ext of original>` for a split. `name` must be a plain file
/// stem.
fn split_target(dir: &str, name: &str, original: &str) -> Result<String, String> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(format!("'{name}' is not a usable name"));
    }
    let ext = Path::new(original)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    if !ext.is_empty() && name.ends_with(&ext) {
        Ok(format!("{dir}/{name}"))
    } else {
        Ok(format!("{dir}/{name}{ext}"))
    }
}

/// `tasks/active/task-1.json` → `tasks/active/task-1-from-<source>.json`.
fn preserved_path(file: &str, source: &str) -> String {
    let path = Path::new(file);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-from-{source}.{}", ext.to_string_lossy()),
        None => format!("{stem}-from-{source}"),
    };
    match file.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{name}"),
        None => name,
    }
}

/// Paths of SQLite's WAL sidecar files for `db_path`.
fn sidecars(db_path: &Path) -> [PathBuf; 2] {
    ["-wal", "-shm"].map(|suffix| {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    })
}

fn replace_database(db_path: &Path, snapshot: &Path) -> Result<(), CoreError> {
    let staging = db_path.with_extension("incoming");
    if staging.exists() {
        fs::remove_file(&staging)?;
    }
    Database::open_read_only(snapshot)?.snapshot_to(&staging)?;
    for sidecar in sidecars(db_path) {
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
    }
    fs::rename(&staging, db_path)?;
    debug!(db = %db_path.display(), "database replaced from snapshot");
    Ok(())
}

fn run_statements(db_path: &Path, statements: &[String], bump_version: bool) -> Result<(), CoreError> {
    let db = Database::new(db_path)?;
    db.transaction(|conn| {
        for statement in statements {
            conn.execute_batch(statement)?;
        }
        if bump_version {
            let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version + 1))?;
        }
        Ok(())
    })?;
    debug!(db = %db_path.display(), count = statements.len(), bump_version, "statements applied");
    Ok(())
}

/// First `lines` lines of `content`, and whether anything was cut.
fn excerpt(content: &str, lines: usize) -> (String, bool) {
    let total = content.lines().count();
    if total <= lines {
        return (content.to_string(), false);
    }
    let mut text: String = content.lines().take(lines).collect::<Vec<_>>().join("\n");
    text.push_str(&format!("\n... ({} more line(s))", total - lines));
    (text, true)
}

fn review_file_stem(conflict_id: &str) -> String {
    conflict_id.replace(['/', '\\'], "__")
}
