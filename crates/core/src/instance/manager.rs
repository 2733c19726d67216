//! The instance manager.
//!
//! [`InstanceManager`] drives the instance lifecycle:
//!
//! ```text
//! none → active → merging → completed → archived
//!          └────────┴──→ failed
//! ```
//!
//! It owns no state of its own beyond the components it composes; each of
//! those receives only the collaborators it needs at construction time.
//! Mutations of canonical state go through the [`ConflictResolver`], every
//! risky step takes a recovery point first, and every outcome is audited.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::authority::AuthorityGuard;
use super::workspace;
use crate::audit::{AuditEventType, AuditLevel, AuditLog};
use crate::backup::BackupStore;
use crate::config::AppConfig;
use crate::conflict::{
    log_merge_event, Addition, CompletionReport, ConflictDetector, ConflictPresentation,
    ConflictResolver, DetectionResult, Resolution, ResolutionReport,
};
use crate::db::Database;
use crate::errors::{ConflictError, CoreError, GitError, InstanceError};
use crate::fsutil;
use crate::git::{CodeChangeReport, GitAdapter};
use crate::ids::{generate_instance_id, validate_instance_id};
use crate::layout::{ProjectLayout, MAIN_INSTANCE_NAME};
use crate::models::{
    BranchInfo, FileChangeImpact, GitProjectState, Instance, InstanceStatus, MergeOutcome,
    MergeRecord, MergeStatus, ReconciliationStatus,
};
use crate::performance::{BatchReport, PerformanceOptimizer, PerformanceStats};
use crate::recovery::{OperationType, RecoveryContext, RecoveryManager};
use crate::store::{InstanceStore, ThemeResolver};
use crate::themes::ThemeIndex;

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Parameters of [`InstanceManager::create_instance`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Explicit id; generated from purpose and themes when absent.
    pub id: Option<String>,
    pub purpose: String,
    pub themes: Vec<String>,
    pub flows: Vec<String>,
    /// Defaults to `instances.created_by`.
    pub created_by: Option<String>,
}

impl CreateInstanceRequest {
    pub fn new(purpose: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_themes<I, S>(mut self, themes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.themes = themes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flows<I, S>(mut self, flows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flows = flows.into_iter().map(Into::into).collect();
        self
    }

    pub fn created_by(mut self, actor: &str) -> Self {
        self.created_by = Some(actor.to_string());
        self
    }
}

/// Result of [`InstanceManager::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitializeReport {
    pub repository_created: bool,
    pub initial_commit: Option<String>,
    pub sentinel_created: bool,
    pub database_created: bool,
    /// Canonical branch name, when it could be ensured.
    pub canonical_branch: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationReport {
    pub instance: Instance,
    pub files_copied: usize,
    /// Non-blocking observations, e.g. uncommitted changes in the repo.
    pub warnings: Vec<String>,
    pub recovery_point: String,
    pub message: String,
}

/// Result of [`InstanceManager::get_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance: Instance,
    pub workspace_exists: bool,
    pub branch_info: Option<BranchInfo>,
    pub merges: Vec<MergeRecord>,
    /// Disagreements between the store record and the workspace on disk.
    pub drift: Vec<String>,
}

impl StatusReport {
    pub fn has_drift(&self) -> bool {
        !self.drift.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivalReport {
    pub instance_id: String,
    pub previous_status: InstanceStatus,
    pub archived_workspace: PathBuf,
    pub message: String,
}

/// Result of [`InstanceManager::initiate_merge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeInitiation {
    pub merge: MergeRecord,
    pub conflicts: Vec<ConflictPresentation>,
    pub additions: Vec<Addition>,
    pub warnings: Vec<String>,
    pub message: String,
}

/// Result of [`InstanceManager::check_code_changes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChangeCheck {
    pub report: CodeChangeReport,
    pub status: ReconciliationStatus,
    /// Row id of the recorded observation; `None` when HEAD was unchanged.
    pub state_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct InstanceManager {
    layout: ProjectLayout,
    config: AppConfig,
    store: Arc<dyn InstanceStore>,
    git: GitAdapter,
    recovery: Arc<RecoveryManager>,
    audit: Arc<AuditLog>,
    detector: Arc<ConflictDetector>,
    resolver: ConflictResolver,
    optimizer: Arc<PerformanceOptimizer>,
    authority: AuthorityGuard,
}

impl InstanceManager {
    /// Wire every component for the project at `root`.
    pub fn new<P: AsRef<Path>>(
        root: P,
        config: AppConfig,
        store: Arc<dyn InstanceStore>,
        themes: Arc<dyn ThemeResolver>,
    ) -> Self {
        let root = root.as_ref();
        let layout = ProjectLayout::new(root, &config);
        let audit = Arc::new(AuditLog::new(layout.audit_dir(), config.audit.retention_days));
        let backups = Arc::new(BackupStore::new(
            layout.backups_dir(),
            layout.bookkeeping_paths(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            layout.clone(),
            backups,
            Arc::clone(&store),
            config.recovery.clone(),
        ));
        let optimizer = Arc::new(PerformanceOptimizer::for_project(
            &config.performance,
            fsutil::count_files(layout.state_dir()),
        ));
        let detector = Arc::new(ConflictDetector::new(
            layout.clone(),
            config.conflicts.clone(),
            Arc::clone(&optimizer),
        ));
        let resolver = ConflictResolver::new(
            layout.clone(),
            config.conflicts.clone(),
            Arc::clone(&detector),
            Arc::clone(&store),
            Arc::clone(&recovery),
            Arc::clone(&audit),
        );
        let git = GitAdapter::new(root, &config, themes);
        let authority = AuthorityGuard::new(layout.clone(), Arc::clone(&audit));

        info!(root = %root.display(), "instance manager ready");
        Self {
            layout,
            config,
            store,
            git,
            recovery,
            audit,
            detector,
            resolver,
            optimizer,
            authority,
        }
    }

    /// Open the project at `root` with its config file (if any), the bundled
    /// SQLite store and the theme index of the canonical state.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, CoreError> {
        let root = root.as_ref();
        let config = AppConfig::load_for_project(root)?;
        config.validate()?;
        let layout = ProjectLayout::new(root, &config);
        let db = Database::new(layout.registry_database())?;
        db.initialize()?;
        let themes = ThemeIndex::load(layout.state_dir());
        debug!(themes = themes.themes().len(), "theme index loaded");
        Ok(Self::new(root, config, Arc::new(db), Arc::new(themes)))
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn git(&self) -> &GitAdapter {
        &self.git
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.optimizer.stats()
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Prepare a project: canonical state dir with its sentinel and
    /// database, the instance tree, and the git repository. Safe to repeat.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<InitializeReport, CoreError> {
        let mut warnings = Vec::new();
        let sentinel_created = self.authority.ensure_sentinel()?;

        let canonical = self.layout.canonical_database();
        let database_created = !canonical.exists();
        if database_created {
            Database::new(&canonical)?;
        }
        self.layout.ensure_instances_tree()?;

        let init = self.git.initialize_repository()?;
        let canonical_branch = match self.git.ensure_default_canonical_branch() {
            Ok(branch) => Some(branch.name),
            Err(e) => {
                warn!(error = %e, "canonical branch not ensured");
                warnings.push(format!("canonical branch not ensured: {e}"));
                None
            }
        };

        info!(
            repository_created = init.created,
            sentinel_created, database_created, "project initialized"
        );
        Ok(InitializeReport {
            repository_created: init.created,
            initial_commit: init.initial_commit,
            sentinel_created,
            database_created,
            canonical_branch,
            warnings,
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn id_taken(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self.store.get_instance(id)?.is_some()
            || self.layout.active_workspace(id).exists()
            || self.layout.completed_workspace(id).exists())
    }

    /// Create an isolated copy of canonical state and register it.
    ///
    /// Any failure after the recovery point is taken rolls the instance tree
    /// back and removes the partial workspace before the error is returned.
    #[instrument(skip(self, request), fields(purpose = %request.purpose))]
    pub fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<CreationReport, CoreError> {
        if !self.git.is_repository() {
            return Err(
                GitError::RepositoryNotFound(self.layout.root().display().to_string()).into(),
            );
        }
        let mut warnings = Vec::new();
        let base_hash = match self.git.status() {
            Ok(status) => {
                if status.dirty {
                    warn!(changed = status.changed.len(), "repository has uncommitted changes");
                    warnings.push(format!(
                        "repository has {} uncommitted change(s)",
                        status.changed.len()
                    ));
                }
                status.hash
            }
            Err(e) => {
                warn!(error = %e, "cannot read repository status");
                warnings.push(format!("cannot read repository status: {e}"));
                None
            }
        };

        let id = match request.id {
            Some(id) => {
                validate_instance_id(&id)?;
                id
            }
            None => generate_instance_id(&request.purpose, &request.themes, |candidate| {
                self.id_taken(candidate)
            })?,
        };
        if self.id_taken(&id)? {
            return Err(InstanceError::AlreadyExists(id).into());
        }

        if !self.layout.state_dir().is_dir() {
            return Err(InstanceError::CanonicalUnavailable(format!(
                "state directory {} does not exist",
                self.layout.relative(self.layout.state_dir()).display()
            ))
            .into());
        }
        if !self.layout.canonical_database().is_file() {
            return Err(InstanceError::CanonicalUnavailable(format!(
                "database {} does not exist",
                self.layout.relative(&self.layout.canonical_database()).display()
            ))
            .into());
        }

        let actor = request
            .created_by
            .clone()
            .unwrap_or_else(|| self.config.instances.created_by.clone());
        self.layout.ensure_instances_tree()?;
        let context = RecoveryContext::for_instance(&id).with_actor(&actor);
        let point = self.recovery.create_recovery_point(
            OperationType::InstanceCreation,
            &format!("create instance {id}"),
            context.clone(),
        )?;

        let workspace_path = self.layout.active_workspace(&id);
        let now = Utc::now();
        let instance = Instance {
            id: id.clone(),
            created_from: MAIN_INSTANCE_NAME.to_string(),
            created_by: actor.clone(),
            purpose: request.purpose,
            themes: request.themes,
            flows: request.flows,
            status: InstanceStatus::Active,
            db_path: workspace_path.join(self.layout.database_file_name()),
            workspace_path,
            git_base_hash: base_hash,
            created_at: now,
            updated_at: now,
        };

        let files_copied = match self.build_instance(&instance) {
            Ok(copied) => copied,
            Err(e) => {
                error!(id = %id, error = %e, "instance creation failed");
                let failure = self.recovery.handle_operation_failure(
                    OperationType::InstanceCreation,
                    &e.to_string(),
                    &context,
                );
                self.audit.log_event(
                    AuditEventType::OperationFailed,
                    &actor,
                    &format!("create_instance {id} failed"),
                    json!({
                        "instance_id": id,
                        "error": e.to_string(),
                        "recovered": failure.recovered,
                        "rollback": failure.message,
                    }),
                    AuditLevel::Detailed,
                );
                return Err(InstanceError::OperationFailed {
                    operation: "create_instance".into(),
                    detail: e.to_string(),
                    rollback: Some(failure.message),
                }
                .into());
            }
        };

        self.audit.log_event(
            AuditEventType::InstanceCreated,
            &actor,
            &format!("created instance {id}"),
            json!({
                "instance_id": id,
                "purpose": instance.purpose,
                "themes": instance.themes,
                "flows": instance.flows,
                "files_copied": files_copied,
                "recovery_point": point,
            }),
            AuditLevel::Standard,
        );
        self.optimizer.cache_instance(&instance);
        info!(id = %id, files_copied, "instance created");

        Ok(CreationReport {
            message: format!("created instance {id} ({files_copied} file(s) copied)"),
            instance,
            files_copied,
            warnings,
            recovery_point: point,
        })
    }

    fn build_instance(&self, instance: &Instance) -> Result<usize, CoreError> {
        let copied = workspace::populate(
            &self.layout,
            &self.config.instances.excluded_subtrees,
            &instance.workspace_path,
        )?;
        workspace::write_metadata(
            &instance.workspace_path,
            instance,
            &self.config.instances.expected_duration,
        )?;
        self.store.create_instance(instance)?;
        Ok(copied)
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<Instance>, CoreError> {
        if let Some(instance) = self.optimizer.cached_instance(id) {
            return Ok(Some(instance));
        }
        let instance = self.store.get_instance(id)?;
        if let Some(instance) = &instance {
            self.optimizer.cache_instance(instance);
        }
        Ok(instance)
    }

    pub fn list_active(&self) -> Result<Vec<Instance>, CoreError> {
        Ok(self.store.list_active()?)
    }

    /// The store record of `id` plus any disagreement with what is on disk.
    pub fn get_status(&self, id: &str) -> Result<StatusReport, CoreError> {
        let instance = self
            .get_instance(id)?
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;
        let workspace_exists = instance.workspace_path.is_dir();
        let branch_info = if workspace_exists {
            match workspace::read_branch_info(&instance.workspace_path) {
                Ok(info) => info,
                Err(e) => {
                    warn!(id, error = %e, "unreadable branch info");
                    None
                }
            }
        } else {
            None
        };

        let mut drift = Vec::new();
        if !workspace_exists {
            drift.push(format!(
                "workspace {} is missing",
                self.layout.relative(&instance.workspace_path).display()
            ));
        } else {
            match &branch_info {
                None => drift.push("branch info is missing or unreadable".into()),
                Some(info) => {
                    if info.instance_id != instance.id {
                        drift.push(format!("branch info names instance {}", info.instance_id));
                    }
                    if info.status != instance.status {
                        drift.push(format!(
                            "branch info says {}, store says {}",
                            info.status, instance.status
                        ));
                    }
                }
            }
        }
        let active = self.layout.active_workspace(id);
        if !instance.status.has_active_workspace() && active.exists() {
            drift.push(format!(
                "{} instance still has an active workspace",
                instance.status
            ));
        }
        if !drift.is_empty() {
            debug!(id, drift = drift.len(), "instance drift detected");
        }

        Ok(StatusReport {
            merges: self.store.list_merges_for(id)?,
            instance,
            workspace_exists,
            branch_info,
            drift,
        })
    }

    /// Move an instance's workspace to `completed/` and mark it archived.
    /// Archiving twice fails with not-found and moves nothing.
    #[instrument(skip(self))]
    pub fn archive_instance(&self, id: &str, actor: &str) -> Result<ArchivalReport, CoreError> {
        self.authority
            .require_main("archive_instance", MAIN_INSTANCE_NAME, actor)?;
        let instance = self
            .store
            .get_instance(id)?
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;
        let active = self.layout.active_workspace(id);
        if instance.status == InstanceStatus::Archived || !active.is_dir() {
            return Err(InstanceError::NotFound(id.to_string()).into());
        }
        if !instance.status.can_transition_to(InstanceStatus::Archived) {
            return Err(InstanceError::InvalidTransition {
                id: id.to_string(),
                from: instance.status.to_string(),
                to: InstanceStatus::Archived.to_string(),
            }
            .into());
        }

        let archived = self.layout.completed_workspace(id);
        if let Err(e) = workspace::set_branch_status(&active, InstanceStatus::Archived) {
            warn!(id, error = %e, "failed to update branch info");
        }
        if let Err(e) = fsutil::move_dir(&active, &archived) {
            if let Err(e) = workspace::set_branch_status(&active, instance.status) {
                warn!(id, error = %e, "failed to restore branch info");
            }
            return Err(InstanceError::OperationFailed {
                operation: "archive_instance".into(),
                detail: e.to_string(),
                rollback: None,
            }
            .into());
        }
        if let Err(e) = self.store.archive_instance(id, &archived) {
            error!(id, error = %e, "store update failed, moving workspace back");
            let rollback = match fsutil::move_dir(&archived, &active) {
                Ok(()) => {
                    if let Err(e) = workspace::set_branch_status(&active, instance.status) {
                        warn!(id, error = %e, "failed to restore branch info");
                    }
                    "workspace moved back".to_string()
                }
                Err(e) => format!("workspace left in completed/: {e}"),
            };
            return Err(InstanceError::OperationFailed {
                operation: "archive_instance".into(),
                detail: e.to_string(),
                rollback: Some(rollback),
            }
            .into());
        }
        self.optimizer.invalidate_instance(id);

        self.audit.log_event(
            AuditEventType::InstanceArchived,
            actor,
            &format!("archived instance {id}"),
            json!({
                "instance_id": id,
                "previous_status": instance.status,
                "archived_workspace": self.layout.relative(&archived).display().to_string(),
            }),
            AuditLevel::Standard,
        );
        info!(id, "instance archived");
        Ok(ArchivalReport {
            instance_id: id.to_string(),
            previous_status: instance.status,
            message: format!("archived {id}"),
            archived_workspace: archived,
        })
    }

    // -----------------------------------------------------------------------
    // Merges
    // -----------------------------------------------------------------------

    fn merge_record(&self, merge_id: &str) -> Result<MergeRecord, CoreError> {
        self.store
            .get_merge_record(merge_id)?
            .ok_or_else(|| ConflictError::MergeNotFound(merge_id.to_string()).into())
    }

    /// Start merging `source` into `target`: record the merge, detect
    /// conflicts, persist the counts and write a review file per conflict.
    #[instrument(skip(self))]
    pub fn initiate_merge(
        &self,
        source: &str,
        target: &str,
        actor: &str,
    ) -> Result<MergeInitiation, CoreError> {
        self.authority.require_main("initiate_merge", target, actor)?;
        let instance = self
            .store
            .get_instance(source)?
            .ok_or_else(|| InstanceError::NotFound(source.to_string()))?;
        if !instance.status.can_transition_to(InstanceStatus::Merging) {
            return Err(InstanceError::InvalidTransition {
                id: source.to_string(),
                from: instance.status.to_string(),
                to: InstanceStatus::Merging.to_string(),
            }
            .into());
        }
        let workspace_path = self.layout.active_workspace(source);
        if !workspace_path.is_dir() {
            return Err(ConflictError::WorkspaceMissing(source.to_string()).into());
        }

        let mut merge = MergeRecord::new(source, target);
        let merge_id = merge.merge_id.clone();
        self.store.create_merge(&merge)?;
        let superseded = self.supersede_open_merges(source, &merge_id)?;
        self.store
            .update_instance_status(source, InstanceStatus::Merging)?;
        self.optimizer.invalidate_instance(source);
        if let Err(e) = workspace::set_branch_status(&workspace_path, InstanceStatus::Merging) {
            warn!(source, error = %e, "failed to update branch info");
        }

        let detection = match self.detector.detect_conflicts(&merge_id, source, target) {
            Ok(detection) => detection,
            Err(e) => {
                self.abandon_merge(&instance, &merge_id, &e.to_string(), actor);
                return Err(e.into());
            }
        };

        let status = detection.merge_status();
        let outcome = MergeOutcome {
            conflicts_detected: Some(detection.count() as u32),
            conflicts_resolved: Some(0),
            conflict_types: Some(detection.types()),
            ..Default::default()
        };
        self.store.update_merge_outcome(&merge_id, &outcome)?;
        self.store.update_merge_status(&merge_id, status)?;
        merge = self.merge_record(&merge_id)?;

        let mut warnings = detection.warnings.clone();
        warnings.extend(superseded.iter().map(|id| format!("merge {id} superseded")));
        let mut conflicts = Vec::with_capacity(detection.count());
        for conflict in &detection.conflicts {
            match self.resolver.present(conflict, &merge_id) {
                Ok(presentation) => conflicts.push(presentation),
                Err(e) => {
                    warn!(conflict_id = %conflict.id, error = %e, "failed to present conflict");
                    warnings.push(format!("{}: {e}", conflict.id));
                }
            }
        }

        log_merge_event(&self.layout, &merge, "initiated");
        self.audit.log_event(
            AuditEventType::MergeInitiated,
            actor,
            &format!("initiated merge of {source} into {target}"),
            json!({
                "merge_id": merge_id,
                "source": source,
                "target": target,
                "status": status,
                "conflicts_detected": merge.conflicts_detected,
                "conflict_types": merge.conflict_types,
                "superseded": superseded,
            }),
            AuditLevel::Standard,
        );
        if detection.count() > 0 {
            let ids: Vec<&str> = detection.conflicts.iter().map(|c| c.id.as_str()).collect();
            self.audit.log_event(
                AuditEventType::ConflictDetected,
                actor,
                &format!("{} conflict(s) in {merge_id}", detection.count()),
                json!({
                    "merge_id": merge_id,
                    "conflicts": ids,
                    "types": merge.conflict_types,
                }),
                AuditLevel::Detailed,
            );
        }

        let message = if status == MergeStatus::Ready {
            format!(
                "merge {merge_id} is ready: no conflicts, {} addition(s)",
                detection.additions.len()
            )
        } else {
            format!(
                "merge {merge_id} has {} conflict(s) to resolve",
                detection.count()
            )
        };
        info!(merge_id = %merge_id, status = %status, conflicts = detection.count(), "merge initiated");
        Ok(MergeInitiation {
            merge,
            conflicts,
            additions: detection.additions,
            warnings,
            message,
        })
    }

    /// Fail every other merge of `source` that has not failed yet, so only
    /// `replacement` can be resolved or completed.
    fn supersede_open_merges(&self, source: &str, replacement: &str) -> Result<Vec<String>, CoreError> {
        let mut superseded = Vec::new();
        for record in self.store.list_merges_for(source)? {
            if record.merge_id == replacement || record.status == MergeStatus::Failed {
                continue;
            }
            let outcome = MergeOutcome {
                error: Some(format!("superseded by {replacement}")),
                ..Default::default()
            };
            self.store.update_merge_outcome(&record.merge_id, &outcome)?;
            self.store
                .update_merge_status(&record.merge_id, MergeStatus::Failed)?;
            let review = self.layout.conflict_workspace(&record.merge_id);
            if review.exists() {
                if let Err(e) = std::fs::remove_dir_all(&review) {
                    warn!(merge_id = %record.merge_id, error = %e, "failed to remove review files");
                }
            }
            if let Some(updated) = self.store.get_merge_record(&record.merge_id)? {
                log_merge_event(&self.layout, &updated, "superseded");
            }
            debug!(merge_id = %record.merge_id, replacement, "merge superseded");
            superseded.push(record.merge_id);
        }
        Ok(superseded)
    }

    /// Put `instance` back where it was before a merge that never got past
    /// detection.
    fn abandon_merge(&self, instance: &Instance, merge_id: &str, reason: &str, actor: &str) {
        error!(merge_id, error = reason, "conflict detection failed");
        let outcome = MergeOutcome {
            error: Some(reason.to_string()),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .update_merge_outcome(merge_id, &outcome)
            .and_then(|()| self.store.update_merge_status(merge_id, MergeStatus::Failed))
        {
            warn!(merge_id, error = %e, "failed to mark merge failed");
        }
        if let Err(e) = self
            .store
            .update_instance_status(&instance.id, instance.status)
        {
            warn!(id = %instance.id, error = %e, "failed to restore instance status");
        }
        if let Err(e) = workspace::set_branch_status(&instance.workspace_path, instance.status) {
            warn!(id = %instance.id, error = %e, "failed to restore branch info");
        }
        self.optimizer.invalidate_instance(&instance.id);
        if let Ok(Some(record)) = self.store.get_merge_record(merge_id) {
            log_merge_event(&self.layout, &record, "failed");
        }
        self.audit.log_event(
            AuditEventType::MergeFailed,
            actor,
            &format!("merge {merge_id} failed during detection"),
            json!({ "merge_id": merge_id, "source": instance.id, "error": reason }),
            AuditLevel::Detailed,
        );
    }

    /// Re-detect the conflicts of an open merge and replace their review
    /// files. Resolutions are checked against the latest presentation.
    pub fn present_conflicts(
        &self,
        merge_id: &str,
    ) -> Result<Vec<ConflictPresentation>, CoreError> {
        let merge = self.merge_record(merge_id)?;
        let detection = self
            .detector
            .detect_conflicts(merge_id, &merge.source, &merge.target)?;
        let review = self.layout.conflict_workspace(merge_id);
        if review.exists() {
            std::fs::remove_dir_all(&review)?;
        }
        detection
            .conflicts
            .iter()
            .map(|c| self.resolver.present(c, merge_id).map_err(CoreError::from))
            .collect()
    }

    /// Apply caller-chosen resolutions to canonical state.
    #[instrument(skip(self, resolutions), fields(count = resolutions.len()))]
    pub fn apply_resolutions(
        &self,
        merge_id: &str,
        resolutions: &BTreeMap<String, Resolution>,
        actor: &str,
    ) -> Result<ResolutionReport, CoreError> {
        let merge = self.merge_record(merge_id)?;
        self.authority
            .require_main("apply_resolutions", &merge.target, actor)?;
        let report = self.resolver.apply_resolutions(merge_id, resolutions, actor);
        self.optimizer.invalidate_instance(&merge.source);
        report
    }

    /// Fold a resolved merge into its target and archive the source.
    #[instrument(skip(self))]
    pub fn complete_merge(&self, merge_id: &str, actor: &str) -> Result<CompletionReport, CoreError> {
        let merge = self.merge_record(merge_id)?;
        self.authority
            .require_main("complete_merge", &merge.target, actor)?;
        let report = self.resolver.complete_merge(merge_id, actor);
        self.optimizer.invalidate_instance(&merge.source);
        report
    }

    /// Detect conflicts of every active instance against canonical state,
    /// at most `performance.worker_count` at a time. Detection here is a
    /// preview: nothing is recorded and no merge status changes.
    pub async fn detect_all_conflicts(
        &self,
    ) -> Result<BatchReport<String, DetectionResult>, CoreError> {
        let instances = self.store.list_active()?;
        let jobs: Vec<_> = instances
            .into_iter()
            .map(|instance| {
                let detector = Arc::clone(&self.detector);
                let id = instance.id;
                let job_id = id.clone();
                let job = move || {
                    detector.detect_conflicts(
                        &format!("preview-{job_id}"),
                        &job_id,
                        MAIN_INSTANCE_NAME,
                    )
                };
                (id, job)
            })
            .collect();
        let report = self.optimizer.pool().run_blocking(jobs).await;
        info!(
            succeeded = report.success_count(),
            failed = report.failure_count(),
            "batch detection finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Code changes and maintenance
    // -----------------------------------------------------------------------

    /// Compare HEAD with the last recorded hash and record the impact on
    /// organizational themes.
    #[instrument(skip(self))]
    pub fn check_code_changes(&self, actor: &str) -> Result<CodeChangeCheck, CoreError> {
        let last = self.store.latest_git_state()?;
        let report = self
            .git
            .detect_code_changes(last.as_ref().map(|s| s.current_hash.as_str()))?;

        let status = if report.baseline {
            ReconciliationStatus::Baseline
        } else if report.has_changes() {
            ReconciliationStatus::Pending
        } else {
            ReconciliationStatus::Current
        };
        let unchanged = last
            .as_ref()
            .is_some_and(|s| s.current_hash == report.to_hash);
        if unchanged {
            debug!(hash = %report.to_hash, "HEAD unchanged since last check");
            return Ok(CodeChangeCheck {
                report,
                status,
                state_id: None,
            });
        }

        let state = GitProjectState {
            id: 0,
            project_root: self.layout.root().display().to_string(),
            current_hash: report.to_hash.clone(),
            last_known_hash: report.from_hash.clone(),
            change_summary: report.summary.clone(),
            affected_themes: report.affected_themes.clone(),
            reconciliation_status: status,
            recorded_at: Utc::now(),
        };
        let state_id = self.store.record_git_state(&state)?;
        for change in &report.changes {
            let impact = FileChangeImpact {
                file_path: change.path.clone(),
                change_kind: change.kind.as_str().to_string(),
                themes: change.themes.clone(),
            };
            if let Err(e) = self.store.record_file_change_impact(state_id, &impact) {
                warn!(path = %change.path, error = %e, "failed to record file impact");
            }
        }

        self.audit.log_event(
            AuditEventType::CodeChangeDetected,
            actor,
            &format!("code at {}: {}", short_hash(&report.to_hash), report.summary),
            json!({
                "from": report.from_hash,
                "to": report.to_hash,
                "changed_files": report.changes.len(),
                "affected_themes": report.affected_themes,
                "status": status,
            }),
            AuditLevel::Standard,
        );
        Ok(CodeChangeCheck {
            report,
            status,
            state_id: Some(state_id),
        })
    }

    /// Prune backups past retention. Returns the number removed.
    pub fn cleanup_old_backups(&self, actor: &str) -> Result<usize, CoreError> {
        let removed = self.recovery.cleanup_old_backups()?;
        self.audit.log_event(
            AuditEventType::MaintenancePerformed,
            actor,
            &format!("pruned {removed} backup(s)"),
            json!({
                "removed": removed,
                "retention_days": self.config.recovery.backup_retention_days,
            }),
            AuditLevel::Basic,
        );
        Ok(removed)
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
