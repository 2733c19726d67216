//! Collaborator interfaces consumed by the components.
//!
//! Components receive only the interfaces they use, as `Arc<dyn ..>`, so a
//! caller can back them with the bundled SQLite [`Database`](crate::db::Database)
//! or with its own implementation.

use std::collections::BTreeMap;

use crate::errors::DatabaseError;
use crate::models::{
    FileChangeImpact, GitProjectState, Instance, InstanceStatus, MergeOutcome, MergeRecord,
    MergeStatus,
};

/// Authoritative bookkeeping for instances, merges, and code-change history.
pub trait InstanceStore: Send + Sync {
    fn create_instance(&self, instance: &Instance) -> Result<(), DatabaseError>;

    fn get_instance(&self, id: &str) -> Result<Option<Instance>, DatabaseError>;

    /// Instances whose workspace is still under `active/`.
    fn list_active(&self) -> Result<Vec<Instance>, DatabaseError>;

    fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError>;

    fn update_instance_status(&self, id: &str, status: InstanceStatus)
        -> Result<(), DatabaseError>;

    /// Mark archived and record the new workspace location.
    fn archive_instance(
        &self,
        id: &str,
        archived_path: &std::path::Path,
    ) -> Result<(), DatabaseError>;

    /// Remove a row entirely. Only used to undo a failed creation.
    fn delete_instance(&self, id: &str) -> Result<bool, DatabaseError>;

    fn create_merge(&self, merge: &MergeRecord) -> Result<(), DatabaseError>;

    fn update_merge_status(&self, merge_id: &str, status: MergeStatus)
        -> Result<(), DatabaseError>;

    fn update_merge_outcome(
        &self,
        merge_id: &str,
        outcome: &MergeOutcome,
    ) -> Result<(), DatabaseError>;

    fn get_merge_record(&self, merge_id: &str) -> Result<Option<MergeRecord>, DatabaseError>;

    fn list_merges_for(&self, source: &str) -> Result<Vec<MergeRecord>, DatabaseError>;

    /// Append a code-change observation; returns its row id.
    fn record_git_state(&self, state: &GitProjectState) -> Result<i64, DatabaseError>;

    fn latest_git_state(&self) -> Result<Option<GitProjectState>, DatabaseError>;

    fn record_file_change_impact(
        &self,
        git_state_id: i64,
        impact: &FileChangeImpact,
    ) -> Result<(), DatabaseError>;
}

/// Maps a source path to the organizational themes that claim it.
pub trait ThemeResolver: Send + Sync {
    fn themes_for_file(&self, path: &str) -> Vec<String>;
}

/// A fixed path → themes table.
#[derive(Debug, Clone, Default)]
pub struct StaticThemeResolver {
    table: BTreeMap<String, Vec<String>>,
}

impl StaticThemeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `theme` as an owner of `path`.
    pub fn with(mut self, path: &str, theme: &str) -> Self {
        let themes = self.table.entry(path.to_string()).or_default();
        if !themes.iter().any(|t| t == theme) {
            themes.push(theme.to_string());
        }
        self
    }
}

impl ThemeResolver for StaticThemeResolver {
    fn themes_for_file(&self, path: &str) -> Vec<String> {
        self.table.get(path).cloned().unwrap_or_default()
    }
}
