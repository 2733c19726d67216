//! On-disk layout of a project.
//!
//! ```text
//! <root>/
//!   <state_dir>/                 canonical state (carries .main-instance)
//!     <database_file>
//!   <instances_dir>/
//!     .config.json
//!     .merge-log.jsonl
//!     active/<id>/
//!     completed/<id>/
//!     conflicts/<merge-id>/
//!     .backups/  .recovery/  .audit/
//!     .registry/instances.db     instance and merge bookkeeping
//! ```
//!
//! These names are stable: existing projects on disk depend on them.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

/// Zero-byte file marking a workspace as the canonical "main" one.
pub const MAIN_SENTINEL: &str = ".main-instance";
/// Per-instance metadata file.
pub const BRANCH_INFO_FILE: &str = ".branch-info.json";
/// Per-instance free-text summary.
pub const WORK_SUMMARY_FILE: &str = ".work-summary.md";
/// Instance-system descriptor inside the instances root.
pub const INSTANCES_CONFIG_FILE: &str = ".config.json";
/// Append-only merge log inside the instances root.
pub const MERGE_LOG_FILE: &str = ".merge-log.jsonl";

/// Bookkeeping directories under the instances root that snapshots of the
/// instances root never capture or delete.
pub const BOOKKEEPING_DIRS: &[&str] = &[".backups", ".recovery", ".audit", ".registry"];

/// File name of the bookkeeping database inside `.registry/`.
pub const REGISTRY_DATABASE_FILE: &str = "instances.db";

/// Name used for the canonical workspace in merge targets and logs.
pub const MAIN_INSTANCE_NAME: &str = "main";

/// Resolved absolute paths for one project.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
    state_dir: PathBuf,
    database_file: PathBuf,
    instances_dir: PathBuf,
}

impl ProjectLayout {
    /// Resolve the layout of the project at `root` under `config`.
    pub fn new<P: AsRef<Path>>(root: P, config: &AppConfig) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            state_dir: root.join(&config.paths.state_dir),
            database_file: config.paths.database_file.clone(),
            instances_dir: root.join(&config.paths.instances_dir),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The canonical workspace.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// File name of the database inside any workspace.
    pub fn database_file_name(&self) -> &Path {
        &self.database_file
    }

    /// The canonical database.
    pub fn canonical_database(&self) -> PathBuf {
        self.state_dir.join(&self.database_file)
    }

    pub fn main_sentinel(&self) -> PathBuf {
        self.state_dir.join(MAIN_SENTINEL)
    }

    pub fn instances_dir(&self) -> &Path {
        &self.instances_dir
    }

    pub fn active_dir(&self) -> PathBuf {
        self.instances_dir.join("active")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.instances_dir.join("completed")
    }

    pub fn conflicts_dir(&self) -> PathBuf {
        self.instances_dir.join("conflicts")
    }

    pub fn active_workspace(&self, id: &str) -> PathBuf {
        self.active_dir().join(id)
    }

    pub fn completed_workspace(&self, id: &str) -> PathBuf {
        self.completed_dir().join(id)
    }

    pub fn conflict_workspace(&self, merge_id: &str) -> PathBuf {
        self.conflicts_dir().join(merge_id)
    }

    pub fn instances_config(&self) -> PathBuf {
        self.instances_dir.join(INSTANCES_CONFIG_FILE)
    }

    pub fn merge_log(&self) -> PathBuf {
        self.instances_dir.join(MERGE_LOG_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.instances_dir.join(".backups")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.instances_dir.join(".recovery")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.instances_dir.join(".audit")
    }

    /// The store backing instance and merge records. Kept outside the state
    /// tree so that restoring canonical state never rewrites it.
    pub fn registry_database(&self) -> PathBuf {
        self.instances_dir.join(".registry").join(REGISTRY_DATABASE_FILE)
    }

    /// Paths that tree snapshots and mirrors must leave alone.
    pub fn bookkeeping_paths(&self) -> Vec<PathBuf> {
        BOOKKEEPING_DIRS
            .iter()
            .map(|d| self.instances_dir.join(d))
            .collect()
    }

    /// Workspace directory for a merge target: `main` resolves to the
    /// canonical state, anything else to an active instance.
    pub fn workspace_for(&self, name: &str) -> PathBuf {
        if name == MAIN_INSTANCE_NAME {
            self.state_dir.clone()
        } else {
            self.active_workspace(name)
        }
    }

    /// Path of `path` relative to the project root, for logs and git.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    /// Create the instance tree and the descriptor if missing.
    pub fn ensure_instances_tree(&self) -> std::io::Result<()> {
        for dir in [self.active_dir(), self.completed_dir(), self.conflicts_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        let descriptor_path = self.instances_config();
        if !descriptor_path.exists() {
            let descriptor = InstancesDescriptor {
                version: 1,
                created_at: Utc::now().to_rfc3339(),
                main_workspace: self.relative(&self.state_dir).display().to_string(),
                state_dir: self.relative(&self.state_dir).display().to_string(),
            };
            let json = serde_json::to_string_pretty(&descriptor)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(descriptor_path, json)?;
        }
        Ok(())
    }
}

/// Contents of `.instances/.config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstancesDescriptor {
    pub version: u32,
    pub created_at: String,
    pub main_workspace: String,
    pub state_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_paths() {
        let layout = ProjectLayout::new("/proj", &AppConfig::default());
        assert_eq!(layout.state_dir(), Path::new("/proj/.org-state"));
        assert_eq!(
            layout.canonical_database(),
            PathBuf::from("/proj/.org-state/project.db")
        );
        assert_eq!(
            layout.active_workspace("auth-refactor"),
            PathBuf::from("/proj/.instances/active/auth-refactor")
        );
        assert_eq!(layout.workspace_for("main"), PathBuf::from("/proj/.org-state"));
        assert_eq!(
            layout.merge_log(),
            PathBuf::from("/proj/.instances/.merge-log.jsonl")
        );
        assert!(layout
            .bookkeeping_paths()
            .iter()
            .any(|p| layout.registry_database().starts_with(p)));
    }

    #[test]
    fn test_ensure_instances_tree_writes_descriptor_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path(), &AppConfig::default());
        layout.ensure_instances_tree().unwrap();
        assert!(layout.active_dir().is_dir());
        assert!(layout.completed_dir().is_dir());
        assert!(layout.conflicts_dir().is_dir());

        let first = std::fs::read_to_string(layout.instances_config()).unwrap();
        let descriptor: InstancesDescriptor = serde_json::from_str(&first).unwrap();
        assert_eq!(descriptor.state_dir, ".org-state");

        layout.ensure_instances_tree().unwrap();
        let second = std::fs::read_to_string(layout.instances_config()).unwrap();
        assert_eq!(first, second);
    }
}
