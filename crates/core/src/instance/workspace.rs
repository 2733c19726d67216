//! Instance workspace contents: the copied state tree, the database
//! snapshot and the two metadata files.

use std::fs;
use std::io;
use std::path::{Component, Path};

use tracing::debug;

use crate::db::Database;
use crate::errors::CoreError;
use crate::fsutil;
use crate::layout::{ProjectLayout, BRANCH_INFO_FILE, MAIN_SENTINEL, WORK_SUMMARY_FILE};
use crate::models::{BranchInfo, Instance, InstanceStatus};

/// Whether `rel` (relative to the canonical state dir) stays out of a new
/// workspace.
fn excluded(rel: &Path, database: &Path, excluded_subtrees: &[String]) -> bool {
    if rel == Path::new(MAIN_SENTINEL) || rel == database {
        return true;
    }
    let name = rel.to_string_lossy();
    let db = database.to_string_lossy();
    if name == format!("{db}-wal") || name == format!("{db}-shm") {
        return true;
    }
    match rel.components().next() {
        Some(Component::Normal(first)) => excluded_subtrees
            .iter()
            .any(|e| first == e.as_str() || rel == Path::new(e)),
        _ => false,
    }
}

/// Copy the canonical state into `workspace` and snapshot the canonical
/// database next to it, carrying over its modification time. Returns the
/// number of plain files copied.
pub(crate) fn populate(
    layout: &ProjectLayout,
    excluded_subtrees: &[String],
    workspace: &Path,
) -> Result<usize, CoreError> {
    let database = layout.database_file_name().to_path_buf();
    let copied = fsutil::copy_tree(layout.state_dir(), workspace, |rel| {
        excluded(rel, &database, excluded_subtrees)
    })?;
    let canonical = layout.canonical_database();
    let copy = workspace.join(&database);
    Database::open_read_only(&canonical)?.snapshot_to(&copy)?;
    // The detector compares modification times, so the copy starts out
    // level with its source.
    let modified = fs::metadata(&canonical)?.modified()?;
    fs::File::options().write(true).open(&copy)?.set_modified(modified)?;
    debug!(workspace = %workspace.display(), copied, "workspace populated");
    Ok(copied)
}

/// Write `.branch-info.json` and the `.work-summary.md` template.
pub(crate) fn write_metadata(
    workspace: &Path,
    instance: &Instance,
    expected_duration: &str,
) -> io::Result<()> {
    write_branch_info(workspace, &BranchInfo::from_instance(instance, expected_duration))?;
    let summary = format!(
        "# Work Summary: {id}\n\n\
         Purpose: {purpose}\n\
         Themes: {themes}\n\
         Flows: {flows}\n\
         Created: {created} by {by}\n\n\
         ## Changes\n\n\
         ## Decisions\n\n\
         ## Open Questions\n",
        id = instance.id,
        purpose = instance.purpose,
        themes = display_list(&instance.themes),
        flows = display_list(&instance.flows),
        created = instance.created_at.to_rfc3339(),
        by = instance.created_by,
    );
    fs::write(workspace.join(WORK_SUMMARY_FILE), summary)
}

fn display_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".into()
    } else {
        items.join(", ")
    }
}

fn write_branch_info(workspace: &Path, info: &BranchInfo) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(info)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fsutil::write_atomic(&workspace.join(BRANCH_INFO_FILE), &json)
}

/// The workspace's `.branch-info.json`; `None` if absent.
pub fn read_branch_info(workspace: &Path) -> io::Result<Option<BranchInfo>> {
    let raw = match fs::read_to_string(workspace.join(BRANCH_INFO_FILE)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Rewrite the status in `.branch-info.json`. A workspace without one is
/// left alone.
pub(crate) fn set_branch_status(workspace: &Path, status: InstanceStatus) -> io::Result<()> {
    if let Some(mut info) = read_branch_info(workspace)? {
        info.status = status;
        write_branch_info(workspace, &info)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::Utc;
    use std::path::PathBuf;

    #[test]
    fn test_exclusion_rules() {
        let db = Path::new("project.db");
        let subtrees = vec!["backups".to_string(), "settings.local.json".to_string()];
        for rel in [
            ".main-instance",
            "project.db",
            "project.db-wal",
            "backups",
            "backups/old.json",
            "settings.local.json",
        ] {
            assert!(excluded(Path::new(rel), db, &subtrees), "{rel} should be excluded");
        }
        for rel in ["themes/auth.json", "tasks/backups.json", "project.dbx"] {
            assert!(!excluded(Path::new(rel), db, &subtrees), "{rel} should be copied");
        }
    }

    #[test]
    fn test_populate_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();
        let layout = ProjectLayout::new(dir.path(), &config);
        let state = layout.state_dir();
        fs::create_dir_all(state.join("themes")).unwrap();
        fs::create_dir_all(state.join("backups")).unwrap();
        fs::write(state.join("themes/auth.json"), "{}").unwrap();
        fs::write(state.join("backups/b.json"), "{}").unwrap();
        fs::write(layout.main_sentinel(), "").unwrap();
        {
            let db = Database::new(layout.canonical_database()).unwrap();
            db.conn().execute_batch("CREATE TABLE notes (v TEXT)").unwrap();
        }
        let aged = std::time::SystemTime::now() - std::time::Duration::from_secs(2 * 3600);
        fs::File::options()
            .write(true)
            .open(layout.canonical_database())
            .unwrap()
            .set_modified(aged)
            .unwrap();

        let ws = layout.active_workspace("auth-work");
        let copied = populate(&layout, &config.instances.excluded_subtrees, &ws).unwrap();
        assert_eq!(copied, 1);
        assert!(ws.join("themes/auth.json").is_file());
        assert!(!ws.join("backups").exists());
        assert!(!ws.join(MAIN_SENTINEL).exists());
        let copy = Database::open_read_only(ws.join("project.db")).unwrap();
        assert_eq!(copy.table_names().unwrap(), vec!["notes".to_string()]);
        let mtime = |p: PathBuf| fs::metadata(p).unwrap().modified().unwrap();
        assert_eq!(
            mtime(ws.join("project.db")),
            mtime(layout.canonical_database())
        );

        let now = Utc::now();
        let instance = Instance {
            id: "auth-work".into(),
            created_from: "main".into(),
            created_by: "agent".into(),
            purpose: "login".into(),
            themes: vec!["authentication".into()],
            flows: vec![],
            status: InstanceStatus::Active,
            workspace_path: ws.clone(),
            db_path: ws.join("project.db"),
            git_base_hash: None,
            created_at: now,
            updated_at: now,
        };
        write_metadata(&ws, &instance, "1 week").unwrap();
        let info = read_branch_info(&ws).unwrap().unwrap();
        assert_eq!(info.instance_id, "auth-work");
        let summary = fs::read_to_string(ws.join(WORK_SUMMARY_FILE)).unwrap();
        assert!(summary.contains("Themes: authentication"));

        set_branch_status(&ws, InstanceStatus::Archived).unwrap();
        assert_eq!(
            read_branch_info(&ws).unwrap().unwrap().status,
            InstanceStatus::Archived
        );
        assert!(read_branch_info(&PathBuf::from("/nonexistent")).unwrap().is_none());
    }

    #[test]
    fn test_populate_fails_without_canonical_database() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path(), &AppConfig::default());
        fs::create_dir_all(layout.state_dir()).unwrap();
        let ws = layout.active_workspace("no-db");
        assert!(populate(&layout, &[], &ws).is_err());
    }
}
