//! Manifest-driven snapshots of arbitrary path sets.
//!
//! Each backup is a directory `<backups>/<backup-id>/` holding a copy of
//! every captured path under `data/<n>` and a `manifest.json` written last,
//! so a backup interrupted mid-copy has no manifest and is never restored.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::BackupError;
use crate::fsutil;

const MANIFEST_FILE: &str = "manifest.json";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// One captured path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupEntry {
    /// Absolute path the entry was captured from and restores to.
    pub original: PathBuf,
    /// Location inside the backup directory.
    pub stored: String,
    pub kind: EntryKind,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub backup_id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
    /// Requested paths that did not exist.
    #[serde(default)]
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Snapshot store rooted at one directory.
pub struct BackupStore {
    dir: PathBuf,
    /// Absolute paths never captured into, nor deleted by, a restore.
    protected: Vec<PathBuf>,
}

impl BackupStore {
    pub fn new<P: AsRef<Path>>(dir: P, protected: Vec<PathBuf>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            protected,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_protected(&self, path: &Path) -> bool {
        self.protected.iter().any(|p| path.starts_with(p))
    }

    fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.dir.join(backup_id)
    }

    /// Copy every existing path in `paths` into a new backup. Missing paths
    /// are skipped and listed in the manifest.
    pub fn create_backup(
        &self,
        paths: &[PathBuf],
        description: &str,
    ) -> Result<BackupManifest, BackupError> {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let backup_id = format!("backup-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8]);
        let root = self.backup_dir(&backup_id);
        fs::create_dir_all(root.join("data"))?;

        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        for (n, original) in paths.iter().enumerate() {
            let stored = format!("data/{n}");
            let target = root.join(&stored);
            let copy_err = |source| BackupError::Copy {
                path: original.display().to_string(),
                source,
            };
            if original.is_dir() {
                let files = fsutil::copy_tree(original, &target, |rel| {
                    self.is_protected(&original.join(rel))
                })
                .map_err(copy_err)?;
                entries.push(BackupEntry {
                    original: original.clone(),
                    stored,
                    kind: EntryKind::Directory,
                    files,
                });
            } else if original.is_file() {
                fs::copy(original, &target).map_err(copy_err)?;
                entries.push(BackupEntry {
                    original: original.clone(),
                    stored,
                    kind: EntryKind::File,
                    files: 1,
                });
            } else {
                debug!(path = %original.display(), "nothing to back up");
                skipped.push(original.clone());
            }
        }

        let manifest = BackupManifest {
            backup_id: backup_id.clone(),
            description: description.to_string(),
            created_at: now,
            entries,
            skipped,
        };
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| BackupError::Manifest {
            id: backup_id.clone(),
            detail: e.to_string(),
        })?;
        fsutil::write_atomic(&root.join(MANIFEST_FILE), &json)?;

        info!(
            backup_id = %backup_id,
            entries = manifest.entries.len(),
            skipped = manifest.skipped.len(),
            "backup created"
        );
        Ok(manifest)
    }

    pub fn get(&self, backup_id: &str) -> Result<BackupManifest, BackupError> {
        let path = self.backup_dir(backup_id).join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| BackupError::Manifest {
            id: backup_id.to_string(),
            detail: e.to_string(),
        })
    }

    /// Put every captured path back. Directories are mirrored, so restoring
    /// the same backup twice leaves the same tree as restoring it once.
    pub fn restore_backup(&self, backup_id: &str) -> Result<RestoreReport, BackupError> {
        self.restore_where(backup_id, |_| true)
    }

    /// Restore only the entries accepted by `filter`.
    pub fn restore_where<F>(&self, backup_id: &str, filter: F) -> Result<RestoreReport, BackupError>
    where
        F: Fn(&BackupEntry) -> bool,
    {
        let manifest = self.get(backup_id)?;
        let root = self.backup_dir(backup_id);
        let mut restored = Vec::new();

        for entry in manifest.entries.iter().filter(|e| filter(e)) {
            let source = root.join(&entry.stored);
            let copy_err = |source| BackupError::Copy {
                path: entry.original.display().to_string(),
                source,
            };
            match entry.kind {
                EntryKind::Directory => {
                    if entry.original.is_file() {
                        fs::remove_file(&entry.original).map_err(copy_err)?;
                    }
                    fsutil::mirror_tree(&source, &entry.original, &self.protected)
                        .map_err(copy_err)?;
                }
                EntryKind::File => {
                    if entry.original.is_dir() {
                        fs::remove_dir_all(&entry.original).map_err(copy_err)?;
                    }
                    if let Some(parent) = entry.original.parent() {
                        fs::create_dir_all(parent).map_err(copy_err)?;
                    }
                    fs::copy(&source, &entry.original).map_err(copy_err)?;
                }
            }
            restored.push(entry.original.clone());
        }

        info!(backup_id, restored = restored.len(), "backup restored");
        Ok(RestoreReport {
            backup_id: backup_id.to_string(),
            restored,
        })
    }

    /// All readable backups, oldest first.
    pub fn list(&self) -> Result<Vec<BackupManifest>, BackupError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.get(&id) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => debug!(backup_id = %id, error = %e, "skipping unreadable backup"),
            }
        }
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(manifests)
    }

    pub fn delete(&self, backup_id: &str) -> Result<(), BackupError> {
        let dir = self.backup_dir(backup_id);
        if !dir.is_dir() {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Delete backups older than `keep_days`. Returns how many were removed.
    pub fn cleanup(&self, keep_days: u32) -> Result<usize, BackupError> {
        let cutoff = Utc::now() - Duration::days(i64::from(keep_days));
        let mut removed = 0;
        for manifest in self.list()? {
            if manifest.created_at >= cutoff {
                continue;
            }
            match self.delete(&manifest.backup_id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(backup_id = %manifest.backup_id, error = %e, "failed to prune backup"),
            }
        }
        if removed > 0 {
            info!(removed, keep_days, "pruned old backups");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, String)> {
        let mut files: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                (
                    e.path().strip_prefix(dir).unwrap().to_path_buf(),
                    fs::read_to_string(e.path()).unwrap(),
                )
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        write(&state.join("themes/auth.json"), "v1");
        let db = dir.path().join("state/project.db");
        write(&db, "db-v1");

        let store = BackupStore::new(dir.path().join("backups"), vec![]);
        let manifest = store
            .create_backup(&[state.clone(), dir.path().join("missing")], "pre-op")
            .unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.skipped.len(), 1);

        write(&state.join("themes/auth.json"), "v2");
        write(&state.join("themes/new.json"), "new");
        store.restore_backup(&manifest.backup_id).unwrap();

        assert_eq!(fs::read_to_string(state.join("themes/auth.json")).unwrap(), "v1");
        assert!(!state.join("themes/new.json").exists());
        assert_eq!(fs::read_to_string(&db).unwrap(), "db-v1");
    }

    #[test]
    fn test_restore_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("instances");
        write(&root.join("active/a/.branch-info.json"), "{}");
        let protected = root.join(".backups");
        let store = BackupStore::new(&protected, vec![protected.clone()]);
        let manifest = store.create_backup(&[root.clone()], "instances").unwrap();

        write(&root.join("active/b/.branch-info.json"), "{}");
        store.restore_backup(&manifest.backup_id).unwrap();
        let once = snapshot(&root);
        store.restore_backup(&manifest.backup_id).unwrap();
        let twice = snapshot(&root);

        assert_eq!(once, twice);
        assert!(!root.join("active/b").exists());
        // The store's own directory survives a restore of its parent.
        assert!(protected.join(&manifest.backup_id).join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_missing_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path(), vec![]);
        assert!(matches!(
            store.restore_backup("backup-nope"),
            Err(BackupError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        write(&file, "x");
        let store = BackupStore::new(dir.path().join("backups"), vec![]);
        let a = store.create_backup(&[file.clone()], "a").unwrap();
        let b = store.create_backup(&[file.clone()], "b").unwrap();

        // Age the first backup.
        let mut old = a.clone();
        old.created_at = Utc::now() - Duration::days(30);
        fs::write(
            store.dir().join(&a.backup_id).join(MANIFEST_FILE),
            serde_json::to_vec(&old).unwrap(),
        )
        .unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.cleanup(7).unwrap(), 1);
        let left = store.list().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].backup_id, b.backup_id);
    }
}
