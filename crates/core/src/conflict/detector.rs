//! Conflict detection logic.
//!
//! The detector compares an instance workspace against its merge target,
//! artifact family by artifact family, and reports every artifact present on
//! both sides whose content differs. It never writes.
//!
//! | Family   | Where                                           | Compared by                 |
//! |----------|-------------------------------------------------|-----------------------------|
//! | theme    | `themes/*`                                      | SHA-256                     |
//! | flow     | `flows/*`                                       | SHA-256                     |
//! | task     | `tasks/completion-path.json`, `tasks/active/*`  | JSON minus volatile keys    |
//! | database | the workspace database file                     | modification-time heuristic |

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::ConflictConfig;
use crate::errors::ConflictError;
use crate::fsutil;
use crate::layout::ProjectLayout;
use crate::models::MergeStatus;
use crate::performance::PerformanceOptimizer;

pub const THEMES_DIR: &str = "themes";
pub const FLOWS_DIR: &str = "flows";
pub const ACTIVE_TASKS_DIR: &str = "tasks/active";
pub const COMPLETION_PATH_FILE: &str = "tasks/completion-path.json";

/// Keys that change on every touch of a task file and carry no meaning for
/// a merge.
const VOLATILE_KEYS: &[&str] = &[
    "updatedAt",
    "updated_at",
    "lastModified",
    "last_modified",
    "lastAccessed",
    "last_accessed",
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Artifact family a conflict belongs to.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Theme,
    Flow,
    Task,
    Database,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::Flow => "flow",
            Self::Task => "task",
            Self::Database => "database",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "theme" => Some(Self::Theme),
            "flow" => Some(Self::Flow),
            "task" => Some(Self::Task),
            "database" => Some(Self::Database),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer classification within a family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSubtype {
    /// Theme or flow file content differs.
    Content,
    /// The completion-path ledger differs.
    TaskLedger,
    /// A `task-*` file differs.
    Task,
    /// A `sidequest-*` file differs.
    Sidequest,
    /// Both database files exist and were modified too far apart.
    DatabaseDiverged,
    /// The instance has no database file.
    DatabaseMissingInInstance,
    /// The merge target has no database file.
    DatabaseMissingInMain,
}

impl ConflictSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::TaskLedger => "task_ledger",
            Self::Task => "task",
            Self::Sidequest => "sidequest",
            Self::DatabaseDiverged => "database_diverged",
            Self::DatabaseMissingInInstance => "database_missing_in_instance",
            Self::DatabaseMissingInMain => "database_missing_in_main",
        }
    }
}

/// A detected divergence between an instance and its merge target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conflict {
    /// `{merge_id}-{type}-{file}`, or `{merge_id}-database`.
    pub id: String,
    pub merge_id: String,
    pub conflict_type: ConflictType,
    pub subtype: ConflictSubtype,
    /// Path relative to the workspace root, `/`-separated.
    pub file: String,
    pub source_content: Option<String>,
    pub main_content: Option<String>,
    pub source_hash: Option<String>,
    pub main_hash: Option<String>,
}

impl Conflict {
    pub fn conflict_id(merge_id: &str, conflict_type: ConflictType, file: &str) -> String {
        match conflict_type {
            ConflictType::Database => format!("{merge_id}-database"),
            _ => format!("{merge_id}-{conflict_type}-{file}"),
        }
    }
}

/// A file only the instance has. Merged automatically on completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Addition {
    pub conflict_type: ConflictType,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionResult {
    pub merge_id: String,
    pub source: String,
    pub target: String,
    pub conflicts: Vec<Conflict>,
    pub additions: Vec<Addition>,
    /// Files compared on both sides.
    pub compared: usize,
    /// Single-item failures that did not stop the scan.
    pub warnings: Vec<String>,
}

impl DetectionResult {
    pub fn count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn types(&self) -> BTreeSet<ConflictType> {
        self.conflicts.iter().map(|c| c.conflict_type).collect()
    }

    pub fn find(&self, conflict_id: &str) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == conflict_id)
    }

    /// `ready` when nothing conflicts, `in-progress` otherwise.
    pub fn merge_status(&self) -> MergeStatus {
        if self.conflicts.is_empty() {
            MergeStatus::Ready
        } else {
            MergeStatus::InProgress
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Bytes,
    TaskJson,
}

/// Route a task-area file by its name.
fn task_route(name: &str) -> (ConflictSubtype, Comparator) {
    if name.starts_with("sidequest-") {
        (ConflictSubtype::Sidequest, Comparator::TaskJson)
    } else if name.starts_with("task-") {
        (ConflictSubtype::Task, Comparator::TaskJson)
    } else {
        (ConflictSubtype::Task, Comparator::Bytes)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct ConflictDetector {
    layout: ProjectLayout,
    config: ConflictConfig,
    optimizer: Arc<PerformanceOptimizer>,
}

impl ConflictDetector {
    pub fn new(
        layout: ProjectLayout,
        config: ConflictConfig,
        optimizer: Arc<PerformanceOptimizer>,
    ) -> Self {
        Self {
            layout,
            config,
            optimizer,
        }
    }

    /// Compare instance `source` against `target` (`main` or another
    /// instance id).
    #[instrument(skip(self))]
    pub fn detect_conflicts(
        &self,
        merge_id: &str,
        source: &str,
        target: &str,
    ) -> Result<DetectionResult, ConflictError> {
        let source_root = self.layout.active_workspace(source);
        if !source_root.is_dir() {
            return Err(ConflictError::WorkspaceMissing(source.to_string()));
        }
        let target_root = self.layout.workspace_for(target);
        if !target_root.is_dir() {
            return Err(ConflictError::WorkspaceMissing(target.to_string()));
        }

        let mut result = DetectionResult {
            merge_id: merge_id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            conflicts: Vec::new(),
            additions: Vec::new(),
            compared: 0,
            warnings: Vec::new(),
        };

        let sides = Sides {
            source: &source_root,
            target: &target_root,
        };
        self.scan_dir(&sides, THEMES_DIR, ConflictType::Theme, &mut result, |_| {
            (ConflictSubtype::Content, Comparator::Bytes)
        });
        self.scan_dir(&sides, FLOWS_DIR, ConflictType::Flow, &mut result, |_| {
            (ConflictSubtype::Content, Comparator::Bytes)
        });
        self.scan_file(
            &sides,
            COMPLETION_PATH_FILE,
            ConflictType::Task,
            (ConflictSubtype::TaskLedger, Comparator::TaskJson),
            &mut result,
        );
        self.scan_dir(&sides, ACTIVE_TASKS_DIR, ConflictType::Task, &mut result, task_route);
        self.scan_database(&sides, &mut result);

        info!(
            merge_id,
            conflicts = result.count(),
            additions = result.additions.len(),
            warnings = result.warnings.len(),
            "conflict detection complete"
        );
        Ok(result)
    }

    fn scan_dir<R>(
        &self,
        sides: &Sides<'_>,
        subdir: &str,
        conflict_type: ConflictType,
        result: &mut DetectionResult,
        route: R,
    ) where
        R: Fn(&str) -> (ConflictSubtype, Comparator),
    {
        let files = match fsutil::list_files(&sides.source.join(subdir), "") {
            Ok(files) => files,
            Err(e) => {
                warn!(subdir, error = %e, "cannot list instance files");
                result.warnings.push(format!("{subdir}: {e}"));
                return;
            }
        };
        for (name, _) in files {
            let rel = format!("{subdir}/{name}");
            self.scan_file(sides, &rel, conflict_type, route(&name), result);
        }
    }

    fn scan_file(
        &self,
        sides: &Sides<'_>,
        rel: &str,
        conflict_type: ConflictType,
        (subtype, comparator): (ConflictSubtype, Comparator),
        result: &mut DetectionResult,
    ) {
        let source = sides.source.join(rel);
        let target = sides.target.join(rel);
        if !source.is_file() {
            return;
        }
        if !target.is_file() {
            debug!(file = rel, "instance-only file");
            result.additions.push(Addition {
                conflict_type,
                file: rel.to_string(),
            });
            return;
        }

        result.compared += 1;
        match self.differs(&source, &target, comparator) {
            Ok(false) => {}
            Ok(true) => {
                let conflict = Conflict {
                    id: Conflict::conflict_id(&result.merge_id, conflict_type, rel),
                    merge_id: result.merge_id.clone(),
                    conflict_type,
                    subtype,
                    file: rel.to_string(),
                    source_content: read_lossy(&source),
                    main_content: read_lossy(&target),
                    source_hash: self.optimizer.hash_file(&source).ok(),
                    main_hash: self.optimizer.hash_file(&target).ok(),
                };
                debug!(id = %conflict.id, subtype = subtype.as_str(), "conflict detected");
                result.conflicts.push(conflict);
            }
            Err(e) => {
                warn!(file = rel, error = %e, "comparison failed, skipping file");
                result.warnings.push(format!("{rel}: {e}"));
            }
        }
    }

    fn differs(&self, a: &Path, b: &Path, comparator: Comparator) -> std::io::Result<bool> {
        if comparator == Comparator::TaskJson {
            let left = serde_json::from_slice::<Value>(&fs::read(a)?);
            let right = serde_json::from_slice::<Value>(&fs::read(b)?);
            if let (Ok(mut left), Ok(mut right)) = (left, right) {
                strip_volatile(&mut left);
                strip_volatile(&mut right);
                return Ok(left != right);
            }
            debug!(file = %a.display(), "not JSON, comparing bytes");
        }
        if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
            return Ok(true);
        }
        Ok(self.optimizer.hash_file(a)? != self.optimizer.hash_file(b)?)
    }

    fn scan_database(&self, sides: &Sides<'_>, result: &mut DetectionResult) {
        let name = self.layout.database_file_name();
        let source = sides.source.join(name);
        let target = sides.target.join(name);
        let file = name.to_string_lossy().replace('\\', "/");

        let subtype = match (source.is_file(), target.is_file()) {
            (false, false) => return,
            (false, true) => Some(ConflictSubtype::DatabaseMissingInInstance),
            (true, false) => Some(ConflictSubtype::DatabaseMissingInMain),
            (true, true) => {
                result.compared += 1;
                match self.database_diverged(&source, &target) {
                    Ok(true) => Some(ConflictSubtype::DatabaseDiverged),
                    Ok(false) => None,
                    Err(e) => {
                        warn!(error = %e, "database comparison failed");
                        result.warnings.push(format!("{file}: {e}"));
                        None
                    }
                }
            }
        };

        if let Some(subtype) = subtype {
            result.conflicts.push(Conflict {
                id: Conflict::conflict_id(&result.merge_id, ConflictType::Database, &file),
                merge_id: result.merge_id.clone(),
                conflict_type: ConflictType::Database,
                subtype,
                file,
                source_content: None,
                main_content: None,
                source_hash: self.optimizer.hash_file(&source).ok(),
                main_hash: self.optimizer.hash_file(&target).ok(),
            });
            debug!(subtype = subtype.as_str(), "database conflict detected");
        }
    }

    /// Modification times further apart than the threshold signal a
    /// conflict, unless the two files are byte-identical.
    fn database_diverged(&self, a: &Path, b: &Path) -> std::io::Result<bool> {
        let gap = mtime_gap(fs::metadata(a)?.modified()?, fs::metadata(b)?.modified()?);
        if gap.as_secs() <= self.config.database_mtime_threshold_secs {
            return Ok(false);
        }
        Ok(self.optimizer.hash_file(a)? != self.optimizer.hash_file(b)?)
    }
}

struct Sides<'a> {
    source: &'a Path,
    target: &'a Path,
}

fn mtime_gap(a: SystemTime, b: SystemTime) -> std::time::Duration {
    a.duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or_default()
}

fn read_lossy(path: &Path) -> Option<String> {
    fs::read(path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn strip_volatile(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in VOLATILE_KEYS {
                map.remove(*key);
            }
            map.values_mut().for_each(strip_volatile);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_volatile),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, PerformanceConfig};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: ProjectLayout,
        detector: ConflictDetector,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();
        let layout = ProjectLayout::new(dir.path(), &config);
        fs::create_dir_all(layout.state_dir()).unwrap();
        fs::create_dir_all(layout.active_workspace("feature-x")).unwrap();
        let detector = ConflictDetector::new(
            layout.clone(),
            config.conflicts.clone(),
            Arc::new(PerformanceOptimizer::new(&PerformanceConfig::default())),
        );
        Fixture {
            _dir: dir,
            layout,
            detector,
        }
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_identical_and_one_byte_themes() {
        let f = fixture();
        let main = f.layout.state_dir().to_path_buf();
        let inst = f.layout.active_workspace("feature-x");
        write(&main, "themes/auth.json", r#"{"name":"auth"}"#);
        write(&inst, "themes/auth.json", r#"{"name":"auth"}"#);

        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        assert_eq!(result.count(), 0);
        assert_eq!(result.compared, 1);
        assert_eq!(result.merge_status(), MergeStatus::Ready);

        write(&inst, "themes/auth.json", r#"{"name":"autH"}"#);
        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        assert_eq!(result.count(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.id, "m1-theme-themes/auth.json");
        assert_eq!(conflict.conflict_type, ConflictType::Theme);
        assert_eq!(conflict.main_content.as_deref(), Some(r#"{"name":"auth"}"#));
        assert_eq!(result.merge_status(), MergeStatus::InProgress);
    }

    #[test]
    fn test_instance_only_files_are_additions() {
        let f = fixture();
        let inst = f.layout.active_workspace("feature-x");
        write(&inst, "flows/signup.json", "{}");
        write(&inst, "tasks/active/task-7.json", "{}");

        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        assert_eq!(result.count(), 0);
        let files: Vec<&str> = result.additions.iter().map(|a| a.file.as_str()).collect();
        assert_eq!(files, vec!["flows/signup.json", "tasks/active/task-7.json"]);
    }

    #[test]
    fn test_task_comparator_ignores_volatile_keys() {
        let f = fixture();
        let main = f.layout.state_dir().to_path_buf();
        let inst = f.layout.active_workspace("feature-x");
        write(&main, "tasks/active/task-1.json", r#"{"title":"a","updatedAt":"2024-01-01"}"#);
        write(&inst, "tasks/active/task-1.json", r#"{"updatedAt":"2025-05-05","title":"a"}"#);
        write(&main, "tasks/active/sidequest-2.json", r#"{"title":"b"}"#);
        write(&inst, "tasks/active/sidequest-2.json", r#"{"title":"c"}"#);
        write(&main, COMPLETION_PATH_FILE, r#"{"steps":[1,2]}"#);
        write(&inst, COMPLETION_PATH_FILE, r#"{"steps":[1,2,3]}"#);

        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        let subtypes: Vec<ConflictSubtype> = result.conflicts.iter().map(|c| c.subtype).collect();
        assert_eq!(
            subtypes,
            vec![ConflictSubtype::TaskLedger, ConflictSubtype::Sidequest]
        );
        assert_eq!(result.types(), [ConflictType::Task].into());
    }

    #[test]
    fn test_database_subtypes() {
        let f = fixture();
        let main = f.layout.state_dir().to_path_buf();
        let inst = f.layout.active_workspace("feature-x");
        let db = f.layout.database_file_name().to_string_lossy().to_string();

        write(&main, &db, "main-db");
        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        assert_eq!(result.conflicts[0].id, "m1-database");
        assert_eq!(
            result.conflicts[0].subtype,
            ConflictSubtype::DatabaseMissingInInstance
        );

        write(&inst, &db, "inst-db");
        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        assert_eq!(result.count(), 0, "fresh copies are within the threshold");

        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(main.join(&db))
            .unwrap()
            .set_modified(old)
            .unwrap();
        let result = f.detector.detect_conflicts("m1", "feature-x", "main").unwrap();
        assert_eq!(result.conflicts[0].subtype, ConflictSubtype::DatabaseDiverged);
    }

    #[test]
    fn test_missing_workspace_is_rejected() {
        let f = fixture();
        let err = f.detector.detect_conflicts("m1", "nope", "main").unwrap_err();
        assert!(matches!(err, ConflictError::WorkspaceMissing(id) if id == "nope"));
    }
}
