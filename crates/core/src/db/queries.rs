//! Typed query helpers and the [`InstanceStore`] implementation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    FileChangeImpact, GitProjectState, Instance, InstanceStatus, MergeOutcome, MergeRecord,
    MergeStatus, ReconciliationStatus,
};
use crate::store::InstanceStore;

// ---------------------------------------------------------------------------
// Raw rows
// ---------------------------------------------------------------------------

const INSTANCE_COLUMNS: &str = "id, created_from, created_by, purpose, themes, flows, status,
     workspace_path, db_path, git_base_hash, created_at, updated_at";

const MERGE_COLUMNS: &str = "merge_id, source, target, status, conflicts_detected,
     conflicts_resolved, conflict_types, resolution_strategy, created_at, updated_at,
     completed_at, error";

const GIT_STATE_COLUMNS: &str = "id, project_root, current_hash, last_known_hash,
     change_summary, affected_themes, reconciliation_status, recorded_at";

/// A row from the `instances` table, before JSON / enum decoding.
struct InstanceRow {
    id: String,
    created_from: String,
    created_by: String,
    purpose: String,
    themes: String,
    flows: String,
    status: String,
    workspace_path: String,
    db_path: String,
    git_base_hash: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_from: row.get(1)?,
            created_by: row.get(2)?,
            purpose: row.get(3)?,
            themes: row.get(4)?,
            flows: row.get(5)?,
            status: row.get(6)?,
            workspace_path: row.get(7)?,
            db_path: row.get(8)?,
            git_base_hash: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<Instance, DatabaseError> {
        Ok(Instance {
            status: InstanceStatus::parse(&self.status).ok_or_else(|| {
                DatabaseError::InvalidColumn {
                    field: "instances.status".into(),
                    value: self.status.clone(),
                }
            })?,
            themes: serde_json::from_str(&self.themes)?,
            flows: serde_json::from_str(&self.flows)?,
            id: self.id,
            created_from: self.created_from,
            created_by: self.created_by,
            purpose: self.purpose,
            workspace_path: PathBuf::from(self.workspace_path),
            db_path: PathBuf::from(self.db_path),
            git_base_hash: self.git_base_hash,
            created_at: parse_datetime(&self.created_at),
            updated_at: parse_datetime(&self.updated_at),
        })
    }
}

/// A row from the `merges` table, before JSON / enum decoding.
struct MergeRow {
    merge_id: String,
    source: String,
    target: String,
    status: String,
    conflicts_detected: u32,
    conflicts_resolved: u32,
    conflict_types: String,
    resolution_strategy: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl MergeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            merge_id: row.get(0)?,
            source: row.get(1)?,
            target: row.get(2)?,
            status: row.get(3)?,
            conflicts_detected: row.get(4)?,
            conflicts_resolved: row.get(5)?,
            conflict_types: row.get(6)?,
            resolution_strategy: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn decode(self) -> Result<MergeRecord, DatabaseError> {
        Ok(MergeRecord {
            status: MergeStatus::parse(&self.status).ok_or_else(|| {
                DatabaseError::InvalidColumn {
                    field: "merges.status".into(),
                    value: self.status.clone(),
                }
            })?,
            conflict_types: serde_json::from_str(&self.conflict_types)?,
            resolution_strategy: serde_json::from_str(&self.resolution_strategy)?,
            merge_id: self.merge_id,
            source: self.source,
            target: self.target,
            conflicts_detected: self.conflicts_detected,
            conflicts_resolved: self.conflicts_resolved,
            created_at: parse_datetime(&self.created_at),
            updated_at: parse_datetime(&self.updated_at),
            completed_at: self.completed_at.as_deref().map(parse_datetime),
            error: self.error,
        })
    }
}

/// A row from the `git_project_state` table.
struct GitStateRow {
    id: i64,
    project_root: String,
    current_hash: String,
    last_known_hash: Option<String>,
    change_summary: String,
    affected_themes: String,
    reconciliation_status: String,
    recorded_at: String,
}

impl GitStateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_root: row.get(1)?,
            current_hash: row.get(2)?,
            last_known_hash: row.get(3)?,
            change_summary: row.get(4)?,
            affected_themes: row.get(5)?,
            reconciliation_status: row.get(6)?,
            recorded_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<GitProjectState, DatabaseError> {
        Ok(GitProjectState {
            reconciliation_status: ReconciliationStatus::parse(&self.reconciliation_status)
                .ok_or_else(|| DatabaseError::InvalidColumn {
                    field: "git_project_state.reconciliation_status".into(),
                    value: self.reconciliation_status.clone(),
                })?,
            affected_themes: serde_json::from_str(&self.affected_themes)?,
            id: self.id,
            project_root: self.project_root,
            current_hash: self.current_hash,
            last_known_hash: self.last_known_hash,
            change_summary: self.change_summary,
            recorded_at: parse_datetime(&self.recorded_at),
        })
    }
}

// ---------------------------------------------------------------------------
// Key/value state
// ---------------------------------------------------------------------------

impl Database {
    /// Get a value from the key/value state table.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Upsert a value in the key/value state table.
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    /// Impacts recorded for one code-change observation.
    pub fn list_file_change_impacts(
        &self,
        git_state_id: i64,
    ) -> Result<Vec<FileChangeImpact>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT file_path, change_kind, themes FROM file_change_impacts
             WHERE git_state_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![git_state_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(file_path, change_kind, themes)| {
                Ok(FileChangeImpact {
                    file_path,
                    change_kind,
                    themes: serde_json::from_str(&themes)?,
                })
            })
            .collect()
    }

    fn query_instances(
        &self,
        where_clause: &str,
        bound: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<Instance>, DatabaseError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances {where_clause} ORDER BY created_at, id"
        );
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(bound, InstanceRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(InstanceRow::decode).collect()
    }
}

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

impl InstanceStore for Database {
    fn create_instance(&self, instance: &Instance) -> Result<(), DatabaseError> {
        let themes = serde_json::to_string(&instance.themes)?;
        let flows = serde_json::to_string(&instance.flows)?;
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO instances (id, created_from, created_by, purpose, themes, flows,
                 status, workspace_path, db_path, git_base_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    instance.id,
                    instance.created_from,
                    instance.created_by,
                    instance.purpose,
                    themes,
                    flows,
                    instance.status.as_str(),
                    instance.workspace_path.to_string_lossy(),
                    instance.db_path.to_string_lossy(),
                    instance.git_base_hash,
                    instance.created_at.to_rfc3339(),
                    instance.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        debug!(id = %instance.id, "inserted instance");
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<Instance>, DatabaseError> {
        let row = {
            let conn = self.conn();
            conn.query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
                params![id],
                InstanceRow::from_row,
            )
            .optional()?
        };
        row.map(InstanceRow::decode).transpose()
    }

    fn list_active(&self) -> Result<Vec<Instance>, DatabaseError> {
        self.query_instances("WHERE status IN ('active', 'merging')", &[])
    }

    fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError> {
        self.query_instances("", &[])
    }

    fn update_instance_status(
        &self,
        id: &str,
        status: InstanceStatus,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE instances SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "instance".into(),
                id: id.to_string(),
            });
        }
        debug!(id, status = %status, "updated instance status");
        Ok(())
    }

    fn archive_instance(&self, id: &str, archived_path: &Path) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE instances SET status = 'archived', workspace_path = ?1, updated_at = ?2
             WHERE id = ?3",
            params![archived_path.to_string_lossy(), now, id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "instance".into(),
                id: id.to_string(),
            });
        }
        debug!(id, path = %archived_path.display(), "archived instance");
        Ok(())
    }

    fn delete_instance(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM instances WHERE id = ?1", params![id])?;
        debug!(id, deleted = changed > 0, "deleted instance row");
        Ok(changed > 0)
    }

    fn create_merge(&self, merge: &MergeRecord) -> Result<(), DatabaseError> {
        let conflict_types = serde_json::to_string(&merge.conflict_types)?;
        let strategy = serde_json::to_string(&merge.resolution_strategy)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO merges (merge_id, source, target, status, conflicts_detected,
             conflicts_resolved, conflict_types, resolution_strategy, created_at, updated_at,
             completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                merge.merge_id,
                merge.source,
                merge.target,
                merge.status.as_str(),
                merge.conflicts_detected,
                merge.conflicts_resolved,
                conflict_types,
                strategy,
                merge.created_at.to_rfc3339(),
                merge.updated_at.to_rfc3339(),
                merge.completed_at.map(|t| t.to_rfc3339()),
                merge.error,
            ],
        )?;
        debug!(merge_id = %merge.merge_id, "inserted merge");
        Ok(())
    }

    fn update_merge_status(
        &self,
        merge_id: &str,
        status: MergeStatus,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let completed_at = (status == MergeStatus::Completed).then(|| now.clone());
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE merges SET status = ?1, updated_at = ?2,
             completed_at = COALESCE(?3, completed_at) WHERE merge_id = ?4",
            params![status.as_str(), now, completed_at, merge_id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "merge".into(),
                id: merge_id.to_string(),
            });
        }
        debug!(merge_id, status = %status, "updated merge status");
        Ok(())
    }

    fn update_merge_outcome(
        &self,
        merge_id: &str,
        outcome: &MergeOutcome,
    ) -> Result<(), DatabaseError> {
        let conflict_types = outcome
            .conflict_types
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let strategy = outcome
            .resolution_strategy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE merges SET
                conflicts_detected = COALESCE(?1, conflicts_detected),
                conflicts_resolved = COALESCE(?2, conflicts_resolved),
                conflict_types = COALESCE(?3, conflict_types),
                resolution_strategy = COALESCE(?4, resolution_strategy),
                error = COALESCE(?5, error),
                updated_at = ?6
             WHERE merge_id = ?7",
            params![
                outcome.conflicts_detected,
                outcome.conflicts_resolved,
                conflict_types,
                strategy,
                outcome.error,
                now,
                merge_id,
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "merge".into(),
                id: merge_id.to_string(),
            });
        }
        Ok(())
    }

    fn get_merge_record(&self, merge_id: &str) -> Result<Option<MergeRecord>, DatabaseError> {
        let row = {
            let conn = self.conn();
            conn.query_row(
                &format!("SELECT {MERGE_COLUMNS} FROM merges WHERE merge_id = ?1"),
                params![merge_id],
                MergeRow::from_row,
            )
            .optional()?
        };
        row.map(MergeRow::decode).transpose()
    }

    fn list_merges_for(&self, source: &str) -> Result<Vec<MergeRecord>, DatabaseError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {MERGE_COLUMNS} FROM merges WHERE source = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map(params![source], MergeRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(MergeRow::decode).collect()
    }

    fn record_git_state(&self, state: &GitProjectState) -> Result<i64, DatabaseError> {
        let themes = serde_json::to_string(&state.affected_themes)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO git_project_state (project_root, current_hash, last_known_hash,
             change_summary, affected_themes, reconciliation_status, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                state.project_root,
                state.current_hash,
                state.last_known_hash,
                state.change_summary,
                themes,
                state.reconciliation_status.as_str(),
                state.recorded_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, hash = %state.current_hash, "recorded git project state");
        Ok(id)
    }

    fn latest_git_state(&self) -> Result<Option<GitProjectState>, DatabaseError> {
        let row = {
            let conn = self.conn();
            conn.query_row(
                &format!(
                    "SELECT {GIT_STATE_COLUMNS} FROM git_project_state ORDER BY id DESC LIMIT 1"
                ),
                [],
                GitStateRow::from_row,
            )
            .optional()?
        };
        row.map(GitStateRow::decode).transpose()
    }

    fn record_file_change_impact(
        &self,
        git_state_id: i64,
        impact: &FileChangeImpact,
    ) -> Result<(), DatabaseError> {
        let themes = serde_json::to_string(&impact.themes)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO file_change_impacts (git_state_id, file_path, change_kind, themes,
             recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![git_state_id, impact.file_path, impact.change_kind, themes, now],
        )?;
        Ok(())
    }
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictType;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sample_instance(id: &str) -> Instance {
        let now = Utc::now();
        Instance {
            id: id.to_string(),
            created_from: "main".into(),
            created_by: "agent".into(),
            purpose: "testing".into(),
            themes: vec!["authentication".into()],
            flows: vec!["login-flow".into()],
            status: InstanceStatus::Active,
            workspace_path: PathBuf::from(format!("/p/.instances/active/{id}")),
            db_path: PathBuf::from(format!("/p/.instances/active/{id}/project.db")),
            git_base_hash: Some("abc123".into()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_instance_crud() {
        let db = setup_db();
        db.create_instance(&sample_instance("auth-refactor")).unwrap();

        let fetched = db.get_instance("auth-refactor").unwrap().unwrap();
        assert_eq!(fetched.themes, vec!["authentication"]);
        assert_eq!(fetched.status, InstanceStatus::Active);
        assert!(db.get_instance("nope").unwrap().is_none());

        assert!(db.create_instance(&sample_instance("auth-refactor")).is_err());

        db.update_instance_status("auth-refactor", InstanceStatus::Merging)
            .unwrap();
        assert_eq!(db.list_active().unwrap().len(), 1);

        db.archive_instance("auth-refactor", Path::new("/p/.instances/completed/auth-refactor"))
            .unwrap();
        assert!(db.list_active().unwrap().is_empty());
        assert_eq!(db.list_instances().unwrap().len(), 1);

        assert!(db.delete_instance("auth-refactor").unwrap());
        assert!(!db.delete_instance("auth-refactor").unwrap());
    }

    #[test]
    fn test_update_missing_instance_is_not_found() {
        let db = setup_db();
        let err = db
            .update_instance_status("ghost", InstanceStatus::Failed)
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn test_merge_crud() {
        let db = setup_db();
        let merge = MergeRecord::new("auth-refactor", "main");
        db.create_merge(&merge).unwrap();

        let mut outcome = MergeOutcome::default();
        outcome.conflicts_detected = Some(2);
        outcome.conflict_types = Some([ConflictType::Theme, ConflictType::Task].into());
        db.update_merge_outcome(&merge.merge_id, &outcome).unwrap();
        db.update_merge_status(&merge.merge_id, MergeStatus::InProgress)
            .unwrap();

        let fetched = db.get_merge_record(&merge.merge_id).unwrap().unwrap();
        assert_eq!(fetched.status, MergeStatus::InProgress);
        assert_eq!(fetched.conflicts_detected, 2);
        assert!(fetched.conflict_types.contains(&ConflictType::Theme));
        assert!(fetched.completed_at.is_none());

        db.update_merge_outcome(
            &merge.merge_id,
            &MergeOutcome {
                conflicts_resolved: Some(2),
                resolution_strategy: Some(
                    [("c1".to_string(), "accept_main".to_string())].into(),
                ),
                ..Default::default()
            },
        )
        .unwrap();
        db.update_merge_status(&merge.merge_id, MergeStatus::Completed)
            .unwrap();
        let fetched = db.get_merge_record(&merge.merge_id).unwrap().unwrap();
        assert_eq!(fetched.conflicts_resolved, 2);
        assert_eq!(fetched.conflicts_detected, 2);
        assert!(fetched.completed_at.is_some());
        assert_eq!(db.list_merges_for("auth-refactor").unwrap().len(), 1);
    }

    #[test]
    fn test_git_state_history() {
        let db = setup_db();
        assert!(db.latest_git_state().unwrap().is_none());

        let state = GitProjectState {
            id: 0,
            project_root: "/p".into(),
            current_hash: "bbb".into(),
            last_known_hash: Some("aaa".into()),
            change_summary: "1 modified".into(),
            affected_themes: vec!["authentication".into()],
            reconciliation_status: ReconciliationStatus::Pending,
            recorded_at: Utc::now(),
        };
        let id = db.record_git_state(&state).unwrap();
        db.record_file_change_impact(
            id,
            &FileChangeImpact {
                file_path: "src/auth/login.rs".into(),
                change_kind: "modified".into(),
                themes: vec!["authentication".into()],
            },
        )
        .unwrap();

        let latest = db.latest_git_state().unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.current_hash, "bbb");
        assert_eq!(latest.reconciliation_status, ReconciliationStatus::Pending);
        assert_eq!(db.list_file_change_impacts(id).unwrap().len(), 1);
    }

    #[test]
    fn test_kv_state() {
        let db = setup_db();
        assert!(db.get_state("foo").unwrap().is_none());
        db.set_state("foo", "bar").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("bar"));
        db.set_state("foo", "baz").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("baz"));
    }
}
