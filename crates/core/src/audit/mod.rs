//! Append-only, checksummed audit trail.
//!
//! Files under `.instances/.audit/`:
//!
//! - `audit.jsonl`: every event
//! - `compliance.jsonl`: the compliance-relevant event types
//! - `forensic.jsonl`: events logged at `detailed` or `forensic` level
//! - `emergency.jsonl`: events whose primary write failed
//! - `archive/audit-YYYY-MM-DD.jsonl`: expired events moved by [`AuditLog::archive`]
//!
//! Logging never fails the caller. Readers skip lines they cannot parse.

pub mod checksum;
pub mod report;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::fsutil;

pub use report::{AuditReport, ComplianceCheck};

const PRIMARY_LOG: &str = "audit.jsonl";
const COMPLIANCE_LOG: &str = "compliance.jsonl";
const FORENSIC_LOG: &str = "forensic.jsonl";
const EMERGENCY_LOG: &str = "emergency.jsonl";
const ARCHIVE_DIR: &str = "archive";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    InstanceCreated,
    InstanceArchived,
    InstanceFailed,
    MergeInitiated,
    MergeCompleted,
    MergeFailed,
    ConflictDetected,
    ConflictResolved,
    CodeChangeDetected,
    RecoveryPointCreated,
    RollbackPerformed,
    OperationFailed,
    AuthorityViolation,
    MaintenancePerformed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceCreated => "instance_created",
            Self::InstanceArchived => "instance_archived",
            Self::InstanceFailed => "instance_failed",
            Self::MergeInitiated => "merge_initiated",
            Self::MergeCompleted => "merge_completed",
            Self::MergeFailed => "merge_failed",
            Self::ConflictDetected => "conflict_detected",
            Self::ConflictResolved => "conflict_resolved",
            Self::CodeChangeDetected => "code_change_detected",
            Self::RecoveryPointCreated => "recovery_point_created",
            Self::RollbackPerformed => "rollback_performed",
            Self::OperationFailed => "operation_failed",
            Self::AuthorityViolation => "authority_violation",
            Self::MaintenancePerformed => "maintenance_performed",
        }
    }

    /// Event types mirrored into the compliance log.
    pub fn is_compliance_relevant(&self) -> bool {
        matches!(
            self,
            Self::InstanceCreated
                | Self::InstanceArchived
                | Self::MergeInitiated
                | Self::MergeCompleted
                | Self::MergeFailed
                | Self::ConflictResolved
                | Self::RollbackPerformed
                | Self::OperationFailed
                | Self::AuthorityViolation
        )
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Basic,
    Standard,
    Detailed,
    Forensic,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Detailed => "detailed",
            Self::Forensic => "forensic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,
    pub level: AuditLevel,
    pub actor: String,
    pub description: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

impl AuditEvent {
    fn checksum_input(&self) -> checksum::ChecksumInput<'_> {
        checksum::ChecksumInput {
            id: &self.id,
            event_type: self.event_type.as_str(),
            level: self.level.as_str(),
            actor: &self.actor,
            description: &self.description,
            data: &self.data,
            timestamp: &self.timestamp,
        }
    }

    /// Recompute the checksum from the current field values.
    pub fn compute_checksum(&self) -> String {
        checksum::compute(&self.checksum_input())
    }
}

/// Criteria for [`AuditLog::search`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub actor: Option<String>,
    pub min_level: Option<AuditLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the description.
    pub text: Option<String>,
    /// Events whose `data.merge_id` equals this.
    pub merge_id: Option<String>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        if self.actor.as_ref().is_some_and(|a| a != &event.actor) {
            return false;
        }
        if self.min_level.is_some_and(|l| event.level < l) {
            return false;
        }
        if self.since.is_some_and(|s| event.timestamp < s) {
            return false;
        }
        if self.until.is_some_and(|u| event.timestamp > u) {
            return false;
        }
        if let Some(text) = &self.text {
            if !event
                .description
                .to_lowercase()
                .contains(&text.to_lowercase())
            {
                return false;
            }
        }
        if let Some(merge_id) = &self.merge_id {
            if event.data.get("merge_id").and_then(Value::as_str) != Some(merge_id.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: usize,
    pub kept: usize,
    pub archive_files: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

pub struct AuditLog {
    dir: PathBuf,
    retention_days: u32,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new<P: AsRef<Path>>(dir: P, retention_days: u32) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retention_days,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_log(&self) -> PathBuf {
        self.dir.join(PRIMARY_LOG)
    }

    pub fn compliance_log(&self) -> PathBuf {
        self.dir.join(COMPLIANCE_LOG)
    }

    pub fn forensic_log(&self) -> PathBuf {
        self.dir.join(FORENSIC_LOG)
    }

    pub fn emergency_log(&self) -> PathBuf {
        self.dir.join(EMERGENCY_LOG)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| {
            warn!("audit log mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record an event. Write failures are logged and diverted to the
    /// emergency log; the event is returned either way.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        actor: &str,
        description: &str,
        data: Value,
        level: AuditLevel,
    ) -> AuditEvent {
        let mut event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            level,
            actor: actor.to_string(),
            description: description.to_string(),
            data,
            timestamp: Utc::now().trunc_subsecs(3),
            checksum: String::new(),
        };
        event.checksum = event.compute_checksum();

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize audit event, using emergency log");
                self.record_unserializable(&event, &e.to_string());
                return event;
            }
        };

        let _guard = self.lock();
        if let Err(e) = fsutil::append_line(&self.primary_log(), &line) {
            error!(error = %e, event_type = %event_type, "audit write failed, using emergency log");
            self.append_emergency(&line);
            return event;
        }
        if event_type.is_compliance_relevant() {
            if let Err(e) = fsutil::append_line(&self.compliance_log(), &line) {
                warn!(error = %e, "compliance audit write failed");
            }
        }
        if level >= AuditLevel::Detailed {
            if let Err(e) = fsutil::append_line(&self.forensic_log(), &line) {
                warn!(error = %e, "forensic audit write failed");
            }
        }
        debug!(id = %event.id, event_type = %event_type, actor, "audit event recorded");
        event
    }

    /// Leave an identifying line in the emergency log for an event whose
    /// full record could not be produced.
    fn record_unserializable(&self, event: &AuditEvent, reason: &str) {
        let line = serde_json::json!({
            "id": event.id,
            "event_type": event.event_type.as_str(),
            "actor": event.actor,
            "timestamp": checksum::canonical_timestamp(&event.timestamp),
            "error": reason,
        })
        .to_string();
        let _guard = self.lock();
        self.append_emergency(&line);
    }

    fn append_emergency(&self, line: &str) {
        if let Err(e) = fsutil::append_line(&self.emergency_log(), line) {
            error!(error = %e, "emergency audit write failed");
        }
    }

    /// Whether `event` still matches its checksum.
    pub fn verify_integrity(&self, event: &AuditEvent) -> bool {
        event.compute_checksum() == event.checksum
    }

    /// Every parseable event in the primary log, in file order.
    pub fn read_events(&self) -> Vec<AuditEvent> {
        read_events_from(&self.primary_log())
    }

    /// Matching events, newest first, at most `limit`.
    pub fn search(&self, filter: &AuditFilter, limit: usize) -> Vec<AuditEvent> {
        let mut events: Vec<AuditEvent> = self
            .read_events()
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        events
    }

    /// Counts and compliance checks over events in `[since, until]`.
    pub fn generate_report(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> AuditReport {
        let events = self.read_events();
        report::build(&events, since, until, self.retention_days, Utc::now())
    }

    /// Move events older than `keep_days` from the primary log into dated
    /// archive files. Archive lines are written before the primary log is
    /// rewritten, so an interrupted archive duplicates rather than loses.
    pub fn archive(&self, keep_days: u32) -> std::io::Result<ArchiveReport> {
        let _guard = self.lock();
        let path = self.primary_log();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ArchiveReport::default())
            }
            Err(e) => return Err(e),
        };
        let cutoff = Utc::now() - Duration::days(i64::from(keep_days));

        let mut kept = Vec::new();
        let mut expired: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) if event.timestamp < cutoff => {
                    let day = event.timestamp.format("%Y-%m-%d").to_string();
                    expired.entry(day).or_default().push(line);
                }
                // Unparseable lines stay where they are.
                _ => kept.push(line),
            }
        }
        if expired.is_empty() {
            return Ok(ArchiveReport {
                archived: 0,
                kept: kept.len(),
                archive_files: Vec::new(),
            });
        }

        let mut archive_files = Vec::new();
        let mut archived = 0;
        for (day, lines) in &expired {
            let file = self.dir.join(ARCHIVE_DIR).join(format!("audit-{day}.jsonl"));
            for line in lines {
                fsutil::append_line(&file, line)?;
            }
            archived += lines.len();
            archive_files.push(file);
        }

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fsutil::write_atomic(&path, rewritten.as_bytes())?;
        info!(archived, kept = kept.len(), keep_days, "archived audit events");
        Ok(ArchiveReport {
            archived,
            kept: kept.len(),
            archive_files,
        })
    }
}

fn read_events_from(path: &Path) -> Vec<AuditEvent> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "skipping malformed audit line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(".audit"), 90);
        (dir, log)
    }

    #[test]
    fn test_logged_event_verifies_and_mutations_do_not() {
        let (_dir, log) = log();
        let event = log.log_event(
            AuditEventType::InstanceCreated,
            "agent",
            "created auth-refactor",
            json!({"instance_id": "auth-refactor", "themes": ["authentication"]}),
            AuditLevel::Standard,
        );
        assert!(log.verify_integrity(&event));

        let stored = log.read_events().pop().unwrap();
        assert_eq!(stored, event);
        assert!(log.verify_integrity(&stored));

        let mutations: Vec<Box<dyn Fn(&mut AuditEvent)>> = vec![
            Box::new(|e: &mut AuditEvent| e.actor = "mallory".into()),
            Box::new(|e: &mut AuditEvent| e.description.push('!')),
            Box::new(|e: &mut AuditEvent| e.data["instance_id"] = json!("other")),
            Box::new(|e: &mut AuditEvent| e.timestamp = e.timestamp + Duration::seconds(1)),
            Box::new(|e: &mut AuditEvent| e.event_type = AuditEventType::InstanceArchived),
            Box::new(|e: &mut AuditEvent| e.level = AuditLevel::Forensic),
            Box::new(|e: &mut AuditEvent| e.id = "forged".into()),
        ];
        for mutate in mutations {
            let mut tampered = stored.clone();
            mutate(&mut tampered);
            assert!(!log.verify_integrity(&tampered));
        }
    }

    #[test]
    fn test_fan_out_to_compliance_and_forensic() {
        let (_dir, log) = log();
        log.log_event(
            AuditEventType::MergeCompleted,
            "agent",
            "merged",
            json!({}),
            AuditLevel::Standard,
        );
        log.log_event(
            AuditEventType::CodeChangeDetected,
            "agent",
            "code changed",
            json!({}),
            AuditLevel::Forensic,
        );
        assert_eq!(read_events_from(&log.primary_log()).len(), 2);
        assert_eq!(read_events_from(&log.compliance_log()).len(), 1);
        let forensic = read_events_from(&log.forensic_log());
        assert_eq!(forensic.len(), 1);
        assert_eq!(forensic[0].event_type, AuditEventType::CodeChangeDetected);
    }

    #[test]
    fn test_unwritable_primary_falls_back_to_emergency() {
        let (_dir, log) = log();
        // A directory where the primary log file should be.
        fs::create_dir_all(log.primary_log()).unwrap();
        let event = log.log_event(
            AuditEventType::OperationFailed,
            "agent",
            "disk trouble",
            json!({}),
            AuditLevel::Basic,
        );
        let emergency = read_events_from(&log.emergency_log());
        assert_eq!(emergency.len(), 1);
        assert_eq!(emergency[0].id, event.id);
    }

    #[test]
    fn test_unserializable_event_leaves_identifying_line() {
        let (_dir, log) = log();
        let event = log.log_event(
            AuditEventType::MergeFailed,
            "agent",
            "merge failed",
            json!({ "merge_id": "m1" }),
            AuditLevel::Standard,
        );
        log.record_unserializable(&event, "cannot encode data");

        let raw = fs::read_to_string(log.emergency_log()).unwrap();
        let lines: Vec<Value> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["id"], event.id.as_str());
        assert_eq!(lines[0]["event_type"], "merge_failed");
        assert_eq!(lines[0]["actor"], "agent");
        assert_eq!(lines[0]["error"], "cannot encode data");
        // The primary log is untouched by the fallback.
        assert_eq!(log.read_events().len(), 1);
    }

    #[test]
    fn test_search_filters_and_skips_malformed() {
        let (_dir, log) = log();
        log.log_event(
            AuditEventType::MergeInitiated,
            "alice",
            "Merge started",
            json!({"merge_id": "m1"}),
            AuditLevel::Standard,
        );
        fsutil::append_line(&log.primary_log(), "not json").unwrap();
        log.log_event(
            AuditEventType::MergeInitiated,
            "bob",
            "Merge started",
            json!({"merge_id": "m2"}),
            AuditLevel::Detailed,
        );

        let all = log.search(&AuditFilter::default(), 10);
        assert_eq!(all.len(), 2);

        let by_actor = log.search(
            &AuditFilter {
                actor: Some("bob".into()),
                ..Default::default()
            },
            10,
        );
        assert_eq!(by_actor.len(), 1);

        let by_merge = log.search(
            &AuditFilter {
                merge_id: Some("m1".into()),
                text: Some("merge STARTED".into()),
                ..Default::default()
            },
            10,
        );
        assert_eq!(by_merge.len(), 1);
        assert_eq!(by_merge[0].actor, "alice");

        let detailed = log.search(
            &AuditFilter {
                min_level: Some(AuditLevel::Detailed),
                ..Default::default()
            },
            10,
        );
        assert_eq!(detailed.len(), 1);
        assert_eq!(log.search(&AuditFilter::default(), 1).len(), 1);
    }

    #[test]
    fn test_archive_moves_expired_lines() {
        let (_dir, log) = log();
        let mut old = log.log_event(
            AuditEventType::InstanceCreated,
            "agent",
            "old",
            json!({}),
            AuditLevel::Standard,
        );
        old.timestamp = Utc::now().trunc_subsecs(3) - Duration::days(200);
        old.checksum = old.compute_checksum();
        fs::write(
            log.primary_log(),
            format!("{}\n", serde_json::to_string(&old).unwrap()),
        )
        .unwrap();
        log.log_event(
            AuditEventType::InstanceCreated,
            "agent",
            "new",
            json!({}),
            AuditLevel::Standard,
        );

        let report = log.archive(90).unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.kept, 1);
        let remaining = log.read_events();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].description, "new");
        let archived = read_events_from(&report.archive_files[0]);
        assert_eq!(archived, vec![old]);

        let again = log.archive(90).unwrap();
        assert_eq!(again.archived, 0);
    }
}
