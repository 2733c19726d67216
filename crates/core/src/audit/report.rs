//! Audit summaries and compliance rules.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AuditEvent, AuditEventType};

const UNIDENTIFIED_ACTORS: &[&str] = &["", "unknown", "anonymous"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComplianceCheck {
    pub rule: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub total_events: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_actor: BTreeMap<String, usize>,
    /// `YYYY-MM-DD` → count.
    pub by_day: BTreeMap<String, usize>,
    pub integrity_failures: usize,
    pub checks: Vec<ComplianceCheck>,
    pub compliant: bool,
}

pub(crate) fn build(
    events: &[AuditEvent],
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    retention_days: u32,
    now: DateTime<Utc>,
) -> AuditReport {
    let in_range: Vec<&AuditEvent> = events
        .iter()
        .filter(|e| since.map_or(true, |s| e.timestamp >= s))
        .filter(|e| until.map_or(true, |u| e.timestamp <= u))
        .collect();

    let mut by_type = BTreeMap::new();
    let mut by_actor = BTreeMap::new();
    let mut by_day = BTreeMap::new();
    for event in &in_range {
        *by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
        *by_actor.entry(event.actor.clone()).or_insert(0) += 1;
        *by_day
            .entry(event.timestamp.format("%Y-%m-%d").to_string())
            .or_insert(0) += 1;
    }
    let integrity_failures = in_range
        .iter()
        .filter(|e| e.compute_checksum() != e.checksum)
        .count();

    let checks = vec![
        integrity_check(integrity_failures),
        retention_check(&in_range, retention_days, now),
        actor_check(&in_range),
        merge_pairing_check(&in_range),
    ];
    let compliant = checks.iter().all(|c| c.passed);

    AuditReport {
        since,
        until,
        total_events: in_range.len(),
        by_type,
        by_actor,
        by_day,
        integrity_failures,
        checks,
        compliant,
    }
}

fn integrity_check(failures: usize) -> ComplianceCheck {
    ComplianceCheck {
        rule: "integrity".into(),
        passed: failures == 0,
        detail: format!("{failures} event(s) fail checksum verification"),
    }
}

/// Events past the retention window belong in the archive.
fn retention_check(events: &[&AuditEvent], retention_days: u32, now: DateTime<Utc>) -> ComplianceCheck {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let expired = events.iter().filter(|e| e.timestamp < cutoff).count();
    ComplianceCheck {
        rule: "retention_window".into(),
        passed: expired == 0,
        detail: format!("{expired} event(s) older than {retention_days} days await archival"),
    }
}

fn actor_check(events: &[&AuditEvent]) -> ComplianceCheck {
    let anonymous = events
        .iter()
        .filter(|e| UNIDENTIFIED_ACTORS.contains(&e.actor.trim().to_lowercase().as_str()))
        .count();
    ComplianceCheck {
        rule: "actor_identification".into(),
        passed: anonymous == 0,
        detail: format!("{anonymous} event(s) without an identified actor"),
    }
}

/// Every completed merge that detected conflicts must have a matching
/// conflict-resolution event.
fn merge_pairing_check(events: &[&AuditEvent]) -> ComplianceCheck {
    let merge_id = |e: &AuditEvent| {
        e.data
            .get("merge_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let resolved: BTreeSet<String> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::ConflictResolved)
        .filter_map(|e| merge_id(e))
        .collect();
    let unpaired: Vec<String> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::MergeCompleted)
        .filter(|e| {
            e.data
                .get("conflicts_detected")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                > 0
        })
        .filter_map(|e| merge_id(e))
        .filter(|id| !resolved.contains(id))
        .collect();
    ComplianceCheck {
        rule: "merge_resolution_pairing".into(),
        passed: unpaired.is_empty(),
        detail: if unpaired.is_empty() {
            "every conflicted merge has a resolution record".into()
        } else {
            format!("merges without resolution records: {}", unpaired.join(", "))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLevel;
    use serde_json::json;

    fn event(event_type: AuditEventType, actor: &str, data: Value, age_days: i64) -> AuditEvent {
        let mut e = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            level: AuditLevel::Standard,
            actor: actor.into(),
            description: String::new(),
            data,
            timestamp: Utc::now() - Duration::days(age_days),
            checksum: String::new(),
        };
        e.checksum = e.compute_checksum();
        e
    }

    #[test]
    fn test_clean_log_is_compliant() {
        let events = vec![
            event(AuditEventType::MergeInitiated, "agent", json!({"merge_id": "m1"}), 0),
            event(AuditEventType::ConflictResolved, "agent", json!({"merge_id": "m1"}), 0),
            event(
                AuditEventType::MergeCompleted,
                "agent",
                json!({"merge_id": "m1", "conflicts_detected": 1}),
                0,
            ),
            event(
                AuditEventType::MergeCompleted,
                "agent",
                json!({"merge_id": "m2", "conflicts_detected": 0}),
                0,
            ),
        ];
        let report = build(&events, None, None, 90, Utc::now());
        assert_eq!(report.total_events, 4);
        assert_eq!(report.by_type["merge_completed"], 2);
        assert_eq!(report.by_actor["agent"], 4);
        assert_eq!(report.by_day.len(), 1);
        assert!(report.compliant, "{:?}", report.checks);
    }

    #[test]
    fn test_each_rule_can_fail() {
        let mut tampered = event(AuditEventType::InstanceCreated, "agent", json!({}), 0);
        tampered.description = "edited".into();
        let events = vec![
            tampered,
            event(AuditEventType::InstanceCreated, "agent", json!({}), 120),
            event(AuditEventType::InstanceArchived, "unknown", json!({}), 0),
            event(
                AuditEventType::MergeCompleted,
                "agent",
                json!({"merge_id": "m9", "conflicts_detected": 2}),
                0,
            ),
        ];
        let report = build(&events, None, None, 90, Utc::now());
        assert!(!report.compliant);
        assert_eq!(report.integrity_failures, 1);
        for check in &report.checks {
            assert!(!check.passed, "rule {} should fail", check.rule);
        }
    }

    #[test]
    fn test_range_filter() {
        let events = vec![
            event(AuditEventType::InstanceCreated, "agent", json!({}), 10),
            event(AuditEventType::InstanceCreated, "agent", json!({}), 0),
        ];
        let since = Utc::now() - Duration::days(1);
        let report = build(&events, Some(since), None, 90, Utc::now());
        assert_eq!(report.total_events, 1);
    }
}
