//! Typed resolution payloads.
//!
//! Each conflict family has its own resolution enum, so a strategy can only
//! be paired with the payload it needs. `accept_main` never carries content;
//! `accept_instance` and `manual_merge` always carry the exact content the
//! caller reviewed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::detector::ConflictType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ThemeResolution {
    AcceptMain,
    AcceptInstance { content: String },
    ManualMerge { content: String },
    /// Keep the canonical theme and add the instance's approach as a new one.
    SplitApproach { new_theme: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FlowResolution {
    AcceptMain,
    AcceptInstance { content: String },
    ManualMerge { content: String },
    /// Keep the canonical flow and add the instance's variant as a new one.
    SplitFlows { new_flow: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TaskResolution {
    AcceptMain,
    AcceptInstance { content: String },
    ManualMerge { content: String },
    /// Keep the canonical file and store the instance version beside it.
    PreserveBoth { content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DatabaseResolution {
    AcceptMain,
    /// Replace the canonical database with a reviewed snapshot file.
    AcceptInstance { snapshot: PathBuf },
    /// Run data statements against the canonical database in one transaction.
    MergeData { statements: Vec<String> },
    /// Run schema migrations, then bump `user_version`.
    SchemaUpgrade { migrations: Vec<String> },
}

/// A resolution for one conflict, tagged by the conflict family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "resolution", rename_all = "lowercase")]
pub enum Resolution {
    Theme(ThemeResolution),
    Flow(FlowResolution),
    Task(TaskResolution),
    Database(DatabaseResolution),
}

impl Resolution {
    pub fn conflict_type(&self) -> ConflictType {
        match self {
            Self::Theme(_) => ConflictType::Theme,
            Self::Flow(_) => ConflictType::Flow,
            Self::Task(_) => ConflictType::Task,
            Self::Database(_) => ConflictType::Database,
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Theme(r) => match r {
                ThemeResolution::AcceptMain => "accept_main",
                ThemeResolution::AcceptInstance { .. } => "accept_instance",
                ThemeResolution::ManualMerge { .. } => "manual_merge",
                ThemeResolution::SplitApproach { .. } => "split_approach",
            },
            Self::Flow(r) => match r {
                FlowResolution::AcceptMain => "accept_main",
                FlowResolution::AcceptInstance { .. } => "accept_instance",
                FlowResolution::ManualMerge { .. } => "manual_merge",
                FlowResolution::SplitFlows { .. } => "split_flows",
            },
            Self::Task(r) => match r {
                TaskResolution::AcceptMain => "accept_main",
                TaskResolution::AcceptInstance { .. } => "accept_instance",
                TaskResolution::ManualMerge { .. } => "manual_merge",
                TaskResolution::PreserveBoth { .. } => "preserve_both",
            },
            Self::Database(r) => match r {
                DatabaseResolution::AcceptMain => "accept_main",
                DatabaseResolution::AcceptInstance { .. } => "accept_instance",
                DatabaseResolution::MergeData { .. } => "merge_data",
                DatabaseResolution::SchemaUpgrade { .. } => "schema_upgrade",
            },
        }
    }

    pub fn is_accept_main(&self) -> bool {
        self.strategy() == "accept_main"
    }
}

/// Strategy names valid for a conflict family, in presentation order.
pub fn valid_strategies(conflict_type: ConflictType) -> &'static [&'static str] {
    match conflict_type {
        ConflictType::Theme => &["accept_main", "accept_instance", "manual_merge", "split_approach"],
        ConflictType::Flow => &["accept_main", "accept_instance", "manual_merge", "split_flows"],
        ConflictType::Task => &["accept_main", "accept_instance", "manual_merge", "preserve_both"],
        ConflictType::Database => &["accept_main", "accept_instance", "merge_data", "schema_upgrade"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let r = Resolution::Theme(ThemeResolution::ManualMerge {
            content: "x".into(),
        });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(
            v,
            json!({"type": "theme", "resolution": {"strategy": "manual_merge", "content": "x"}})
        );

        let parsed: Resolution = serde_json::from_value(json!({
            "type": "database",
            "resolution": {"strategy": "merge_data", "statements": ["DELETE FROM t"]}
        }))
        .unwrap();
        assert_eq!(parsed.conflict_type(), ConflictType::Database);
        assert_eq!(parsed.strategy(), "merge_data");
    }

    #[test]
    fn test_payload_is_required() {
        let missing = serde_json::from_value::<Resolution>(json!({
            "type": "task",
            "resolution": {"strategy": "accept_instance"}
        }));
        assert!(missing.is_err());

        let wrong_family = serde_json::from_value::<Resolution>(json!({
            "type": "flow",
            "resolution": {"strategy": "split_approach", "new_theme": "a", "content": ""}
        }));
        assert!(wrong_family.is_err());
    }

    #[test]
    fn test_every_strategy_is_listed() {
        let samples = [
            Resolution::Theme(ThemeResolution::SplitApproach {
                new_theme: "n".into(),
                content: String::new(),
            }),
            Resolution::Flow(FlowResolution::SplitFlows {
                new_flow: "n".into(),
                content: String::new(),
            }),
            Resolution::Task(TaskResolution::PreserveBoth {
                content: String::new(),
            }),
            Resolution::Database(DatabaseResolution::SchemaUpgrade { migrations: vec![] }),
        ];
        for r in samples {
            assert!(valid_strategies(r.conflict_type()).contains(&r.strategy()));
            assert!(!r.is_accept_main());
        }
    }
}
