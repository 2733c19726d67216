//! Conflict detection and resolution for instance merges.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection**: comparing an instance workspace with its merge target
//!    and producing typed conflicts ([`detector`]).
//! 2. **Resolution**: presenting conflicts and applying a typed resolution
//!    per conflict to canonical state ([`resolver`], [`resolution`]).
//! 3. **Completion**: folding a resolved instance into its target.

pub mod detector;
pub mod resolution;
pub mod resolver;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::fsutil;
use crate::layout::ProjectLayout;
use crate::models::MergeRecord;

pub use detector::{
    Addition, Conflict, ConflictDetector, ConflictSubtype, ConflictType, DetectionResult,
};
pub use resolution::{
    valid_strategies, DatabaseResolution, FlowResolution, Resolution, TaskResolution,
    ThemeResolution,
};
pub use resolver::{
    CompletionReport, ConflictPresentation, ConflictResolver, ResolutionOutcome, ResolutionReport,
};

/// Append one line describing `merge` to `.instances/.merge-log.jsonl`.
/// Failures are logged, never returned.
pub(crate) fn log_merge_event(layout: &ProjectLayout, merge: &MergeRecord, event: &str) {
    let line = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "event": event,
        "merge_id": merge.merge_id,
        "source": merge.source,
        "target": merge.target,
        "status": merge.status,
        "conflicts_detected": merge.conflicts_detected,
        "conflicts_resolved": merge.conflicts_resolved,
        "conflict_types": merge.conflict_types,
    });
    if let Err(e) = fsutil::append_line(&layout.merge_log(), &line.to_string()) {
        warn!(merge_id = %merge.merge_id, error = %e, "failed to append merge log");
    }
}
