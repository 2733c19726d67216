//! Host code repository integration.

pub mod adapter;
pub mod heuristics;

pub use adapter::{
    BranchOutcome, ChangeKind, CodeChangeReport, FileChange, GitAdapter, InitOutcome, RepoStatus,
};
pub use heuristics::ThemeHeuristics;
