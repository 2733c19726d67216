//! OrgSync core library.
//!
//! This crate manages isolated, branch-like instances of a project's
//! organizational state: instance lifecycle, conflict detection and
//! resolution on merge, recovery points and rollback, an append-only audit
//! trail, code-change reconciliation through git, and caching plus bounded
//! parallelism for large projects.

pub mod audit;
pub mod backup;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod fsutil;
pub mod git;
pub mod ids;
pub mod instance;
pub mod layout;
pub mod models;
pub mod performance;
pub mod recovery;
pub mod store;
pub mod themes;

// Re-exports for convenience.
pub use audit::{AuditEventType, AuditLevel, AuditLog};
pub use config::AppConfig;
pub use conflict::{ConflictDetector, ConflictResolver, ConflictType, Resolution};
pub use db::Database;
pub use errors::{CoreError, ErrorKind};
pub use git::GitAdapter;
pub use instance::{CreateInstanceRequest, InstanceManager};
pub use layout::ProjectLayout;
pub use performance::PerformanceOptimizer;
pub use recovery::RecoveryManager;
pub use store::{InstanceStore, ThemeResolver};
