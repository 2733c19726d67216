//! Instance lifecycle: creation, status, archival and merge orchestration.

pub mod authority;
pub mod manager;
pub mod workspace;

pub use authority::AuthorityGuard;
pub use manager::{
    ArchivalReport, CodeChangeCheck, CreateInstanceRequest, CreationReport, InitializeReport,
    InstanceManager, MergeInitiation, StatusReport,
};
pub use workspace::read_branch_info;
