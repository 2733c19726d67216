//! Main-instance authority.
//!
//! Merge initiation, resolution and archival only proceed when the
//! operation's target workspace carries the `.main-instance` sentinel. The
//! check is advisory: anything with write access to the filesystem can
//! create or remove the sentinel.

use std::fs;
use std::io;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditEventType, AuditLevel, AuditLog};
use crate::errors::InstanceError;
use crate::layout::{ProjectLayout, MAIN_SENTINEL};

pub struct AuthorityGuard {
    layout: ProjectLayout,
    audit: Arc<AuditLog>,
}

impl AuthorityGuard {
    pub fn new(layout: ProjectLayout, audit: Arc<AuditLog>) -> Self {
        Self { layout, audit }
    }

    /// Whether the workspace named `target` is the main one.
    pub fn is_main(&self, target: &str) -> bool {
        self.layout
            .workspace_for(target)
            .join(MAIN_SENTINEL)
            .is_file()
    }

    /// Reject `operation` unless `target` is main. Rejections are audited.
    pub fn require_main(
        &self,
        operation: &str,
        target: &str,
        actor: &str,
    ) -> Result<(), InstanceError> {
        if self.is_main(target) {
            return Ok(());
        }
        warn!(operation, target, actor, "rejected: target lacks main authority");
        self.audit.log_event(
            AuditEventType::AuthorityViolation,
            actor,
            &format!("{operation} rejected: '{target}' is not the main instance"),
            json!({ "operation": operation, "target": target }),
            AuditLevel::Detailed,
        );
        Err(InstanceError::NotMainAuthority {
            operation: operation.to_string(),
            target: target.to_string(),
        })
    }

    /// Mark the canonical state dir as main. Returns `true` if the sentinel
    /// was created by this call.
    pub fn ensure_sentinel(&self) -> io::Result<bool> {
        let path = self.layout.main_sentinel();
        if path.is_file() {
            return Ok(false);
        }
        fs::create_dir_all(self.layout.state_dir())?;
        fs::write(&path, b"")?;
        info!(path = %path.display(), "created main sentinel");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::config::AppConfig;

    #[test]
    fn test_sentinel_grants_authority() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path(), &AppConfig::default());
        let audit = Arc::new(AuditLog::new(layout.audit_dir(), 90));
        let guard = AuthorityGuard::new(layout.clone(), Arc::clone(&audit));

        assert!(!guard.is_main("main"));
        let err = guard.require_main("initiate_merge", "main", "agent").unwrap_err();
        assert!(matches!(err, InstanceError::NotMainAuthority { .. }));
        let violations = audit.search(
            &AuditFilter {
                event_type: Some(AuditEventType::AuthorityViolation),
                ..Default::default()
            },
            10,
        );
        assert_eq!(violations.len(), 1);

        assert!(guard.ensure_sentinel().unwrap());
        assert!(!guard.ensure_sentinel().unwrap());
        assert!(guard.require_main("initiate_merge", "main", "agent").is_ok());

        fs::create_dir_all(layout.active_workspace("feature-x")).unwrap();
        assert!(guard.require_main("initiate_merge", "feature-x", "agent").is_err());
    }
}
