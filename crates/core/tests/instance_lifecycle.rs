//! Instance creation, status, archival and authority, driven through the
//! public `InstanceManager` API over real temp projects.

mod common;

use std::fs;
use std::sync::Arc;

use common::{project, read, write};
use orgsync_core::audit::AuditFilter;
use orgsync_core::errors::InstanceError;
use orgsync_core::instance::read_branch_info;
use orgsync_core::models::InstanceStatus;
use orgsync_core::store::StaticThemeResolver;
use orgsync_core::{
    AuditEventType, CoreError, CreateInstanceRequest, Database, ErrorKind, InstanceManager,
};

#[test]
fn test_create_instance_copies_state_and_database() {
    let p = project();
    let report = p
        .manager
        .create_instance(
            CreateInstanceRequest::new("refactor login")
                .with_id("auth-refactor")
                .with_themes(["authentication"]),
        )
        .unwrap();

    assert_eq!(report.instance.id, "auth-refactor");
    assert_eq!(report.instance.status, InstanceStatus::Active);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(report.instance.git_base_hash.is_some());

    let ws = p.manager.layout().active_workspace("auth-refactor");
    assert!(ws.is_dir());
    assert_eq!(
        read(&ws.join("themes/authentication.json")),
        common::AUTH_THEME
    );
    assert!(!ws.join(".main-instance").exists());

    let info = read_branch_info(&ws).unwrap().unwrap();
    assert_eq!(info.instance_id, "auth-refactor");
    assert_eq!(info.primary_themes, vec!["authentication"]);
    assert_eq!(info.created_from, "main");
    assert!(ws.join(".work-summary.md").is_file());

    let db = Database::open_read_only(ws.join("project.db")).unwrap();
    assert!(db.table_names().is_ok());

    let stored = p.manager.get_instance("auth-refactor").unwrap().unwrap();
    assert_eq!(stored.workspace_path, ws);
    let active = p.manager.list_active().unwrap();
    assert_eq!(active.len(), 1);

    let created = p.manager.audit().search(
        &AuditFilter {
            event_type: Some(AuditEventType::InstanceCreated),
            ..Default::default()
        },
        10,
    );
    assert_eq!(created.len(), 1);
    assert!(p.manager.audit().verify_integrity(&created[0]));
}

#[test]
fn test_excluded_subtrees_stay_local() {
    let p = project();
    write(&p.state("backups/old.json"), "{}");
    write(&p.state("settings.local.json"), "{}");
    write(&p.state("sessions/s1.json"), "{}");
    p.create("feature-auth-db");

    let ws = p.manager.layout().active_workspace("feature-auth-db");
    assert!(!ws.join("backups").exists());
    assert!(!ws.join("settings.local.json").exists());
    assert!(!ws.join("sessions").exists());
    assert!(ws.join("flows/signup.json").is_file());
}

#[test]
fn test_id_validation_and_generation() {
    let p = project();

    let err = p
        .manager
        .create_instance(CreateInstanceRequest::new("x").with_id("ab"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Instance(InstanceError::InvalidId { .. })));

    let err = p
        .manager
        .create_instance(CreateInstanceRequest::new("x").with_id("main"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Instance(InstanceError::ReservedId(_))));

    p.create("feature-auth-db");
    let err = p
        .manager
        .create_instance(CreateInstanceRequest::new("x").with_id("feature-auth-db"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Instance(InstanceError::AlreadyExists(_))));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let generated = p
        .manager
        .create_instance(CreateInstanceRequest::new("Billing Rework!"))
        .unwrap();
    assert_eq!(generated.instance.id, "billing-rework");
    let again = p
        .manager
        .create_instance(CreateInstanceRequest::new("Billing Rework!"))
        .unwrap();
    assert_eq!(again.instance.id, "billing-rework-2");
}

#[test]
fn test_generated_id_surfaces_store_failures() {
    let p = project();
    // A store whose tables were never created fails every lookup.
    let store = Arc::new(Database::in_memory().unwrap());
    let manager = InstanceManager::new(
        p.root(),
        p.manager.config().clone(),
        store,
        Arc::new(StaticThemeResolver::new()),
    );

    let err = manager
        .create_instance(CreateInstanceRequest::new("login rework"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Database(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::System);
    assert!(!manager.layout().active_workspace("login-rework").exists());
}

#[test]
fn test_dirty_repository_warns_without_blocking() {
    let p = project();
    write(&p.root().join("src/auth/login.rs"), "pub fn login() {}\n");
    let report = p
        .manager
        .create_instance(CreateInstanceRequest::new("x").with_id("dirty-tree"))
        .unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("uncommitted"));
}

#[test]
fn test_failed_creation_leaves_nothing_behind() {
    let p = project();
    // Corrupt the canonical database so the snapshot step fails after the
    // workspace has been populated.
    fs::write(p.manager.layout().canonical_database(), b"not a database").unwrap();

    let err = p
        .manager
        .create_instance(CreateInstanceRequest::new("x").with_id("broken-copy"))
        .unwrap_err();
    match &err {
        CoreError::Instance(InstanceError::OperationFailed { rollback, .. }) => {
            assert!(rollback.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!p.manager.layout().active_workspace("broken-copy").exists());
    assert!(p.manager.get_instance("broken-copy").unwrap().is_none());

    let failures = p.manager.audit().search(
        &AuditFilter {
            event_type: Some(AuditEventType::OperationFailed),
            ..Default::default()
        },
        10,
    );
    assert_eq!(failures.len(), 1);
}

#[test]
fn test_archive_twice_fails_gracefully() {
    let p = project();
    p.create("auth-refactor");

    let report = p.manager.archive_instance("auth-refactor", "tester").unwrap();
    assert_eq!(report.previous_status, InstanceStatus::Active);
    let archived = p.manager.layout().completed_workspace("auth-refactor");
    assert_eq!(report.archived_workspace, archived);
    assert!(archived.join("themes/authentication.json").is_file());
    assert!(!p.manager.layout().active_workspace("auth-refactor").exists());

    let err = p
        .manager
        .archive_instance("auth-refactor", "tester")
        .unwrap_err();
    assert!(matches!(err, CoreError::Instance(InstanceError::NotFound(_))));
    assert!(archived.join("themes/authentication.json").is_file());
    assert!(!archived.join("auth-refactor").exists());

    let instance = p.manager.get_instance("auth-refactor").unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Archived);
    assert!(p.manager.list_active().unwrap().is_empty());
}

#[test]
fn test_status_reports_drift() {
    let p = project();
    p.create("auth-refactor");

    let clean = p.manager.get_status("auth-refactor").unwrap();
    assert!(clean.workspace_exists);
    assert!(!clean.has_drift(), "{:?}", clean.drift);

    fs::remove_file(p.workspace("auth-refactor", ".branch-info.json")).unwrap();
    let drifted = p.manager.get_status("auth-refactor").unwrap();
    assert!(drifted.has_drift());

    fs::remove_dir_all(p.manager.layout().active_workspace("auth-refactor")).unwrap();
    let missing = p.manager.get_status("auth-refactor").unwrap();
    assert!(!missing.workspace_exists);
    assert!(missing.drift.iter().any(|d| d.contains("missing")));

    let err = p.manager.get_status("no-such-instance").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_operations_require_main_authority() {
    let p = project();
    p.create("auth-refactor");
    fs::remove_file(p.state(".main-instance")).unwrap();

    let err = p
        .manager
        .initiate_merge("auth-refactor", "main", "intruder")
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Instance(InstanceError::NotMainAuthority { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let err = p
        .manager
        .archive_instance("auth-refactor", "intruder")
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Instance(InstanceError::NotMainAuthority { .. })
    ));
    assert!(p.manager.layout().active_workspace("auth-refactor").is_dir());

    let violations = p.manager.audit().search(
        &AuditFilter {
            event_type: Some(AuditEventType::AuthorityViolation),
            actor: Some("intruder".into()),
            ..Default::default()
        },
        10,
    );
    assert_eq!(violations.len(), 2);

    // Merging into another instance is never allowed: it carries no sentinel.
    p.manager.initialize().unwrap();
    p.create("second-pass");
    let err = p
        .manager
        .initiate_merge("auth-refactor", "second-pass", "tester")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
}
