//! Shared fixtures for the integration suites: a real git repository with
//! a small canonical state tree, opened through `InstanceManager::open`.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use orgsync_core::{CreateInstanceRequest, InstanceManager};

pub const AUTH_THEME: &str = r#"{
  "name": "authentication",
  "description": "Login, sessions and tokens",
  "files": ["src/auth/login.rs"]
}
"#;

pub const SIGNUP_FLOW: &str = r#"{
  "name": "signup",
  "steps": ["form", "verify-email", "welcome"]
}
"#;

pub const COMPLETION_PATH: &str = r#"{
  "tasks": [{"id": "task-001", "status": "done"}]
}
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Project {
    pub dir: TempDir,
    pub manager: InstanceManager,
}

impl Project {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn state(&self, rel: &str) -> PathBuf {
        self.manager.layout().state_dir().join(rel)
    }

    pub fn workspace(&self, id: &str, rel: &str) -> PathBuf {
        self.manager.layout().active_workspace(id).join(rel)
    }

    pub fn create(&self, id: &str) {
        self.manager
            .create_instance(
                CreateInstanceRequest::new(&format!("work on {id}"))
                    .with_id(id)
                    .with_themes(["authentication"]),
            )
            .unwrap();
    }
}

pub fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

/// A committed project with one theme, one flow, the completion ledger, a
/// source file claimed by the theme, and the canonical sentinel.
pub fn project() -> Project {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let state = root.join(".org-state");
    write(&state.join("themes/authentication.json"), AUTH_THEME);
    write(&state.join("flows/signup.json"), SIGNUP_FLOW);
    write(&state.join("tasks/completion-path.json"), COMPLETION_PATH);
    write(
        &root.join("src/auth/login.rs"),
        "pub fn login(user: &str) -> bool {\n    !user.is_empty()\n}\n",
    );

    let manager = InstanceManager::open(root).unwrap();
    manager.initialize().unwrap();
    Project { dir, manager }
}
