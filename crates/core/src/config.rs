//! TOML-based configuration system for OrgSync.
//!
//! Every section carries serde defaults, so a project without a config file
//! runs on [`AppConfig::default`]. Paths are interpreted relative to the
//! project root handed to the components at construction time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Conventional file name for the project config, at the project root.
pub const CONFIG_FILE_NAME: &str = "orgsync.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where canonical state, its database, and instances live.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Instance creation settings.
    #[serde(default)]
    pub instances: InstancesConfig,

    /// Conflict detection / presentation settings.
    #[serde(default)]
    pub conflicts: ConflictConfig,

    /// Recovery points and backup retention.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Audit trail settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Worker pool and cache sizing.
    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Code repository settings.
    #[serde(default)]
    pub git: GitConfig,

    /// File → theme mapping dictionaries.
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Layout of the project on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Canonical organizational state subtree, relative to the project root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Relational store file, relative to `state_dir`.
    #[serde(default = "default_database_file")]
    pub database_file: PathBuf,

    /// Root of the instance tree, relative to the project root.
    #[serde(default = "default_instances_dir")]
    pub instances_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".org-state")
}
fn default_database_file() -> PathBuf {
    PathBuf::from("project.db")
}
fn default_instances_dir() -> PathBuf {
    PathBuf::from(".instances")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            database_file: default_database_file(),
            instances_dir: default_instances_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Instance creation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    /// Top-level entries of the state tree that stay local to the canonical
    /// workspace and are never copied into an instance.
    #[serde(default = "default_excluded_subtrees")]
    pub excluded_subtrees: Vec<String>,

    /// Actor recorded when a caller does not name one.
    #[serde(default = "default_created_by")]
    pub created_by: String,

    /// Free-text duration written into new `.branch-info.json` files.
    #[serde(default = "default_expected_duration")]
    pub expected_duration: String,
}

fn default_excluded_subtrees() -> Vec<String> {
    vec![
        "backups".into(),
        "settings.local.json".into(),
        "tmp".into(),
        "sessions".into(),
    ]
}
fn default_created_by() -> String {
    "agent".into()
}
fn default_expected_duration() -> String {
    "unspecified".into()
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            excluded_subtrees: default_excluded_subtrees(),
            created_by: default_created_by(),
            expected_duration: default_expected_duration(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Conflict detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Modification-time divergence (seconds) between the two database files
    /// beyond which a database conflict is reported.
    #[serde(default = "default_mtime_threshold")]
    pub database_mtime_threshold_secs: u64,

    /// Maximum lines per side included in a presented excerpt.
    #[serde(default = "default_excerpt_lines")]
    pub excerpt_lines: usize,
}

fn default_mtime_threshold() -> u64 {
    60
}
fn default_excerpt_lines() -> usize {
    40
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            database_mtime_threshold_secs: default_mtime_threshold(),
            excerpt_lines: default_excerpt_lines(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Recovery point and backup retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How far back `handle_operation_failure` looks for a recovery point.
    #[serde(default = "default_recency_window")]
    pub recency_window_secs: u64,

    /// Backups older than this are pruned by `cleanup_old_backups`.
    #[serde(default = "default_backup_retention")]
    pub backup_retention_days: u32,
}

fn default_recency_window() -> u64 {
    3600
}
fn default_backup_retention() -> u32 {
    7
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recency_window_secs: default_recency_window(),
            backup_retention_days: default_backup_retention(),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Compliance retention window in days.
    #[serde(default = "default_audit_retention")]
    pub retention_days: u32,
}

fn default_audit_retention() -> u32 {
    90
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_audit_retention(),
        }
    }
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

/// Worker pool and cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Bounded pool width for batch operations.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Cache entry limit before scaling.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Cache entry time-to-live before scaling.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// File count beyond which a project is treated as large and the cache
    /// is scaled up.
    #[serde(default = "default_large_project_threshold")]
    pub large_project_threshold: usize,
}

fn default_worker_count() -> usize {
    4
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_large_project_threshold() -> usize {
    5000
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
            large_project_threshold: default_large_project_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Code repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Dedicated branch that tracks canonical organizational state.
    #[serde(default = "default_canonical_branch")]
    pub canonical_branch: String,

    /// Candidate names of the user's primary branch, in preference order.
    #[serde(default = "default_primary_branches")]
    pub primary_branches: Vec<String>,
}

fn default_canonical_branch() -> String {
    "org-state".into()
}
fn default_primary_branches() -> Vec<String> {
    vec!["main".into(), "master".into()]
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            canonical_branch: default_canonical_branch(),
            primary_branches: default_primary_branches(),
        }
    }
}

// ---------------------------------------------------------------------------
// Theme heuristics
// ---------------------------------------------------------------------------

/// Dictionaries used to guess which themes a changed source file touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicsConfig {
    /// Directory name → theme.
    #[serde(default = "default_directory_themes")]
    pub directory_themes: BTreeMap<String, String>,

    /// Glob over the file name → theme.
    #[serde(default = "default_filename_patterns")]
    pub filename_patterns: BTreeMap<String, String>,
}

fn default_directory_themes() -> BTreeMap<String, String> {
    [
        ("auth", "authentication"),
        ("authentication", "authentication"),
        ("login", "authentication"),
        ("api", "api"),
        ("routes", "api"),
        ("db", "database"),
        ("database", "database"),
        ("models", "database"),
        ("migrations", "database"),
        ("components", "frontend"),
        ("ui", "frontend"),
        ("views", "frontend"),
        ("tests", "testing"),
        ("test", "testing"),
        ("config", "configuration"),
        ("docs", "documentation"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_filename_patterns() -> BTreeMap<String, String> {
    [
        ("*auth*", "authentication"),
        ("*login*", "authentication"),
        ("*session*", "authentication"),
        ("*.sql", "database"),
        ("*schema*", "database"),
        ("*.test.*", "testing"),
        ("*_test.*", "testing"),
        ("*.spec.*", "testing"),
        ("*config*", "configuration"),
        ("*.md", "documentation"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            directory_themes: default_directory_themes(),
            filename_patterns: default_filename_patterns(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load `orgsync.toml` from the project root if present, otherwise fall
    /// back to defaults. The result is validated either way.
    pub fn load_for_project<P: AsRef<Path>>(root: P) -> Result<Self, ConfigError> {
        let path = root.as_ref().join(CONFIG_FILE_NAME);
        let config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            debug!(path = %path.display(), "no project config, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate that all fields are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "paths.state_dir".into(),
                detail: "state directory must not be empty".into(),
            });
        }
        if self.paths.state_dir == self.paths.instances_dir {
            return Err(ConfigError::InvalidValue {
                field: "paths.instances_dir".into(),
                detail: "instances directory must differ from the state directory".into(),
            });
        }
        if self.paths.database_file.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "paths.database_file".into(),
                detail: "database file name must not be empty".into(),
            });
        }
        if self.performance.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "performance.worker_count".into(),
                detail: "worker count must be > 0".into(),
            });
        }
        if self.performance.cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "performance.cache_capacity".into(),
                detail: "cache capacity must be > 0".into(),
            });
        }
        if self.git.primary_branches.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.primary_branches".into(),
                detail: "at least one primary branch name is required".into(),
            });
        }
        Ok(())
    }
}
