//! Comprehensive error types for the OrgSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. [`CoreError::kind`] folds every error onto the four
//! failure classes callers act on: validation, precondition, partial failure
//! and system.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; rejected before any side effect.
    Validation,
    /// The environment is not in a state that allows the operation.
    Precondition,
    /// Some items succeeded and some did not.
    PartialFailure,
    /// Disk, permission or store failure.
    System,
}

impl CoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Git(GitError::RepositoryNotFound(_)) => ErrorKind::Precondition,
            Self::Git(GitError::RefNotFound(_)) => ErrorKind::Validation,
            Self::Git(_) => ErrorKind::System,
            Self::Database(DatabaseError::NotFound { .. }) => ErrorKind::Validation,
            Self::Database(_) => ErrorKind::System,
            Self::Config(ConfigError::InvalidValue { .. }) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::System,
            Self::Backup(BackupError::NotFound(_)) => ErrorKind::Validation,
            Self::Backup(_) => ErrorKind::System,
            Self::Recovery(RecoveryError::PointNotFound(_)) => ErrorKind::Validation,
            Self::Recovery(_) => ErrorKind::System,
            Self::Conflict(ConflictError::PartiallyApplied { .. }) => ErrorKind::PartialFailure,
            Self::Conflict(ConflictError::ChangedSinceReview { .. }) => ErrorKind::Precondition,
            Self::Conflict(ConflictError::Io(_)) | Self::Conflict(ConflictError::Database(_)) => {
                ErrorKind::System
            }
            Self::Conflict(_) => ErrorKind::Validation,
            Self::Instance(e) => e.kind(),
            Self::Io(_) => ErrorKind::System,
        }
    }

    /// `true` when the caller was rejected before anything was touched.
    pub fn is_rejection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Precondition)
    }
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// No primary branch exists to create the canonical branch from.
    #[error("no primary branch found (tried {0})")]
    NoPrimaryBranch(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A JSON column could not be encoded or decoded.
    #[error("database JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored enum column held an unknown value.
    #[error("invalid {field} value in database: '{value}'")]
    InvalidColumn { field: String, value: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Backup errors
// ---------------------------------------------------------------------------

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum BackupError {
    /// No backup exists under this id.
    #[error("backup not found: {0}")]
    NotFound(String),

    /// The manifest of a backup could not be read or written.
    #[error("backup manifest error for '{id}': {detail}")]
    Manifest { id: String, detail: String },

    /// Copying a path into or out of the store failed.
    #[error("backup copy failed for '{path}': {source}")]
    Copy {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O wrapper.
    #[error("backup I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Recovery errors
// ---------------------------------------------------------------------------

/// Errors from recovery-point creation and rollback.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// No recovery point exists under this id.
    #[error("recovery point not found: {0}")]
    PointNotFound(String),

    /// The snapshot behind a recovery point failed.
    #[error("recovery backup error: {0}")]
    Backup(#[from] BackupError),

    /// Reverting store rows failed.
    #[error("recovery store error: {0}")]
    Database(#[from] DatabaseError),

    /// The recovery log could not be written.
    #[error("recovery log error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict detection / resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The requested conflict ID was not found in the current detection.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// No merge record with this id.
    #[error("merge not found: {0}")]
    MergeNotFound(String),

    /// A workspace taking part in the comparison does not exist.
    #[error("workspace missing: {0}")]
    WorkspaceMissing(String),

    /// A resolution payload is unusable (bad split name, empty snapshot path).
    #[error("invalid payload for conflict {id}: {detail}")]
    InvalidPayload { id: String, detail: String },

    /// The merge is in a state that does not accept this operation.
    #[error("merge {merge_id} is {status}, expected {expected}")]
    InvalidMergeState {
        merge_id: String,
        status: String,
        expected: String,
    },

    /// The resolution variant does not match the conflict's type.
    #[error("resolution for conflict {id} is a {given} resolution, conflict is {expected}")]
    ResolutionTypeMismatch {
        id: String,
        given: String,
        expected: String,
    },

    /// Some resolutions applied and some did not.
    #[error("merge {merge_id}: {failed} of {total} resolutions failed")]
    PartiallyApplied {
        merge_id: String,
        failed: usize,
        total: usize,
    },

    /// The workspaces no longer match what was presented for review.
    #[error("merge {merge_id} changed since review: {detail}")]
    ChangedSinceReview { merge_id: String, detail: String },

    /// Conflicts remain unresolved on a merge being completed.
    #[error("merge {merge_id} still has {remaining} unresolved conflict(s)")]
    Unresolved { merge_id: String, remaining: u32 },

    /// Database error when reading or writing merge records.
    #[error("conflict database error: {0}")]
    Database(#[from] DatabaseError),

    /// Reading or writing workspace files failed.
    #[error("conflict I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Instance errors
// ---------------------------------------------------------------------------

/// Errors from instance lifecycle and authority checks.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The id does not satisfy the slug rules.
    #[error("invalid instance id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    /// The id is one of the reserved branch-like names.
    #[error("instance id '{0}' is reserved")]
    ReservedId(String),

    /// An instance with this id already exists.
    #[error("instance '{0}' already exists")]
    AlreadyExists(String),

    /// No instance (or no active workspace) with this id.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// No merge record with this id.
    #[error("merge not found: {0}")]
    MergeNotFound(String),

    /// The requested status change is not allowed by the lifecycle.
    #[error("instance '{id}' cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// The operation target does not carry the canonical sentinel.
    #[error("operation '{operation}' requires main-instance authority; '{target}' is not main")]
    NotMainAuthority { operation: String, target: String },

    /// The canonical state cannot be used as a source.
    #[error("canonical state unusable: {0}")]
    CanonicalUnavailable(String),

    /// A recovery-wrapped operation failed after side effects began.
    #[error("{operation} failed: {detail}{}", rollback_suffix(.rollback))]
    OperationFailed {
        operation: String,
        detail: String,
        rollback: Option<String>,
    },
}

fn rollback_suffix(rollback: &Option<String>) -> String {
    rollback
        .as_ref()
        .map(|r| format!(" (rollback: {r})"))
        .unwrap_or_default()
}

impl InstanceError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidId { .. }
            | Self::ReservedId(_)
            | Self::AlreadyExists(_)
            | Self::NotFound(_)
            | Self::MergeNotFound(_)
            | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::NotMainAuthority { .. } | Self::CanonicalUnavailable(_) => {
                ErrorKind::Precondition
            }
            Self::OperationFailed { .. } => ErrorKind::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = InstanceError::ReservedId("main".into());
        assert_eq!(err.to_string(), "instance id 'main' is reserved");

        let err = InstanceError::OperationFailed {
            operation: "create_instance".into(),
            detail: "disk full".into(),
            rollback: Some("restored 2 path(s)".into()),
        };
        assert_eq!(
            err.to_string(),
            "create_instance failed: disk full (rollback: restored 2 path(s))"
        );

        let err = InstanceError::OperationFailed {
            operation: "archive_instance".into(),
            detail: "permission denied".into(),
            rollback: None,
        };
        assert_eq!(err.to_string(), "archive_instance failed: permission denied");
    }

    #[test]
    fn test_kind_classification() {
        let err: CoreError = InstanceError::InvalidId {
            id: "ab".into(),
            reason: "too short".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.is_rejection());

        let err: CoreError = InstanceError::NotMainAuthority {
            operation: "initiate_merge".into(),
            target: "feature-x".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let err: CoreError = GitError::RepositoryNotFound("/nope".into()).into();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let err: CoreError = ConflictError::PartiallyApplied {
            merge_id: "m".into(),
            failed: 1,
            total: 3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
        assert!(!err.is_rejection());

        let err: CoreError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.kind(), ErrorKind::System);
    }
}
