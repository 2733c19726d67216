//! Host code repository operations via `git2`.
//!
//! The adapter never holds a [`Repository`] open between calls, so it can be
//! shared across threads behind an `Arc`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{
    BranchType, Delta, Diff, DiffFindOptions, DiffOptions, IndexAddOption, Oid, Repository,
    Signature, StatusOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::heuristics::ThemeHeuristics;
use crate::config::{AppConfig, GitConfig};
use crate::errors::GitError;
use crate::store::ThemeResolver;

const FALLBACK_SIGNATURE_NAME: &str = "orgsync";
const FALLBACK_SIGNATURE_EMAIL: &str = "orgsync@localhost";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Working-tree summary of the host repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoStatus {
    /// HEAD commit, `None` before the first commit.
    pub hash: Option<String>,
    /// Checked-out branch, `None` when detached or unborn.
    pub branch: Option<String>,
    pub dirty: bool,
    /// Paths with staged, unstaged or untracked changes.
    pub changed: Vec<String>,
}

/// Kind of change to a path between two trees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One changed source path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Previous path for renames.
    pub old_path: Option<String>,
    /// Candidate themes touched by this change.
    pub themes: Vec<String>,
}

/// Result of [`GitAdapter::detect_code_changes`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeChangeReport {
    /// First observation: nothing to compare against, zero impact.
    pub baseline: bool,
    pub from_hash: Option<String>,
    pub to_hash: String,
    pub changes: Vec<FileChange>,
    pub affected_themes: Vec<String>,
    pub summary: String,
}

impl CodeChangeReport {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Result of [`GitAdapter::initialize_repository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    /// A new repository was created.
    pub created: bool,
    /// Ignore rules were added to `.gitignore`.
    pub ignore_updated: bool,
    /// The first commit, if this call made it.
    pub initial_commit: Option<String>,
}

/// Result of [`GitAdapter::ensure_canonical_branch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchOutcome {
    pub name: String,
    pub created: bool,
    /// Branch (or `HEAD`) the new branch was created from.
    pub created_from: Option<String>,
    pub hash: String,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Wraps the project's git repository.
pub struct GitAdapter {
    root: PathBuf,
    config: GitConfig,
    /// Root-relative prefixes whose changes are organizational, not code.
    excluded_prefixes: Vec<String>,
    ignore_entries: Vec<String>,
    heuristics: ThemeHeuristics,
    resolver: Arc<dyn ThemeResolver>,
}

impl GitAdapter {
    pub fn new<P: AsRef<Path>>(
        root: P,
        config: &AppConfig,
        resolver: Arc<dyn ThemeResolver>,
    ) -> Self {
        let state = normalize_prefix(&config.paths.state_dir);
        let instances = normalize_prefix(&config.paths.instances_dir);
        let db = config.paths.database_file.to_string_lossy().to_string();
        Self {
            root: root.as_ref().to_path_buf(),
            config: config.git.clone(),
            ignore_entries: vec![
                format!("{instances}/"),
                format!("{state}/{db}-wal"),
                format!("{state}/{db}-shm"),
            ],
            excluded_prefixes: vec![state, instances],
            heuristics: ThemeHeuristics::new(&config.heuristics),
            resolver,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.root)
            .map_err(|_| GitError::RepositoryNotFound(self.root.display().to_string()))
    }

    pub fn is_repository(&self) -> bool {
        Repository::open(&self.root).is_ok()
    }

    /// Create the repository if needed, seed ignore rules for the instance
    /// bookkeeping, and make the first commit. Safe to call repeatedly.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn initialize_repository(&self) -> Result<InitOutcome, GitError> {
        let (repo, created) = match Repository::open(&self.root) {
            Ok(repo) => (repo, false),
            Err(_) => {
                info!("initializing git repository");
                (Repository::init(&self.root)?, true)
            }
        };

        let ignore_updated = self.seed_ignore_rules()?;

        let initial_commit = if repo.head().is_err() {
            let oid = commit_all(&repo, "Initialize organizational state tracking")?;
            info!(sha = %oid, "created initial commit");
            Some(oid.to_string())
        } else {
            if ignore_updated {
                warn!("added ignore rules to an existing repository; .gitignore is uncommitted");
            }
            None
        };

        Ok(InitOutcome {
            created,
            ignore_updated,
            initial_commit,
        })
    }

    /// Append missing bookkeeping entries to `.gitignore`.
    fn seed_ignore_rules(&self) -> Result<bool, GitError> {
        let path = self.root.join(".gitignore");
        let existing = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let present: BTreeSet<&str> = existing.lines().map(str::trim).collect();
        let missing: Vec<&String> = self
            .ignore_entries
            .iter()
            .filter(|e| !present.contains(e.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }

        let mut contents = existing.clone();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        if !existing.contains("# orgsync") {
            contents.push_str("# orgsync instance bookkeeping\n");
        }
        for entry in &missing {
            contents.push_str(entry);
            contents.push('\n');
        }
        std::fs::write(&path, contents)?;
        debug!(added = missing.len(), "updated .gitignore");
        Ok(true)
    }

    /// Stage everything not ignored and commit it on HEAD.
    #[instrument(skip(self, message))]
    pub fn commit_all(&self, message: &str) -> Result<String, GitError> {
        let repo = self.open()?;
        let oid = commit_all(&repo, message)?;
        info!(sha = %oid, "created commit");
        Ok(oid.to_string())
    }

    /// SHA of HEAD.
    pub fn current_hash(&self) -> Result<String, GitError> {
        let repo = self.open()?;
        head_hash(&repo)
    }

    #[instrument(skip(self))]
    pub fn status(&self) -> Result<RepoStatus, GitError> {
        let repo = self.open()?;
        let hash = head_hash(&repo).ok();
        let branch = repo
            .head()
            .ok()
            .filter(|h| h.is_branch())
            .and_then(|h| h.shorthand().map(str::to_string));

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let changed: Vec<String> = statuses
            .iter()
            .filter(|s| !s.status().is_ignored())
            .filter_map(|s| s.path().map(str::to_string))
            .collect();

        debug!(changed = changed.len(), "collected repository status");
        Ok(RepoStatus {
            hash,
            branch,
            dirty: !changed.is_empty(),
            changed,
        })
    }

    /// Changes to source code between `last_hash` and HEAD, excluding the
    /// organizational state and instance trees. With no `last_hash` the
    /// result is a zero-impact baseline at HEAD.
    #[instrument(skip(self))]
    pub fn detect_code_changes(
        &self,
        last_hash: Option<&str>,
    ) -> Result<CodeChangeReport, GitError> {
        let repo = self.open()?;
        let head = head_hash(&repo)?;

        let Some(last) = last_hash else {
            info!(hash = %head, "recording baseline");
            return Ok(CodeChangeReport {
                baseline: true,
                from_hash: None,
                to_hash: head,
                changes: Vec::new(),
                affected_themes: Vec::new(),
                summary: "baseline".into(),
            });
        };

        if last == head {
            return Ok(CodeChangeReport {
                baseline: false,
                from_hash: Some(head.clone()),
                to_hash: head,
                changes: Vec::new(),
                affected_themes: Vec::new(),
                summary: "no changes".into(),
            });
        }

        let old_tree = resolve_commit(&repo, last)?.tree()?;
        let new_tree = resolve_commit(&repo, &head)?.tree()?;
        let mut diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
        let changes = self.collect_changes(&mut diff, true)?;

        let affected_themes: BTreeSet<String> = changes
            .iter()
            .flat_map(|c| c.themes.iter().cloned())
            .collect();
        let summary = summarize(&changes);
        info!(
            from = %last,
            to = %head,
            changed = changes.len(),
            themes = affected_themes.len(),
            "detected code changes"
        );
        Ok(CodeChangeReport {
            baseline: false,
            from_hash: Some(last.to_string()),
            to_hash: head,
            changes,
            affected_themes: affected_themes.into_iter().collect(),
            summary,
        })
    }

    /// Create `name` from the primary branch if it does not exist yet.
    #[instrument(skip(self))]
    pub fn ensure_canonical_branch(&self, name: &str) -> Result<BranchOutcome, GitError> {
        let repo = self.open()?;
        if let Ok(branch) = repo.find_branch(name, BranchType::Local) {
            let hash = branch.get().peel_to_commit()?.id().to_string();
            debug!(name, "canonical branch already exists");
            return Ok(BranchOutcome {
                name: name.to_string(),
                created: false,
                created_from: None,
                hash,
            });
        }

        let mut source = None;
        for primary in &self.config.primary_branches {
            if let Ok(branch) = repo.find_branch(primary, BranchType::Local) {
                source = Some((primary.clone(), branch.get().peel_to_commit()?));
                break;
            }
        }
        let (from, commit) = match source {
            Some(found) => found,
            None => match repo.head().and_then(|h| h.peel_to_commit()) {
                Ok(commit) => ("HEAD".to_string(), commit),
                Err(_) => {
                    return Err(GitError::NoPrimaryBranch(
                        self.config.primary_branches.join(", "),
                    ))
                }
            },
        };

        repo.branch(name, &commit, false)?;
        info!(name, from = %from, "created canonical branch");
        Ok(BranchOutcome {
            name: name.to_string(),
            created: true,
            created_from: Some(from),
            hash: commit.id().to_string(),
        })
    }

    /// The configured canonical branch, created on demand.
    pub fn ensure_default_canonical_branch(&self) -> Result<BranchOutcome, GitError> {
        let name = self.config.canonical_branch.clone();
        self.ensure_canonical_branch(&name)
    }

    /// Working-tree edits (including untracked files) relative to `branch`.
    #[instrument(skip(self))]
    pub fn diff_against(&self, branch: &str) -> Result<Vec<FileChange>, GitError> {
        let repo = self.open()?;
        let tree = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| GitError::RefNotFound(branch.to_string()))?
            .get()
            .peel_to_tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let mut diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;
        let changes = self.collect_changes(&mut diff, false)?;
        debug!(branch, changed = changes.len(), "diffed against branch");
        Ok(changes)
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(&format!("{prefix}/")))
    }

    /// Classify the deltas of `diff`. With `code_only`, paths under the
    /// state and instance trees are dropped.
    fn collect_changes(
        &self,
        diff: &mut Diff<'_>,
        code_only: bool,
    ) -> Result<Vec<FileChange>, GitError> {
        let mut find = DiffFindOptions::new();
        find.renames(true);
        diff.find_similar(Some(&mut find))?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let kind = match delta.status() {
                Delta::Added | Delta::Untracked | Delta::Copied => ChangeKind::Added,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Renamed => ChangeKind::Renamed,
                Delta::Modified | Delta::Typechange => ChangeKind::Modified,
                _ => continue,
            };
            let new_path = delta.new_file().path().map(path_string);
            let old_path = delta.old_file().path().map(path_string);
            let path = match kind {
                ChangeKind::Deleted => old_path.clone(),
                _ => new_path.or_else(|| old_path.clone()),
            };
            let Some(path) = path else { continue };
            if code_only && self.is_excluded(&path) {
                continue;
            }
            let themes = self.heuristics.themes_for(&path, self.resolver.as_ref());
            changes.push(FileChange {
                old_path: (kind == ChangeKind::Renamed).then_some(old_path).flatten(),
                path,
                kind,
                themes,
            });
        }
        Ok(changes)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_prefix(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches("./")
        .trim_end_matches('/')
        .to_string()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn head_hash(repo: &Repository) -> Result<String, GitError> {
    let commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|_| GitError::RefNotFound("HEAD".into()))?;
    Ok(commit.id().to_string())
}

fn resolve_commit<'r>(repo: &'r Repository, spec: &str) -> Result<git2::Commit<'r>, GitError> {
    let oid = Oid::from_str(spec).map_err(|_| GitError::RefNotFound(spec.to_string()))?;
    repo.find_commit(oid)
        .map_err(|_| GitError::RefNotFound(spec.to_string()))
}

fn commit_all(repo: &Repository, message: &str) -> Result<Oid, GitError> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;
    let signature = repo
        .signature()
        .or_else(|_| Signature::now(FALLBACK_SIGNATURE_NAME, FALLBACK_SIGNATURE_EMAIL))?;
    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(_) => None,
    };
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    Ok(oid)
}

fn summarize(changes: &[FileChange]) -> String {
    if changes.is_empty() {
        return "no code changes".into();
    }
    let mut parts = Vec::new();
    for kind in [
        ChangeKind::Added,
        ChangeKind::Modified,
        ChangeKind::Deleted,
        ChangeKind::Renamed,
    ] {
        let n = changes.iter().filter(|c| c.kind == kind).count();
        if n > 0 {
            parts.push(format!("{n} {kind}"));
        }
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StaticThemeResolver;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn adapter(root: &Path) -> GitAdapter {
        let resolver = StaticThemeResolver::new().with("src/billing.rs", "payments");
        GitAdapter::new(root, &AppConfig::default(), Arc::new(resolver))
    }

    #[test]
    fn test_repo_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let git = adapter(dir.path());
        assert!(!git.is_repository());
        assert!(matches!(git.status(), Err(GitError::RepositoryNotFound(_))));
        assert!(matches!(
            git.detect_code_changes(None),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", "hello");
        let git = adapter(dir.path());

        let first = git.initialize_repository().unwrap();
        assert!(first.created);
        assert!(first.ignore_updated);
        assert!(first.initial_commit.is_some());

        let ignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(ignore.contains(".instances/"));

        let second = git.initialize_repository().unwrap();
        assert_eq!(
            second,
            InitOutcome {
                created: false,
                ignore_updated: false,
                initial_commit: None
            }
        );
        assert!(!git.status().unwrap().dirty);
    }

    #[test]
    fn test_baseline_has_no_impact() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/auth/login.rs", "fn login() {}");
        let git = adapter(dir.path());
        git.initialize_repository().unwrap();

        let report = git.detect_code_changes(None).unwrap();
        assert!(report.baseline);
        assert!(report.changes.is_empty());
        assert!(report.affected_themes.is_empty());
        assert_eq!(report.to_hash, git.current_hash().unwrap());
    }

    #[test]
    fn test_detect_changes_excludes_state_and_maps_themes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/auth/login.rs", "fn login() {}");
        write(dir.path(), "src/old_name.rs", "fn a() {}\nfn b() {}\nfn c() {}\n");
        write(dir.path(), "src/gone.rs", "const GONE: [u8; 4] = [1, 2, 3, 4];\n");
        let git = adapter(dir.path());
        git.initialize_repository().unwrap();
        let base = git.current_hash().unwrap();

        write(dir.path(), "src/auth/login.rs", "fn login() { todo() }");
        write(dir.path(), "src/billing.rs", "pub fn charge(amount: u64) -> bool { amount > 0 }\n");
        write(dir.path(), ".org-state/themes/authentication.json", "{}");
        std::fs::remove_file(dir.path().join("src/gone.rs")).unwrap();
        std::fs::rename(
            dir.path().join("src/old_name.rs"),
            dir.path().join("src/new_name.rs"),
        )
        .unwrap();
        git.commit_all("change code").unwrap();

        let report = git.detect_code_changes(Some(&base)).unwrap();
        assert!(!report.baseline);
        let find = |p: &str| report.changes.iter().find(|c| c.path == p).cloned();

        assert_eq!(find("src/auth/login.rs").unwrap().kind, ChangeKind::Modified);
        assert_eq!(find("src/billing.rs").unwrap().kind, ChangeKind::Added);
        assert_eq!(find("src/gone.rs").unwrap().kind, ChangeKind::Deleted);
        let renamed = find("src/new_name.rs").unwrap();
        assert_eq!(renamed.kind, ChangeKind::Renamed);
        assert_eq!(renamed.old_path.as_deref(), Some("src/old_name.rs"));
        assert!(report.changes.iter().all(|c| !c.path.starts_with(".org-state")));

        assert!(report.affected_themes.contains(&"authentication".to_string()));
        assert!(report.affected_themes.contains(&"payments".to_string()));
    }

    #[test]
    fn test_unknown_last_hash_is_ref_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "a");
        let git = adapter(dir.path());
        git.initialize_repository().unwrap();
        let err = git
            .detect_code_changes(Some("0123456789abcdef0123456789abcdef01234567"))
            .unwrap_err();
        assert!(matches!(err, GitError::RefNotFound(_)));
    }

    #[test]
    fn test_canonical_branch_and_diff() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".org-state/themes/auth.json", "{}");
        let git = adapter(dir.path());
        git.initialize_repository().unwrap();

        let created = git.ensure_canonical_branch("org-state").unwrap();
        assert!(created.created);
        let again = git.ensure_canonical_branch("org-state").unwrap();
        assert!(!again.created);
        assert_eq!(again.hash, created.hash);

        assert!(git.diff_against("org-state").unwrap().is_empty());
        write(dir.path(), ".org-state/themes/auth.json", r#"{"name":"auth"}"#);
        write(dir.path(), ".org-state/flows/login.json", "{}");
        let edits = git.diff_against("org-state").unwrap();
        let paths: Vec<_> = edits.iter().map(|c| c.path.as_str()).collect();
        assert!(paths.contains(&".org-state/themes/auth.json"));
        assert!(paths.contains(&".org-state/flows/login.json"));

        assert!(matches!(
            git.diff_against("missing-branch"),
            Err(GitError::RefNotFound(_))
        ));
    }
}
