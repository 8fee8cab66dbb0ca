//! Execution-context resolution.
//!
//! Every invocation runs inside some checkout of the repository: either the
//! primary clone or a linked worktree (secondary). The resolver asks libgit2
//! which one instead of parsing directory-naming conventions: a linked
//! worktree keeps its per-checkout metadata as a file pointer instead of a
//! directory, and `Repository::is_worktree` reports exactly that shape.
//! Resolution is a pure query with no side effects; the context is
//! recomputed on every invocation and never persisted.

use git2::Repository;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::ContextError;

/// Number of hex characters kept from the root-path digest. Collisions are
/// negligible for realistic checkout counts (well past a thousand).
const CONTEXT_ID_LEN: usize = 12;

/// The identity of the checkout the current process runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Canonical top-level checkout root.
    pub root: PathBuf,
    /// True for linked worktrees, false for the primary clone.
    pub is_secondary: bool,
    /// Stable truncated hash of the canonical root path.
    pub context_id: String,
    /// Current branch shorthand ("HEAD" when detached).
    pub branch: String,
    /// Root of the primary clone; equals `root` for primary contexts, and
    /// is absent when the shared metadata belongs to a bare repository.
    pub primary_root: Option<PathBuf>,
}

impl ExecutionContext {
    /// Resolve the context from the current working directory.
    pub fn resolve(cwd: &Path) -> Result<Self, ContextError> {
        let repo = Repository::discover(cwd).map_err(|_| ContextError::NotManaged {
            path: cwd.to_path_buf(),
        })?;

        let workdir = repo.workdir().ok_or_else(|| ContextError::NoWorkdir {
            path: repo.path().to_path_buf(),
        })?;
        let root = workdir
            .canonicalize()
            .map_err(|source| ContextError::Canonicalize {
                path: workdir.to_path_buf(),
                source,
            })?;

        let is_secondary = repo.is_worktree();
        let primary_root = if is_secondary {
            primary_root_of(&repo)
        } else {
            Some(root.clone())
        };

        Ok(Self {
            context_id: context_id_for(&root),
            branch: current_branch(&repo)?,
            root,
            is_secondary,
            primary_root,
        })
    }
}

/// Stable context id for a canonical checkout root.
pub fn context_id_for(root: &Path) -> String {
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    let mut id = format!("{digest:x}");
    id.truncate(CONTEXT_ID_LEN);
    id
}

/// Main-clone workdir reachable through the shared metadata location.
fn primary_root_of(repo: &Repository) -> Option<PathBuf> {
    // For a linked worktree, commondir is the main clone's .git directory.
    let main = Repository::open(repo.commondir()).ok()?;
    main.workdir()?.canonicalize().ok()
}

fn current_branch(repo: &Repository) -> Result<String, ContextError> {
    match repo.head() {
        Ok(head) => Ok(head.shorthand().unwrap_or("HEAD").to_string()),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
            // No commit yet; read the symbolic target directly.
            let head = repo.find_reference("HEAD")?;
            Ok(head
                .symbolic_target()
                .and_then(|t| t.strip_prefix("refs/heads/"))
                .unwrap_or("HEAD")
                .to_string())
        }
        Err(e) => Err(e.into()),
    }
}

/// Whether any of the given tag names exists in the repository at `root`.
pub fn tag_exists(root: &Path, names: &[String]) -> Result<bool, ContextError> {
    let repo = Repository::open(root)?;
    Ok(names
        .iter()
        .any(|name| repo.find_reference(&format!("refs/tags/{name}")).is_ok()))
}

/// Canonical roots of all live checkouts known to the repository: the main
/// workdir plus every registered worktree that still validates.
pub fn list_checkouts(primary_root: &Path) -> Result<Vec<PathBuf>, ContextError> {
    let repo = Repository::open(primary_root)?;
    let mut live = Vec::new();

    if let Some(workdir) = repo.workdir() {
        if let Ok(root) = workdir.canonicalize() {
            live.push(root);
        }
    }

    for name in repo.worktrees()?.iter().flatten() {
        let Ok(wt) = repo.find_worktree(name) else {
            continue;
        };
        if wt.validate().is_err() {
            continue;
        }
        if let Ok(path) = wt.path().canonicalize() {
            live.push(path);
        }
    }

    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (Repository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (repo, dir)
    }

    fn commit_file(repo: &Repository, name: &str, content: &str) {
        let workdir = repo.workdir().unwrap().to_path_buf();
        fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "commit", &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn test_resolve_primary_context() {
        let (repo, dir) = setup_repo();
        commit_file(&repo, "a.txt", "hello");

        let ctx = ExecutionContext::resolve(dir.path()).unwrap();
        assert!(!ctx.is_secondary);
        assert_eq!(ctx.root, dir.path().canonicalize().unwrap());
        assert_eq!(ctx.primary_root.as_deref(), Some(ctx.root.as_path()));
        assert_eq!(ctx.context_id.len(), 12);
        assert!(!ctx.branch.is_empty());
    }

    #[test]
    fn test_resolve_from_subdirectory_finds_same_root() {
        let (repo, dir) = setup_repo();
        commit_file(&repo, "a.txt", "hello");
        let sub = dir.path().join("src/deep");
        fs::create_dir_all(&sub).unwrap();

        let from_root = ExecutionContext::resolve(dir.path()).unwrap();
        let from_sub = ExecutionContext::resolve(&sub).unwrap();
        assert_eq!(from_root.context_id, from_sub.context_id);
        assert_eq!(from_root.root, from_sub.root);
    }

    #[test]
    fn test_resolve_outside_checkout_fails() {
        let dir = tempdir().unwrap();
        let err = ExecutionContext::resolve(dir.path()).unwrap_err();
        assert!(matches!(err, ContextError::NotManaged { .. }));
    }

    #[test]
    fn test_resolve_unborn_branch_reads_symbolic_head() {
        let (_repo, dir) = setup_repo();
        let ctx = ExecutionContext::resolve(dir.path()).unwrap();
        // No commit yet; the branch name still comes from symbolic HEAD.
        assert!(!ctx.branch.is_empty());
        assert_ne!(ctx.branch, "HEAD");
    }

    #[test]
    fn test_worktree_is_secondary_with_distinct_identity() {
        let (repo, dir) = setup_repo();
        commit_file(&repo, "a.txt", "hello");

        let wt_dir = tempdir().unwrap();
        let wt_path = wt_dir.path().join("wt1");
        repo.worktree("wt1", &wt_path, None).unwrap();

        let primary = ExecutionContext::resolve(dir.path()).unwrap();
        let secondary = ExecutionContext::resolve(&wt_path).unwrap();

        assert!(secondary.is_secondary);
        assert_ne!(secondary.context_id, primary.context_id);
        assert_eq!(secondary.primary_root.as_deref(), Some(primary.root.as_path()));
        // The worktree is checked out on its own branch.
        assert_eq!(secondary.branch, "wt1");
    }

    #[test]
    fn test_context_id_stable_and_distinct() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let root_a = a.path().canonicalize().unwrap();
        let root_b = b.path().canonicalize().unwrap();

        assert_eq!(context_id_for(&root_a), context_id_for(&root_a));
        assert_ne!(context_id_for(&root_a), context_id_for(&root_b));
        assert_eq!(context_id_for(&root_a).len(), 12);
    }

    #[test]
    fn test_tag_exists() {
        let (repo, dir) = setup_repo();
        commit_file(&repo, "a.txt", "hello");
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.tag_lightweight("v1.2.0", head.as_object(), false)
            .unwrap();

        assert!(tag_exists(dir.path(), &["1.2.0".into(), "v1.2.0".into()]).unwrap());
        assert!(!tag_exists(dir.path(), &["v9.9.9".into()]).unwrap());
    }

    #[test]
    fn test_list_checkouts_includes_live_worktrees() {
        let (repo, dir) = setup_repo();
        commit_file(&repo, "a.txt", "hello");

        let wt_dir = tempdir().unwrap();
        let wt_path = wt_dir.path().join("wt1");
        repo.worktree("wt1", &wt_path, None).unwrap();

        let live = list_checkouts(dir.path()).unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&dir.path().canonicalize().unwrap()));
        assert!(live.contains(&wt_path.canonicalize().unwrap()));
    }

    #[test]
    fn test_list_checkouts_excludes_removed_worktree() {
        let (repo, dir) = setup_repo();
        commit_file(&repo, "a.txt", "hello");

        let wt_dir = tempdir().unwrap();
        let wt_path = wt_dir.path().join("wt1");
        repo.worktree("wt1", &wt_path, None).unwrap();
        fs::remove_dir_all(&wt_path).unwrap();

        let live = list_checkouts(dir.path()).unwrap();
        assert_eq!(live, vec![dir.path().canonicalize().unwrap()]);
    }
}
