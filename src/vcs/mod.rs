// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Version-control boundary.
//!
//! The control plane needs only a narrow slice of a VCS: content-addressed
//! snapshots, named references outside the branch namespace, an atomic
//! worktree listing, and checkout of an arbitrary tree into a directory.
//! [`Vcs`] captures that slice; [`GitCli`] implements it over the `git`
//! binary.

mod git;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VcsError;

pub use git::GitCli;

/// A worktree as reported by the VCS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
    /// The worktree's directory is missing; `git worktree prune` would drop it.
    pub prunable: bool,
}

/// A reference and the object it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub name: String,
    pub object: String,
    /// Committer timestamp of the referenced commit (unix seconds).
    pub epoch: i64,
    /// First line of the referenced commit's message.
    pub subject: String,
}

/// Kind of change between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    TypeChanged,
}

impl ChangeKind {
    fn from_status(status: &str) -> Option<Self> {
        match status.chars().next()? {
            'A' => Some(Self::Added),
            'M' => Some(Self::Modified),
            'D' => Some(Self::Deleted),
            'T' => Some(Self::TypeChanged),
            _ => None,
        }
    }
}

/// One changed path between two trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// The slice of version control the control plane depends on.
///
/// Repository-wide operations (refs, worktree list) act on the shared
/// repository; `dir` arguments name the worktree an operation applies to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vcs: Send + Sync {
    /// List all worktrees of the repository.
    async fn worktrees(&self) -> Result<Vec<Worktree>, VcsError>;

    /// Add a worktree at `path` on `branch`, creating the branch from `base` if needed.
    async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), VcsError>;

    /// Remove the worktree at `path`.
    async fn remove_worktree(&self, path: &Path) -> Result<(), VcsError>;

    /// Drop administrative entries for worktrees whose directory is gone.
    async fn prune_worktrees(&self) -> Result<(), VcsError>;

    /// Branch checked out in `dir`, or `None` when detached.
    async fn current_branch(&self, dir: &Path) -> Result<Option<String>, VcsError>;

    /// Commit id of HEAD in `dir`, or `None` for an unborn branch.
    async fn head(&self, dir: &Path) -> Result<Option<String>, VcsError>;

    /// Porcelain status lines for `dir`, untracked files included.
    async fn status_porcelain(&self, dir: &Path) -> Result<Vec<String>, VcsError>;

    /// Snapshot the full working tree of `dir` into a commit object.
    ///
    /// Must not touch HEAD, any branch, or the worktree's real index.
    async fn snapshot_tree(&self, dir: &Path, message: &str) -> Result<String, VcsError>;

    /// Create `name` pointing at `object`; fails if `name` already exists.
    async fn create_ref(&self, name: &str, object: &str) -> Result<(), VcsError>;

    /// Delete reference `name`.
    async fn delete_ref(&self, name: &str) -> Result<(), VcsError>;

    /// Resolve `name` to an object id, `None` if it doesn't exist.
    async fn resolve_ref(&self, name: &str) -> Result<Option<String>, VcsError>;

    /// List references under `prefix`.
    async fn list_refs(&self, prefix: &str) -> Result<Vec<RefEntry>, VcsError>;

    /// Paths that differ between commits `from` and `to`.
    async fn diff_trees(&self, from: &str, to: &str) -> Result<Vec<FileChange>, VcsError>;

    /// Write the tree of `object` into `dir`, then delete `remove` (relative paths).
    ///
    /// Must not move HEAD or any branch.
    async fn checkout_tree(&self, dir: &Path, object: &str, remove: &[PathBuf]) -> Result<(), VcsError>;
}

/// Root of the main repository containing `start`.
///
/// From inside a linked worktree this is the repository the worktree
/// belongs to, found through the `gitdir:` pointer in its `.git` file.
pub fn discover_repo_root(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let dot_git = dir.join(".git");
        if dot_git.is_dir() {
            return Some(dir.to_path_buf());
        }
        if dot_git.is_file() {
            let content = std::fs::read_to_string(&dot_git).ok()?;
            let gitdir = content.lines().find_map(|l| l.strip_prefix("gitdir:"))?.trim();
            let gitdir = dir.join(gitdir);
            // <repo>/.git/worktrees/<name>
            let main = gitdir
                .ancestors()
                .find(|p| p.file_name() == Some(OsStr::new(".git")))
                .and_then(Path::parent)
                .map(Path::to_path_buf);
            return main.or_else(|| Some(dir.to_path_buf()));
        }
    }
    None
}
