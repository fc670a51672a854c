// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace isolation: one git worktree per branch under the isolation root.
//!
//! # Directory Structure
//!
//! ```text
//! /work/repo/                     # Main repo
//! ├── .git/
//! ├── .gatehouse/                 # registry.json, sessions.json, locks/
//! └── ...
//!
//! /work/repo.worktrees/           # Isolation root
//! ├── feat-auth/                  # Worktree for feat/auth
//! └── fix-bug-123/                # Worktree for fix/bug-123
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::vcs::Vcs;

use super::{is_valid_id, LockManager, LockState, Registration, Registry, Workspace};

/// Sanitize a branch name for use as a directory name.
///
/// Converts slashes and other problematic characters to dashes.
pub fn sanitize_branch_name(branch: &str) -> String {
    let replaced: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    replaced.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Directory a branch's workspace lives in.
pub fn workspace_path(isolation_root: &Path, branch: &str) -> PathBuf {
    isolation_root.join(sanitize_branch_name(branch))
}

/// Creates, finds and removes workspaces, keeping the registry in step.
#[derive(Clone)]
pub struct WorkspaceManager {
    vcs: Arc<dyn Vcs>,
    registry: Registry,
    locks: LockManager,
    root: PathBuf,
    base_branch: String,
}

impl WorkspaceManager {
    /// `base_branch` is the protected branch new workspace branches start from.
    pub fn new(
        vcs: Arc<dyn Vcs>,
        registry: Registry,
        locks: LockManager,
        isolation_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            registry,
            locks,
            root: isolation_root.into(),
            base_branch: base_branch.into(),
        }
    }

    pub fn isolation_root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn id_for(&self, branch: &str) -> Result<String, WorkspaceError> {
        if branch == self.base_branch {
            return Err(WorkspaceError::InvalidBranch(
                branch.to_string(),
                "it is the protected branch".to_string(),
            ));
        }
        let id = sanitize_branch_name(branch);
        if !is_valid_id(&id) {
            return Err(WorkspaceError::InvalidBranch(
                branch.to_string(),
                "no usable directory name".to_string(),
            ));
        }
        Ok(id)
    }

    /// Create a worktree for `branch` and register it.
    pub async fn create(&self, branch: &str, issue: Option<&str>) -> Result<Workspace, WorkspaceError> {
        let id = self.id_for(branch)?;
        let path = self.root.join(&id);

        if self.registry.lookup(&id)?.is_some() || path.exists() {
            return Err(WorkspaceError::AlreadyExists(id));
        }

        tokio::fs::create_dir_all(&self.root).await?;
        info!(workspace = %id, branch, path = %path.display(), "Creating workspace");
        self.vcs.add_worktree(&path, branch, &self.base_branch).await?;

        let mut registration = Registration::new(&id, &path, branch);
        registration.issue = issue.map(str::to_string);
        let entry = self.registry.register(registration)?;
        Ok(Workspace::from_entry(entry, None))
    }

    /// The workspace for `branch`, creating it when absent.
    ///
    /// A worktree that exists on disk and in the VCS but not in the registry
    /// is adopted rather than recreated.
    pub async fn ensure(&self, branch: &str, issue: Option<&str>) -> Result<Workspace, WorkspaceError> {
        let id = self.id_for(branch)?;
        let path = self.root.join(&id);

        if let Some(entry) = self.registry.lookup(&id)? {
            if entry.branch != branch {
                return Err(WorkspaceError::AlreadyExists(id));
            }
            if entry.path.is_dir() {
                let lock = self.locks.inspect(&id)?;
                return Ok(Workspace::from_entry(entry, lock.as_ref()));
            }
            warn!(workspace = %id, "Registered workspace is missing on disk; recreating");
            self.registry.remove(&id)?;
            self.vcs.prune_worktrees().await?;
        } else if path.is_dir() {
            let tracked = self.vcs.worktrees().await?.into_iter().any(|wt| {
                wt.branch.as_deref() == Some(branch) && same_path(&wt.path, &path)
            });
            if !tracked {
                return Err(WorkspaceError::AlreadyExists(id));
            }
            info!(workspace = %id, branch, "Adopting unregistered worktree");
            let mut registration = Registration::new(&id, &path, branch);
            registration.issue = issue.map(str::to_string);
            let entry = self.registry.register(registration)?;
            let lock = self.locks.inspect(&id)?;
            return Ok(Workspace::from_entry(entry, lock.as_ref()));
        }

        self.create(branch, issue).await
    }

    /// Registered workspace `id` with its current lock state.
    pub fn lookup(&self, id: &str) -> Result<Option<Workspace>, WorkspaceError> {
        let Some(entry) = self.registry.lookup(id)? else {
            return Ok(None);
        };
        let lock = self.locks.inspect(id)?;
        Ok(Some(Workspace::from_entry(entry, lock.as_ref())))
    }

    /// All registered workspaces, sorted by id.
    pub fn list(&self) -> Result<Vec<Workspace>, WorkspaceError> {
        self.registry
            .list()?
            .into_iter()
            .map(|entry| {
                let lock = self.locks.inspect(&entry.id)?;
                Ok(Workspace::from_entry(entry, lock.as_ref()))
            })
            .collect()
    }

    /// Workspace whose directory contains `dir`.
    pub fn containing(&self, dir: &Path) -> Result<Option<Workspace>, WorkspaceError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|ws| dir.starts_with(&ws.path)))
    }

    /// Remove a workspace's worktree, registry entry and lock marker.
    ///
    /// Refuses while another session holds a fresh lock or the worktree has
    /// uncommitted changes, unless `force` is set.
    pub async fn remove(&self, id: &str, session: Option<&str>, force: bool) -> Result<(), WorkspaceError> {
        let workspace = self
            .lookup(id)?
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))?;

        if let LockState::Active { holder } = &workspace.lock_state {
            if session != Some(holder.as_str()) && !force {
                return Err(WorkspaceError::Locked {
                    id: id.to_string(),
                    holder: holder.clone(),
                });
            }
        }

        if workspace.path.is_dir() {
            if !force {
                let changes = self.vcs.status_porcelain(&workspace.path).await?;
                if !changes.is_empty() {
                    return Err(WorkspaceError::Dirty {
                        id: id.to_string(),
                        count: changes.len(),
                    });
                }
            }
            self.vcs.remove_worktree(&workspace.path).await?;
        } else {
            debug!(workspace = id, "Worktree directory already gone; pruning");
            self.vcs.prune_worktrees().await?;
        }

        self.registry.remove(id)?;
        self.locks.force_release(id)?;
        info!(workspace = id, "Workspace removed");
        Ok(())
    }
}

/// Paths equal as given or after canonicalization.
pub(crate) fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
