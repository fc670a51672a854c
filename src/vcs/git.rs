// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! [`Vcs`] implementation that shells out to `git`.
//!
//! Snapshots and restores go through a throwaway index file
//! (`GIT_INDEX_FILE`), so neither the worktree's real index nor any branch
//! pointer changes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use super::{ChangeKind, FileChange, RefEntry, Vcs, Worktree};
use crate::error::VcsError;

/// Identity used for checkpoint commits; they never land on a branch.
const SNAPSHOT_IDENTITY: (&str, &str) = ("gatehouse", "gatehouse@localhost");

/// Git command-line adapter rooted at one repository.
#[derive(Debug, Clone)]
pub struct GitCli {
    /// Path to the main repository root.
    repo_root: PathBuf,
    /// Git executable.
    binary: String,
}

impl GitCli {
    /// Create an adapter for the repository at `repo_root`.
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            binary: "git".to_string(),
        }
    }

    /// Use a different git executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Repository root this adapter operates on.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run a git command in `dir` and return trimmed stdout.
    async fn git_in(
        &self,
        dir: &Path,
        args: &[&str],
        env: &[(&str, OsString)],
    ) -> Result<String, VcsError> {
        trace!(?args, dir = %dir.display(), "git");
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg("core.quotepath=off")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd.output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(VcsError::command(args.first().copied().unwrap_or("git"), stderr))
        }
    }

    /// Run a git command at the repository root.
    async fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        self.git_in(&self.repo_root, args, &[]).await
    }

    /// Environment for commands that operate on a private index file.
    fn private_index_env(index: &Path) -> Vec<(&'static str, OsString)> {
        let (name, email) = SNAPSHOT_IDENTITY;
        vec![
            ("GIT_INDEX_FILE", index.as_os_str().to_os_string()),
            ("GIT_AUTHOR_NAME", name.into()),
            ("GIT_AUTHOR_EMAIL", email.into()),
            ("GIT_COMMITTER_NAME", name.into()),
            ("GIT_COMMITTER_EMAIL", email.into()),
        ]
    }
}

/// Parse `git worktree list --porcelain` output.
pub(crate) fn parse_worktree_list(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut current = Worktree::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                worktrees.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        } else if line.starts_with("prunable") {
            current.prunable = true;
        }
    }

    if !current.path.as_os_str().is_empty() {
        worktrees.push(current);
    }

    worktrees
}

/// Parse `git diff --name-status` output.
pub(crate) fn parse_name_status(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter_map(|line| {
            let (status, path) = line.split_once('\t')?;
            Some(FileChange {
                kind: ChangeKind::from_status(status)?,
                path: PathBuf::from(path),
            })
        })
        .collect()
}

/// Parse tab-separated `for-each-ref` output.
pub(crate) fn parse_ref_list(output: &str) -> Vec<RefEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(4, '\t');
            let name = fields.next()?.to_string();
            let object = fields.next()?.to_string();
            let epoch = fields.next()?.parse().unwrap_or(0);
            let subject = fields.next().unwrap_or("").to_string();
            Some(RefEntry {
                name,
                object,
                epoch,
                subject,
            })
        })
        .collect()
}

#[async_trait]
impl Vcs for GitCli {
    async fn worktrees(&self) -> Result<Vec<Worktree>, VcsError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().to_string();
        let exists = self
            .git(&["rev-parse", "--verify", "-q", &format!("refs/heads/{branch}")])
            .await
            .is_ok();

        if exists {
            self.git(&["worktree", "add", &path_str, branch]).await?;
        } else {
            self.git(&["worktree", "add", "-b", branch, &path_str, base]).await?;
        }
        debug!(branch, path = %path.display(), "Worktree added");
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), VcsError> {
        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self.git(&["worktree", "remove", "--force", &path_str]).await {
            warn!("git worktree remove failed, falling back to manual removal: {}", e);
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            self.prune_worktrees().await?;
        }
        Ok(())
    }

    async fn prune_worktrees(&self) -> Result<(), VcsError> {
        self.git(&["worktree", "prune"]).await.map(|_| ())
    }

    async fn current_branch(&self, dir: &Path) -> Result<Option<String>, VcsError> {
        let branch = self.git_in(dir, &["branch", "--show-current"], &[]).await?;
        Ok(if branch.is_empty() { None } else { Some(branch) })
    }

    async fn head(&self, dir: &Path) -> Result<Option<String>, VcsError> {
        match self.git_in(dir, &["rev-parse", "--verify", "-q", "HEAD"], &[]).await {
            Ok(id) => Ok(Some(id)),
            Err(VcsError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn status_porcelain(&self, dir: &Path) -> Result<Vec<String>, VcsError> {
        let output = self
            .git_in(dir, &["status", "--porcelain=v1", "--untracked-files=all"], &[])
            .await?;
        Ok(output.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    async fn snapshot_tree(&self, dir: &Path, message: &str) -> Result<String, VcsError> {
        let scratch = tempfile::tempdir()?;
        let env = Self::private_index_env(&scratch.path().join("index"));
        let head = self.head(dir).await?;

        // Seeding from HEAD lets `add -A` hash only what changed.
        if head.is_some() {
            self.git_in(dir, &["read-tree", "HEAD"], &env).await?;
        }
        self.git_in(dir, &["add", "-A", "--", "."], &env).await?;
        let tree = self.git_in(dir, &["write-tree"], &env).await?;

        let mut args = vec!["commit-tree", tree.as_str(), "-m", message];
        if let Some(ref parent) = head {
            args.push("-p");
            args.push(parent);
        }
        let commit = self.git_in(dir, &args, &env).await?;
        if commit.is_empty() {
            return Err(VcsError::Parse("commit-tree returned no object id".to_string()));
        }
        Ok(commit)
    }

    async fn create_ref(&self, name: &str, object: &str) -> Result<(), VcsError> {
        // An empty old-value makes update-ref refuse to clobber an existing ref.
        self.git(&["update-ref", "--no-deref", name, object, ""])
            .await
            .map(|_| ())
    }

    async fn delete_ref(&self, name: &str) -> Result<(), VcsError> {
        self.git(&["update-ref", "-d", name]).await.map(|_| ())
    }

    async fn resolve_ref(&self, name: &str) -> Result<Option<String>, VcsError> {
        match self.git(&["rev-parse", "--verify", "-q", name]).await {
            Ok(id) => Ok(Some(id)),
            Err(VcsError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<RefEntry>, VcsError> {
        let output = self
            .git(&[
                "for-each-ref",
                "--format=%(refname)%09%(objectname)%09%(committerdate:unix)%09%(contents:subject)",
                prefix,
            ])
            .await?;
        Ok(parse_ref_list(&output))
    }

    async fn diff_trees(&self, from: &str, to: &str) -> Result<Vec<FileChange>, VcsError> {
        let output = self
            .git(&["diff", "--name-status", "--no-renames", from, to])
            .await?;
        Ok(parse_name_status(&output))
    }

    async fn checkout_tree(&self, dir: &Path, object: &str, remove: &[PathBuf]) -> Result<(), VcsError> {
        let scratch = tempfile::tempdir()?;
        let env = Self::private_index_env(&scratch.path().join("index"));

        self.git_in(dir, &["read-tree", object], &env).await?;
        self.git_in(dir, &["checkout-index", "--all", "--force"], &env).await?;

        for relative in remove {
            let path = dir.join(relative);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => remove_empty_parents(dir, &path).await,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Remove now-empty directories between `path` and `root`.
async fn remove_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // remove_dir fails on non-empty directories, which ends the walk.
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}
