// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session lifecycle: start, heartbeat, writes, end, post-merge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager, RestoreOutcome};
use crate::config::ResolvedConfig;
use crate::error::{LockError, RegistryError, SessionError, WorkspaceError};
use crate::telemetry::TimedOperation;
use crate::vcs::{GitCli, Vcs};
use crate::workspace::{
    sanitize_branch_name, Acquired, LockManager, LockState, ReconcileReport, ReconcileTrigger,
    Reconciler, Registry, Workspace, WorkspaceManager,
};

use super::storage::SessionStorage;
use super::types::Session;

/// Lock marker directory inside the state directory.
pub const LOCKS_DIR: &str = "locks";

/// Ended sessions kept in the store after a merge.
const ENDED_SESSIONS_KEPT: usize = 50;

/// Result of [`SessionService::start`].
#[derive(Debug)]
pub struct SessionStart {
    pub session: Session,
    pub workspace: Workspace,
    pub acquired: Acquired,
    pub reconcile: ReconcileReport,
}

/// Result of [`SessionService::complete_merge`].
#[derive(Debug)]
pub struct MergeOutcome {
    pub workspace_id: String,
    /// Sessions ended because their branch was merged.
    pub ended: Vec<String>,
    /// Checkpoint refs deleted.
    pub pruned: usize,
    pub removed: bool,
    pub reconcile: ReconcileReport,
}

/// Wires workspaces, locks, checkpoints and the session store together.
#[derive(Clone)]
pub struct SessionService {
    vcs: Arc<dyn Vcs>,
    workspaces: WorkspaceManager,
    storage: SessionStorage,
    checkpoints: CheckpointManager,
}

impl SessionService {
    /// Service for the repository at `repo_root`, driving the `git` binary.
    pub fn open(repo_root: &Path, config: &ResolvedConfig) -> Self {
        let vcs: Arc<dyn Vcs> = Arc::new(GitCli::new(repo_root).with_binary(config.git_binary.clone()));
        Self::with_vcs(vcs, repo_root, config)
    }

    /// Service over an explicit [`Vcs`].
    pub fn with_vcs(vcs: Arc<dyn Vcs>, repo_root: &Path, config: &ResolvedConfig) -> Self {
        let state_dir = config.state_dir_in(repo_root);
        let workspaces = WorkspaceManager::new(
            Arc::clone(&vcs),
            Registry::open(&state_dir),
            LockManager::new(state_dir.join(LOCKS_DIR), config.stale_after()),
            config.isolation_root_in(repo_root),
            config.protected_branch.clone(),
        );
        Self {
            checkpoints: CheckpointManager::new(Arc::clone(&vcs), config.checkpoint_every),
            storage: SessionStorage::open(&state_dir),
            workspaces,
            vcs,
        }
    }

    pub fn vcs(&self) -> &Arc<dyn Vcs> {
        &self.vcs
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Reconciler that leaves workspaces of active sessions alone.
    pub fn reconciler(&self) -> Result<Reconciler, SessionError> {
        Ok(Reconciler::new(
            Arc::clone(&self.vcs),
            self.workspaces.registry().clone(),
            self.workspaces.locks().clone(),
            self.workspaces.isolation_root(),
        )
        .with_active_sessions(self.storage.active_workspaces()?))
    }

    pub async fn reconcile(&self, trigger: ReconcileTrigger, dry_run: bool) -> Result<ReconcileReport, SessionError> {
        Ok(self.reconciler()?.reconcile(trigger, dry_run).await?)
    }

    /// Start a session on `branch`.
    ///
    /// Reconciles first, then creates or reuses the branch's workspace, takes
    /// its lock (reclaiming a stale one if the worktree still exists) and
    /// records the session with a fresh checkpoint counter.
    pub async fn start(&self, branch: &str, issue: Option<&str>) -> Result<SessionStart, SessionError> {
        let _timer = TimedOperation::start("session.start");
        let reconcile = self.reconcile(ReconcileTrigger::SessionStart, false).await?;
        let workspace = self.workspaces.ensure(branch, issue).await?;

        if let Some(previous) = self.storage.active_for(&workspace.id)? {
            match &workspace.lock_state {
                LockState::Active { holder } if *holder == previous.id => {
                    return Err(SessionError::AlreadyActive(workspace.id));
                }
                _ => {
                    warn!(workspace = %workspace.id, session = %previous.id, "Ending abandoned session");
                    self.storage.modify(&previous.id, |s| {
                        s.ended_at = Some(Utc::now());
                        Ok(())
                    })?;
                }
            }
        }

        let session = Session::new(
            Session::generate_id(),
            &workspace.id,
            &workspace.branch,
            &workspace.path,
        );
        let acquired = self
            .workspaces
            .locks()
            .acquire_validated(self.vcs.as_ref(), &workspace.id, &session.id, &workspace.path)
            .await?;

        if let Err(e) = self.storage.create(&session) {
            if let Err(release) = self.workspaces.locks().release(&workspace.id, &session.id) {
                warn!(workspace = %workspace.id, "Could not release lock after failed start: {}", release);
            }
            return Err(e);
        }
        let entry = self
            .workspaces
            .registry()
            .set_session(&workspace.id, Some(&session.id))?;
        let lock = self.workspaces.locks().inspect(&workspace.id)?;

        info!(
            session = %session.id,
            workspace = %workspace.id,
            branch = %session.branch,
            ?acquired,
            "Session started"
        );
        Ok(SessionStart {
            workspace: Workspace::from_entry(entry, lock.as_ref()),
            session,
            acquired,
            reconcile,
        })
    }

    /// The stored session `id`, which must still be active.
    pub fn active(&self, id: &str) -> Result<Session, SessionError> {
        let session = self
            .storage
            .get(id)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if !session.is_active() {
            return Err(SessionError::Ended(id.to_string()));
        }
        Ok(session)
    }

    /// Refresh the session's lock.
    pub fn heartbeat(&self, id: &str) -> Result<(), SessionError> {
        let session = self.active(id)?;
        self.workspaces.locks().heartbeat(&session.workspace_id, id)?;
        debug!(session = id, workspace = %session.workspace_id, "Heartbeat");
        Ok(())
    }

    /// Account for a write to `file` (relative to the worktree), checkpointing
    /// when the cadence calls for it.
    pub async fn record_write(&self, id: &str, file: &Path) -> Result<Option<Checkpoint>, SessionError> {
        let mut session = self.active(id)?;
        let relative = relative_to(&session.path, file);
        let checkpoint = self.checkpoints.record_write(&mut session, &relative).await?;
        self.persist_counters(&session)?;
        Ok(checkpoint)
    }

    /// Take a checkpoint now.
    pub async fn checkpoint(&self, id: &str, file: Option<&Path>) -> Result<Checkpoint, SessionError> {
        let mut session = self.active(id)?;
        let relative = file.map(|f| relative_to(&session.path, f));
        let checkpoint = self
            .checkpoints
            .checkpoint(&mut session, relative.as_deref())
            .await?;
        self.persist_counters(&session)?;
        Ok(checkpoint)
    }

    /// Restore a checkpoint of the session's branch into its worktree.
    pub async fn restore(
        &self,
        id: &str,
        sequence: u64,
        epoch: Option<i64>,
        confirmed: bool,
    ) -> Result<RestoreOutcome, SessionError> {
        let session = self.active(id)?;
        Ok(self
            .checkpoints
            .restore(&session.path, &session.branch, sequence, epoch, confirmed)
            .await?)
    }

    fn persist_counters(&self, session: &Session) -> Result<(), SessionError> {
        self.storage.modify(&session.id, |stored| {
            stored.checkpoint_counter = session.checkpoint_counter;
            stored.writes_since_checkpoint = session.writes_since_checkpoint;
            stored.touched_files = session.touched_files.clone();
            Ok(())
        })
    }

    /// End session `id` and release its lock.
    pub fn end(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.storage.modify(id, |s| {
            s.ended_at = Some(Utc::now());
            Ok(s.clone())
        })?;
        self.release_workspace(&session)?;
        info!(session = id, workspace = %session.workspace_id, "Session ended");
        Ok(session)
    }

    fn release_workspace(&self, session: &Session) -> Result<(), SessionError> {
        match self.workspaces.locks().release(&session.workspace_id, &session.id) {
            Ok(()) => {}
            Err(LockError::NotHeld { .. }) => {
                warn!(session = %session.id, workspace = %session.workspace_id, "Lock already taken by another session");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        match self.workspaces.registry().set_session(&session.workspace_id, None) {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clean up after `branch` has been merged.
    ///
    /// Ends the branch's sessions, deletes its checkpoint refs, removes its
    /// workspace and reconciles. A worktree with uncommitted changes is left
    /// in place for the reconciler to report.
    pub async fn complete_merge(&self, branch: &str) -> Result<MergeOutcome, SessionError> {
        let workspace_id = sanitize_branch_name(branch);
        let mut ended = Vec::new();
        for session in self.storage.list()? {
            if session.is_active() && session.workspace_id == workspace_id {
                ended.push(self.end(&session.id)?.id);
            }
        }

        let pruned = self.checkpoints.prune(branch).await?;

        let removed = match self.workspaces.remove(&workspace_id, None, false).await {
            Ok(()) => true,
            Err(WorkspaceError::NotFound(_)) => false,
            Err(e @ (WorkspaceError::Dirty { .. } | WorkspaceError::Locked { .. })) => {
                warn!(workspace = %workspace_id, "Merged workspace kept: {}", e);
                false
            }
            Err(e) => return Err(e.into()),
        };

        let reconcile = self.reconcile(ReconcileTrigger::PostMerge, false).await?;
        self.storage.prune_ended(ENDED_SESSIONS_KEPT)?;

        info!(%branch, workspace = %workspace_id, pruned, removed, "Merge cleanup finished");
        Ok(MergeOutcome {
            workspace_id,
            ended,
            pruned,
            removed,
            reconcile,
        })
    }
}

/// `file` relative to `root` when it lies inside it.
fn relative_to(root: &Path, file: &Path) -> PathBuf {
    file.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file.to_path_buf())
}
