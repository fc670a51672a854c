// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Three-way reconciliation of workspaces.
//!
//! The filesystem (directories under the isolation root), the VCS worktree
//! list and the registry each describe the set of workspaces. The reconciler
//! collects all three into a [`ReconciliationView`], classifies every id, and
//! applies the safe correction for each kind of drift:
//!
//! | Drift | Action |
//! |---|---|
//! | registry only | delete the registry entry and any lock marker |
//! | filesystem + VCS, unregistered | register it; never delete |
//! | filesystem only | remove the directory |
//! | VCS only | `git worktree prune` |
//! | stale lock, no active session | remove worktree, entry and marker if clean |
//! | stale lock with changes | report only |
//!
//! Ids are processed in sorted order so a run is deterministic. The run
//! happens only at explicit triggers. Locks are only inspected, except that a
//! stale marker is reclaimed by the reconciler before its workspace is
//! checked and removed, so no session can take the workspace over midway.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ControlError, LockError, ReconcileError};
use crate::telemetry::TimedOperation;
use crate::vcs::{Vcs, Worktree};

use super::{is_valid_id, LockInfo, LockManager, Registration, Registry, RegistryEntry};

/// Why reconciliation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileTrigger {
    SessionStart,
    PostMerge,
    Manual,
}

impl fmt::Display for ReconcileTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileTrigger::SessionStart => "session-start",
            ReconcileTrigger::PostMerge => "post-merge",
            ReconcileTrigger::Manual => "manual",
        })
    }
}

/// Classification of one workspace id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftKind {
    Consistent,
    /// Registered, but neither on disk nor known to the VCS.
    RegistryOnly,
    /// On disk and known to the VCS, but not registered.
    Untracked,
    /// A directory the VCS does not know about.
    FilesystemOnly,
    /// A worktree whose directory is gone.
    VcsOnly,
    /// Lock past the freshness window and no active session.
    StaleLocked,
    /// Stale-locked, but the worktree has uncommitted or untracked changes.
    StaleWithChanges,
    /// A lock marker for a workspace that exists nowhere else.
    OrphanLock,
}

impl DriftKind {
    pub fn is_drift(self) -> bool {
        self != DriftKind::Consistent
    }
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriftKind::Consistent => "consistent",
            DriftKind::RegistryOnly => "registry-only",
            DriftKind::Untracked => "untracked",
            DriftKind::FilesystemOnly => "filesystem-only",
            DriftKind::VcsOnly => "vcs-only",
            DriftKind::StaleLocked => "stale-locked",
            DriftKind::StaleWithChanges => "stale-with-changes",
            DriftKind::OrphanLock => "orphan-lock",
        })
    }
}

/// A corrective step, taken or (in a dry run) planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ReconcileAction {
    RemoveRegistryEntry { id: String },
    RemoveLock { id: String },
    Register { id: String, branch: String },
    RemoveDirectory { id: String, path: PathBuf },
    PruneWorktrees,
    RemoveWorktree { id: String, path: PathBuf },
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::RemoveRegistryEntry { id } => write!(f, "remove registry entry {id}"),
            ReconcileAction::RemoveLock { id } => write!(f, "remove lock {id}"),
            ReconcileAction::Register { id, branch } => write!(f, "register {id} ({branch})"),
            ReconcileAction::RemoveDirectory { id, .. } => write!(f, "remove directory {id}"),
            ReconcileAction::PruneWorktrees => write!(f, "prune worktrees"),
            ReconcileAction::RemoveWorktree { id, .. } => write!(f, "remove worktree {id}"),
        }
    }
}

/// Classification of one id in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub id: String,
    pub kind: DriftKind,
    /// Whether the corrective actions for this id were applied.
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub trigger: ReconcileTrigger,
    pub dry_run: bool,
    pub drift: Vec<Drift>,
    pub actions_taken: Vec<ReconcileAction>,
}

impl ReconcileReport {
    /// Drift that is still present after this run.
    pub fn unresolved(&self) -> impl Iterator<Item = &Drift> {
        self.drift.iter().filter(|d| d.kind.is_drift() && !d.resolved)
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved().next().is_none()
    }

    /// `DriftDetected` when drift remains.
    pub fn ensure_clean(&self) -> Result<(), ControlError> {
        match self.unresolved().count() {
            0 => Ok(()),
            count => Err(ControlError::DriftDetected { count }),
        }
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drifted = self.drift.iter().filter(|d| d.kind.is_drift()).count();
        writeln!(
            f,
            "reconcile [{}{}]: {} workspace(s), {} drifted, {} unresolved",
            self.trigger,
            if self.dry_run { ", dry run" } else { "" },
            self.drift.len(),
            drifted,
            self.unresolved().count()
        )?;
        for drift in self.drift.iter().filter(|d| d.kind.is_drift()) {
            let status = match (&drift.error, drift.resolved) {
                (Some(error), _) => format!("failed: {error}"),
                (None, true) => "resolved".to_string(),
                (None, false) => "unresolved".to_string(),
            };
            writeln!(f, "  {:<24} {:<20} {}", drift.id, drift.kind.to_string(), status)?;
        }
        let verb = if self.dry_run { "would" } else { "did" };
        for action in &self.actions_taken {
            writeln!(f, "  {verb} {action}")?;
        }
        Ok(())
    }
}

/// The three sources of truth, plus lock and session state, at one instant.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationView {
    /// Directories under the isolation root.
    pub filesystem: BTreeMap<String, PathBuf>,
    /// VCS worktrees whose parent is the isolation root.
    pub vcs: BTreeMap<String, Worktree>,
    pub registry: BTreeMap<String, RegistryEntry>,
    pub locks: BTreeMap<String, LockInfo>,
    /// Workspaces owned by an active session.
    pub active: BTreeSet<String>,
}

impl ReconciliationView {
    /// Every id known to any source, sorted.
    pub fn ids(&self) -> BTreeSet<String> {
        self.filesystem
            .keys()
            .chain(self.vcs.keys())
            .chain(self.registry.keys())
            .chain(self.locks.keys())
            .cloned()
            .collect()
    }

    /// Classify `id` from the view alone.
    pub fn classify(&self, id: &str) -> DriftKind {
        let on_disk = self.filesystem.contains_key(id);
        let in_vcs = self.vcs.get(id).is_some_and(|wt| !wt.prunable);
        let registered = self.registry.contains_key(id);

        match (on_disk, in_vcs, registered) {
            (true, true, true) => {
                let stale = self.locks.get(id).is_some_and(|lock| lock.stale);
                if stale && !self.active.contains(id) {
                    DriftKind::StaleLocked
                } else {
                    DriftKind::Consistent
                }
            }
            (true, true, false) => DriftKind::Untracked,
            (true, false, _) => DriftKind::FilesystemOnly,
            (false, _, _) if self.vcs.contains_key(id) => DriftKind::VcsOnly,
            (false, _, true) => DriftKind::RegistryOnly,
            (false, _, false) => DriftKind::OrphanLock,
        }
    }
}

/// Runs reconciliation over one isolation root.
pub struct Reconciler {
    vcs: Arc<dyn Vcs>,
    registry: Registry,
    locks: LockManager,
    root: PathBuf,
    active: BTreeSet<String>,
}

impl Reconciler {
    pub fn new(vcs: Arc<dyn Vcs>, registry: Registry, locks: LockManager, isolation_root: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            registry,
            locks,
            root: isolation_root.into(),
            active: BTreeSet::new(),
        }
    }

    /// Workspaces owned by active sessions; their stale locks are left alone.
    pub fn with_active_sessions(mut self, workspace_ids: impl IntoIterator<Item = String>) -> Self {
        self.active = workspace_ids.into_iter().collect();
        self
    }

    /// Collect the current view.
    pub async fn view(&self) -> Result<ReconciliationView, ReconcileError> {
        let mut view = ReconciliationView {
            active: self.active.clone(),
            ..ReconciliationView::default()
        };

        match std::fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    if let Some(id) = entry.file_name().to_str().filter(|id| is_valid_id(id)) {
                        view.filesystem.insert(id.to_string(), entry.path());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let canonical_root = self.root.canonicalize().ok();
        for worktree in self.vcs.worktrees().await? {
            let Some(parent) = worktree.path.parent() else {
                continue;
            };
            let under_root = parent == self.root || canonical_root.as_deref() == Some(parent);
            if !under_root {
                continue;
            }
            if let Some(id) = worktree.path.file_name().and_then(|n| n.to_str()).filter(|id| is_valid_id(id)) {
                view.vcs.insert(id.to_string(), worktree.clone());
            }
        }

        for entry in self.registry.list()? {
            view.registry.insert(entry.id.clone(), entry);
        }
        for lock in self.locks.list()? {
            view.locks.insert(lock.id.clone(), lock);
        }
        Ok(view)
    }

    /// Detect drift and, unless `dry_run`, correct what is safe to correct.
    pub async fn reconcile(&self, trigger: ReconcileTrigger, dry_run: bool) -> Result<ReconcileReport, ReconcileError> {
        let _timer = TimedOperation::start("reconcile");
        let view = self.view().await?;

        let mut report = ReconcileReport {
            trigger,
            dry_run,
            drift: Vec::new(),
            actions_taken: Vec::new(),
        };
        let mut prune = false;

        for id in view.ids() {
            let mut kind = view.classify(&id);
            let mut claim = None;
            if kind == DriftKind::StaleLocked {
                (kind, claim) = self.claim_stale(&id, &view, dry_run).await?;
            }
            if kind.is_drift() {
                warn!(workspace = %id, drift = %kind, %trigger, "Workspace drift");
            } else {
                debug!(workspace = %id, "Workspace consistent");
            }

            let actions = plan(&id, kind, &view);
            prune |= actions.contains(&ReconcileAction::PruneWorktrees);
            let per_id: Vec<ReconcileAction> = actions
                .into_iter()
                .filter(|a| *a != ReconcileAction::PruneWorktrees)
                .collect();

            let mut drift = Drift {
                id: id.clone(),
                kind,
                resolved: false,
                error: None,
            };
            if !dry_run && kind.is_drift() && kind != DriftKind::StaleWithChanges {
                match self.apply(&per_id, claim.as_deref()).await {
                    Ok(()) => drift.resolved = true,
                    Err(e) => {
                        warn!(workspace = %id, "Reconcile action failed: {}", e);
                        drift.error = Some(e.to_string());
                        if let Some(claimant) = &claim {
                            if let Err(e) = self.locks.release(&id, claimant) {
                                warn!(workspace = %id, "Could not release reconcile claim: {}", e);
                            }
                        }
                    }
                }
            }
            if drift.error.is_none() {
                report.actions_taken.extend(per_id);
            }
            report.drift.push(drift);
        }

        if prune {
            if !dry_run {
                self.vcs.prune_worktrees().await?;
            }
            report.actions_taken.push(ReconcileAction::PruneWorktrees);
        }

        info!(
            %trigger,
            dry_run,
            workspaces = report.drift.len(),
            actions = report.actions_taken.len(),
            unresolved = report.unresolved().count(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Take over a stale lock, then check the workspace's tree.
    ///
    /// Returns the claimant session when the workspace is clean and held by
    /// the reconciler. A dirty workspace gets its stale marker back. Nothing
    /// is claimed on a dry run.
    async fn claim_stale(
        &self,
        id: &str,
        view: &ReconciliationView,
        dry_run: bool,
    ) -> Result<(DriftKind, Option<String>), ReconcileError> {
        let previous = match self.locks.inspect(id)? {
            Some(lock) if lock.stale => lock,
            _ => return Ok((DriftKind::Consistent, None)),
        };

        let claim = if dry_run {
            None
        } else {
            let claimant = format!("reconcile-{}", uuid::Uuid::new_v4().simple());
            match self.locks.reclaim(id, &claimant) {
                Ok(_) => Some(claimant),
                Err(LockError::Held { holder, .. }) => {
                    debug!(workspace = id, %holder, "Stale lock was taken over; leaving workspace");
                    return Ok((DriftKind::Consistent, None));
                }
                Err(LockError::ReclaimRefused { .. }) => return Ok((DriftKind::Consistent, None)),
                Err(e) => return Err(e.into()),
            }
        };

        let Some(path) = view.filesystem.get(id) else {
            return Ok((DriftKind::StaleLocked, claim));
        };
        let status = self.vcs.status_porcelain(path).await;
        if matches!(&status, Ok(changes) if changes.is_empty()) {
            return Ok((DriftKind::StaleLocked, claim));
        }
        if let Some(claimant) = &claim {
            if let Err(e) = self.locks.hand_back(id, claimant, &previous) {
                warn!(workspace = id, "Could not hand back stale lock: {}", e);
            }
        }
        status?;
        Ok((DriftKind::StaleWithChanges, None))
    }

    /// Apply one id's actions. `claim` is the reconciler's own hold on the lock.
    async fn apply(&self, actions: &[ReconcileAction], claim: Option<&str>) -> Result<(), ReconcileError> {
        for action in actions {
            match action {
                ReconcileAction::RemoveRegistryEntry { id } => {
                    self.registry.remove(id)?;
                }
                ReconcileAction::RemoveLock { id } => match claim {
                    Some(claimant) => self.locks.release(id, claimant)?,
                    None => {
                        self.locks.force_release(id)?;
                    }
                },
                ReconcileAction::Register { id, branch } => {
                    let path = self.root.join(id);
                    self.registry.register(Registration::new(id, path, branch))?;
                }
                ReconcileAction::RemoveDirectory { path, .. } => {
                    remove_dir(path).await?;
                }
                ReconcileAction::RemoveWorktree { path, .. } => {
                    self.vcs.remove_worktree(path).await?;
                }
                ReconcileAction::PruneWorktrees => {
                    self.vcs.prune_worktrees().await?;
                }
            }
            info!(%action, "Reconcile action applied");
        }
        Ok(())
    }
}

/// Corrective actions for one id.
fn plan(id: &str, kind: DriftKind, view: &ReconciliationView) -> Vec<ReconcileAction> {
    let id_owned = || id.to_string();
    let registered = view.registry.contains_key(id);
    let locked = view.locks.contains_key(id);
    let mut actions = Vec::new();

    match kind {
        DriftKind::Consistent | DriftKind::StaleWithChanges => {}
        DriftKind::RegistryOnly => {
            actions.push(ReconcileAction::RemoveRegistryEntry { id: id_owned() });
            if locked {
                actions.push(ReconcileAction::RemoveLock { id: id_owned() });
            }
        }
        DriftKind::Untracked => {
            let branch = view
                .vcs
                .get(id)
                .and_then(|wt| wt.branch.clone())
                .unwrap_or_else(id_owned);
            actions.push(ReconcileAction::Register { id: id_owned(), branch });
        }
        DriftKind::FilesystemOnly => {
            let path = view.filesystem.get(id).cloned().unwrap_or_default();
            actions.push(ReconcileAction::RemoveDirectory { id: id_owned(), path });
            if registered {
                actions.push(ReconcileAction::RemoveRegistryEntry { id: id_owned() });
            }
            if locked {
                actions.push(ReconcileAction::RemoveLock { id: id_owned() });
            }
        }
        DriftKind::VcsOnly => {
            actions.push(ReconcileAction::PruneWorktrees);
            if registered {
                actions.push(ReconcileAction::RemoveRegistryEntry { id: id_owned() });
            }
            if locked {
                actions.push(ReconcileAction::RemoveLock { id: id_owned() });
            }
        }
        DriftKind::StaleLocked => {
            let path = view.filesystem.get(id).cloned().unwrap_or_default();
            actions.push(ReconcileAction::RemoveWorktree { id: id_owned(), path });
            actions.push(ReconcileAction::RemoveRegistryEntry { id: id_owned() });
            actions.push(ReconcileAction::RemoveLock { id: id_owned() });
        }
        DriftKind::OrphanLock => actions.push(ReconcileAction::RemoveLock { id: id_owned() }),
    }
    actions
}

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
