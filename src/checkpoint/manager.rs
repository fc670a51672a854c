// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Checkpoint creation, listing, restore and pruning.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{CheckpointError, VcsError};
use crate::session::Session;
use crate::telemetry::TimedOperation;
use crate::vcs::Vcs;

use super::{
    branch_prefix, checkpoint_message, checkpoint_ref, parse_checkpoint_ref, safety_ref,
    target_from_message, Checkpoint, DiffSummary, RestoreOutcome, RestorePlan, SAFETY_COMPONENT,
};

fn snapshot_failure(err: VcsError) -> CheckpointError {
    CheckpointError::Snapshot(err.to_string())
}

/// Takes and restores checkpoints through a [`Vcs`].
#[derive(Clone)]
pub struct CheckpointManager {
    vcs: Arc<dyn Vcs>,
    every: u32,
}

impl CheckpointManager {
    /// Manager that auto-checkpoints every `every` writes (minimum 1).
    pub fn new(vcs: Arc<dyn Vcs>, every: u32) -> Self {
        Self {
            vcs,
            every: every.max(1),
        }
    }

    pub fn every(&self) -> u32 {
        self.every
    }

    /// Snapshot the session's worktree as its next checkpoint.
    ///
    /// The session counter advances only once the ref exists; on failure no
    /// ref is left behind and the session is unchanged.
    pub async fn checkpoint(
        &self,
        session: &mut Session,
        changed_file: Option<&Path>,
    ) -> Result<Checkpoint, CheckpointError> {
        let _timer = TimedOperation::start("checkpoint.create");
        let sequence = session.next_sequence();
        let message = checkpoint_message(&session.branch, sequence, changed_file);

        let object = self
            .vcs
            .snapshot_tree(&session.path, &message)
            .await
            .map_err(snapshot_failure)?;
        let reference = checkpoint_ref(&session.branch, session.epoch, sequence);
        self.vcs
            .create_ref(&reference, &object)
            .await
            .map_err(snapshot_failure)?;

        match self.vcs.resolve_ref(&reference).await {
            Ok(Some(id)) if id == object => {}
            Ok(Some(id)) => {
                return Err(CheckpointError::Snapshot(format!(
                    "{reference} points at {id}, expected {object}"
                )));
            }
            Ok(None) => {
                return Err(CheckpointError::Snapshot(format!("{reference} vanished after creation")));
            }
            Err(e) => {
                if let Err(cleanup) = self.vcs.delete_ref(&reference).await {
                    warn!(%reference, "Could not remove unverified checkpoint ref: {}", cleanup);
                }
                return Err(snapshot_failure(e));
            }
        }

        session.checkpoint_counter = sequence;
        session.writes_since_checkpoint = 0;
        if let Some(file) = changed_file {
            session.touched_files.insert(file.to_path_buf());
        }

        info!(branch = %session.branch, sequence, object = %object, "Checkpoint created");
        Ok(Checkpoint {
            branch: session.branch.clone(),
            sequence,
            epoch: session.epoch,
            target_file: changed_file.map(Path::to_path_buf),
            object_id: object,
            reference,
            created_at: Utc::now().timestamp(),
        })
    }

    /// Account for a write to `file`, checkpointing when the cadence calls for it.
    ///
    /// Call before the write lands so the checkpoint holds the prior state.
    /// Fires on the first write to a file this session and on every Nth write
    /// since the last checkpoint.
    pub async fn record_write(
        &self,
        session: &mut Session,
        file: &Path,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let first_touch = !session.touched_files.contains(file);
        let writes = session.writes_since_checkpoint.saturating_add(1);

        if first_touch || writes >= self.every {
            debug!(file = %file.display(), first_touch, writes, "Write triggers checkpoint");
            return self.checkpoint(session, Some(file)).await.map(Some);
        }

        session.writes_since_checkpoint = writes;
        Ok(None)
    }

    /// Checkpoints of `branch`, ordered by session epoch then sequence.
    pub async fn list(&self, branch: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let refs = self.vcs.list_refs(&branch_prefix(branch)).await?;
        let mut checkpoints: Vec<Checkpoint> = refs
            .into_iter()
            .filter_map(|entry| {
                let (epoch, sequence) = parse_checkpoint_ref(branch, &entry.name)?;
                Some(Checkpoint {
                    branch: branch.to_string(),
                    sequence,
                    epoch,
                    target_file: target_from_message(&entry.subject),
                    object_id: entry.object,
                    reference: entry.name,
                    created_at: entry.epoch,
                })
            })
            .collect();
        checkpoints.sort_by_key(|c| (c.epoch, c.sequence));
        Ok(checkpoints)
    }

    /// Checkpoint `sequence` of `branch`. Without `epoch`, the most recent
    /// session that has that sequence wins.
    pub async fn find(
        &self,
        branch: &str,
        sequence: u64,
        epoch: Option<i64>,
    ) -> Result<Checkpoint, CheckpointError> {
        self.list(branch)
            .await?
            .into_iter()
            .rev()
            .find(|c| c.sequence == sequence && epoch.is_none_or(|e| e == c.epoch))
            .ok_or_else(|| CheckpointError::NotFound {
                branch: branch.to_string(),
                sequence,
            })
    }

    /// Compute what restoring checkpoint `sequence` into `dir` would change.
    pub async fn plan_restore(
        &self,
        dir: &Path,
        branch: &str,
        sequence: u64,
        epoch: Option<i64>,
    ) -> Result<RestorePlan, CheckpointError> {
        let target = self.find(branch, sequence, epoch).await?;
        let current_object = self
            .vcs
            .snapshot_tree(dir, &format!("restore probe {branch}"))
            .await
            .map_err(snapshot_failure)?;
        let diff = DiffSummary::from_changes(
            self.vcs.diff_trees(&current_object, &target.object_id).await?,
        );
        let destroys_uncommitted = !diff.is_empty()
            && self.holds_uncaptured_changes(dir, branch, &current_object).await?;

        Ok(RestorePlan {
            target,
            diff,
            destroys_uncommitted,
            current_object,
        })
    }

    /// Whether the tree snapshotted as `current` differs from HEAD and from every checkpoint.
    async fn holds_uncaptured_changes(
        &self,
        dir: &Path,
        branch: &str,
        current: &str,
    ) -> Result<bool, CheckpointError> {
        if self.vcs.status_porcelain(dir).await?.is_empty() {
            return Ok(false);
        }
        for checkpoint in self.list(branch).await?.iter().rev() {
            if self.vcs.diff_trees(current, &checkpoint.object_id).await?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Restore checkpoint `sequence` into `dir`.
    ///
    /// Returns [`RestoreOutcome::ConfirmationRequired`] without touching
    /// anything when uncaptured work would be lost and `confirmed` is false.
    /// Otherwise the current state is saved under a safety ref first, then
    /// the target tree is written out and files absent from it are deleted.
    pub async fn restore(
        &self,
        dir: &Path,
        branch: &str,
        sequence: u64,
        epoch: Option<i64>,
        confirmed: bool,
    ) -> Result<RestoreOutcome, CheckpointError> {
        let plan = self.plan_restore(dir, branch, sequence, epoch).await?;
        if plan.destroys_uncommitted && !confirmed {
            info!(%branch, sequence, changes = plan.diff.len(), "Restore needs confirmation");
            return Ok(RestoreOutcome::ConfirmationRequired { plan });
        }
        if plan.diff.is_empty() {
            debug!(%branch, sequence, "Tree already matches checkpoint");
            return Ok(RestoreOutcome::Restored { plan, safety_ref: None });
        }

        let stamp = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let safety = safety_ref(branch, &stamp);
        self.vcs
            .create_ref(&safety, &plan.current_object)
            .await
            .map_err(snapshot_failure)?;

        self.vcs
            .checkout_tree(dir, &plan.target.object_id, &plan.diff.deleted)
            .await?;

        info!(
            %branch,
            sequence,
            diff = %plan.diff,
            safety = %safety,
            "Checkpoint restored"
        );
        Ok(RestoreOutcome::Restored {
            plan,
            safety_ref: Some(safety),
        })
    }

    /// Delete every checkpoint and safety ref of `branch`. Returns how many were removed.
    pub async fn prune(&self, branch: &str) -> Result<usize, CheckpointError> {
        let prefix = branch_prefix(branch);
        let safety_prefix = format!("{prefix}{SAFETY_COMPONENT}/");
        let mut removed = 0;
        for entry in self.vcs.list_refs(&prefix).await? {
            let owned = parse_checkpoint_ref(branch, &entry.name).is_some()
                || entry
                    .name
                    .strip_prefix(&safety_prefix)
                    .is_some_and(|stamp| !stamp.is_empty() && !stamp.contains('/'));
            if !owned {
                continue;
            }
            self.vcs.delete_ref(&entry.name).await?;
            removed += 1;
        }
        info!(%branch, removed, "Checkpoints pruned");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::{ChangeKind, FileChange, MockVcs, RefEntry};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::path::PathBuf;

    fn session() -> Session {
        let mut session = Session::new("s1".to_string(), "feat-auth", "feat/auth", "/w/feat-auth");
        session.epoch = 1000;
        session
    }

    fn entry(name: &str, object: &str, subject: &str) -> RefEntry {
        RefEntry {
            name: name.to_string(),
            object: object.to_string(),
            epoch: 1_700_000_000,
            subject: subject.to_string(),
        }
    }

    /// A VCS that snapshots to `object` and keeps every ref it is asked to create.
    fn snapshotting(object: &'static str) -> MockVcs {
        let mut vcs = MockVcs::new();
        vcs.expect_snapshot_tree()
            .returning(move |_, _| Ok(object.to_string()));
        vcs.expect_create_ref().returning(|_, _| Ok(()));
        vcs.expect_resolve_ref()
            .returning(move |_| Ok(Some(object.to_string())));
        vcs
    }

    #[tokio::test]
    async fn test_checkpoint_advances_counter() {
        let manager = CheckpointManager::new(Arc::new(snapshotting("abc")), 5);
        let mut session = session();
        session.writes_since_checkpoint = 3;

        let cp = manager
            .checkpoint(&mut session, Some(Path::new("src/lib.rs")))
            .await
            .unwrap();
        assert_eq!(cp.sequence, 1);
        assert_eq!(cp.reference, "refs/checkpoints/feat/auth/1000/1");
        assert_eq!(cp.object_id, "abc");
        assert_eq!(session.checkpoint_counter, 1);
        assert_eq!(session.writes_since_checkpoint, 0);
        assert!(session.touched_files.contains(Path::new("src/lib.rs")));

        let cp = manager.checkpoint(&mut session, None).await.unwrap();
        assert_eq!(cp.sequence, 2);
    }

    #[tokio::test]
    async fn test_snapshot_failure_leaves_no_ref() {
        let mut vcs = MockVcs::new();
        vcs.expect_snapshot_tree()
            .returning(|_, _| Err(VcsError::command("git write-tree", "index locked")));
        vcs.expect_create_ref().never();
        let manager = CheckpointManager::new(Arc::new(vcs), 5);
        let mut session = session();

        let err = manager.checkpoint(&mut session, None).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Snapshot(_)));
        assert_eq!(session.checkpoint_counter, 0);
    }

    #[tokio::test]
    async fn test_ref_failure_keeps_counter() {
        let mut vcs = MockVcs::new();
        vcs.expect_snapshot_tree().returning(|_, _| Ok("abc".to_string()));
        vcs.expect_create_ref()
            .returning(|_, _| Err(VcsError::command("git update-ref", "reference already exists")));
        let manager = CheckpointManager::new(Arc::new(vcs), 5);
        let mut session = session();

        assert!(manager.checkpoint(&mut session, None).await.is_err());
        assert_eq!(session.checkpoint_counter, 0);
        assert_eq!(session.next_sequence(), 1);
    }

    #[tokio::test]
    async fn test_unverifiable_ref_is_removed() {
        let mut vcs = MockVcs::new();
        vcs.expect_snapshot_tree().returning(|_, _| Ok("abc".to_string()));
        vcs.expect_create_ref().returning(|_, _| Ok(()));
        vcs.expect_resolve_ref()
            .returning(|_| Err(VcsError::Parse("garbled".to_string())));
        vcs.expect_delete_ref()
            .with(eq("refs/checkpoints/feat/auth/1000/1"))
            .times(1)
            .returning(|_| Ok(()));
        let manager = CheckpointManager::new(Arc::new(vcs), 5);

        let mut session = session();
        assert!(manager.checkpoint(&mut session, None).await.is_err());
        assert_eq!(session.checkpoint_counter, 0);
    }

    #[tokio::test]
    async fn test_record_write_cadence() {
        let manager = CheckpointManager::new(Arc::new(snapshotting("abc")), 3);
        let mut session = session();
        let a = Path::new("a.rs");
        let b = Path::new("b.rs");

        // First touch of a file fires.
        assert!(manager.record_write(&mut session, a).await.unwrap().is_some());
        assert!(manager.record_write(&mut session, a).await.unwrap().is_none());
        assert!(manager.record_write(&mut session, a).await.unwrap().is_none());
        // Third write since the last checkpoint fires.
        let cp = manager.record_write(&mut session, a).await.unwrap().unwrap();
        assert_eq!(cp.sequence, 2);
        // A new file fires regardless of the count.
        assert!(manager.record_write(&mut session, a).await.unwrap().is_none());
        let cp = manager.record_write(&mut session, b).await.unwrap().unwrap();
        assert_eq!(cp.sequence, 3);
        assert_eq!(cp.target_file.as_deref(), Some(b));
    }

    #[tokio::test]
    async fn test_list_orders_and_filters() {
        let mut vcs = MockVcs::new();
        vcs.expect_list_refs()
            .with(eq("refs/checkpoints/feat/"))
            .returning(|_| {
                Ok(vec![
                    entry("refs/checkpoints/feat/2000/1", "o3", "checkpoint feat#1"),
                    entry("refs/checkpoints/feat/1000/2", "o2", "checkpoint feat#2: b.rs"),
                    entry("refs/checkpoints/feat/safety/x", "o9", "restore probe feat"),
                    entry("refs/checkpoints/feat/auth/1000/1", "o8", "checkpoint feat/auth#1"),
                    entry("refs/checkpoints/feat/1000/1", "o1", "checkpoint feat#1: a.rs"),
                ])
            });
        let manager = CheckpointManager::new(Arc::new(vcs), 5);

        let list = manager.list("feat").await.unwrap();
        let order: Vec<_> = list.iter().map(|c| (c.epoch, c.sequence, c.object_id.as_str())).collect();
        assert_eq!(order, vec![(1000, 1, "o1"), (1000, 2, "o2"), (2000, 1, "o3")]);
        assert_eq!(list[1].target_file, Some(PathBuf::from("b.rs")));

        let latest = manager.find("feat", 1, None).await.unwrap();
        assert_eq!(latest.object_id, "o3");
        let older = manager.find("feat", 1, Some(1000)).await.unwrap();
        assert_eq!(older.object_id, "o1");
        assert!(matches!(
            manager.find("feat", 7, None).await,
            Err(CheckpointError::NotFound { sequence: 7, .. })
        ));
    }

    fn restorable(dirty: bool) -> MockVcs {
        let mut vcs = MockVcs::new();
        vcs.expect_list_refs().returning(|_| {
            Ok(vec![entry("refs/checkpoints/main/1000/1", "target", "checkpoint main#1")])
        });
        vcs.expect_snapshot_tree()
            .returning(|_, _| Ok("current".to_string()));
        vcs.expect_diff_trees().returning(|_, _| {
            Ok(vec![
                FileChange { kind: ChangeKind::Modified, path: "a.txt".into() },
                FileChange { kind: ChangeKind::Deleted, path: "new.txt".into() },
            ])
        });
        vcs.expect_status_porcelain().returning(move |_| {
            Ok(if dirty { vec!["?? new.txt".to_string()] } else { Vec::new() })
        });
        vcs
    }

    #[tokio::test]
    async fn test_restore_requires_confirmation_for_uncaptured_work() {
        let mut vcs = restorable(true);
        vcs.expect_create_ref().never();
        vcs.expect_checkout_tree().never();
        let manager = CheckpointManager::new(Arc::new(vcs), 5);

        let outcome = manager
            .restore(Path::new("/w/main"), "main", 1, None, false)
            .await
            .unwrap();
        let RestoreOutcome::ConfirmationRequired { plan } = outcome else {
            panic!("expected confirmation");
        };
        assert!(plan.destroys_uncommitted);
        assert_eq!(plan.diff.to_string(), "+0 ~1 -1");
    }

    #[tokio::test]
    async fn test_confirmed_restore_saves_safety_ref_first() {
        let mut vcs = restorable(true);
        let mut order = Sequence::new();
        vcs.expect_create_ref()
            .withf(|name, object| name.starts_with("refs/checkpoints/main/safety/") && object == "current")
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));
        vcs.expect_checkout_tree()
            .withf(|dir, object, remove| {
                dir == Path::new("/w/main") && object == "target" && remove == [PathBuf::from("new.txt")]
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _, _| Ok(()));
        let manager = CheckpointManager::new(Arc::new(vcs), 5);

        let outcome = manager
            .restore(Path::new("/w/main"), "main", 1, None, true)
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::Restored { safety_ref: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_clean_tree_restores_without_confirmation() {
        let mut vcs = restorable(false);
        vcs.expect_create_ref().times(1).returning(|_, _| Ok(()));
        vcs.expect_checkout_tree().times(1).returning(|_, _, _| Ok(()));
        let manager = CheckpointManager::new(Arc::new(vcs), 5);

        let outcome = manager
            .restore(Path::new("/w/main"), "main", 1, None, false)
            .await
            .unwrap();
        let RestoreOutcome::Restored { plan, .. } = outcome else {
            panic!("expected restore");
        };
        assert!(!plan.destroys_uncommitted);
    }

    #[tokio::test]
    async fn test_prune_deletes_only_own_refs() {
        let mut vcs = MockVcs::new();
        vcs.expect_list_refs().returning(|_| {
            Ok(vec![
                entry("refs/checkpoints/feat/1000/1", "o1", ""),
                entry("refs/checkpoints/feat/1000/2", "o2", ""),
                entry("refs/checkpoints/feat/safety/20260101", "o3", ""),
                entry("refs/checkpoints/feat/auth/1000/1", "o4", ""),
            ])
        });
        vcs.expect_delete_ref()
            .withf(|name| !name.starts_with("refs/checkpoints/feat/auth/"))
            .times(3)
            .returning(|_| Ok(()));
        let manager = CheckpointManager::new(Arc::new(vcs), 5);

        assert_eq!(manager.prune("feat").await.unwrap(), 3);
    }

    #[test]
    fn test_every_has_floor_of_one() {
        let manager = CheckpointManager::new(Arc::new(MockVcs::new()), 0);
        assert_eq!(manager.every(), 1);
    }
}
