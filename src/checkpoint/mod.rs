// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Working-tree checkpoints.
//!
//! A checkpoint is a commit object holding the full working tree of a
//! workspace (untracked files included, ignored files excluded), anchored by
//! a reference outside the branch namespace:
//!
//! ```text
//! refs/checkpoints/<branch>/<session-epoch>/<sequence>
//! refs/checkpoints/<branch>/safety/<stamp>
//! ```
//!
//! Creating or restoring a checkpoint never moves HEAD or a branch and never
//! touches the worktree's real index. Refs are removed only by [`prune`]
//! after the branch is merged.
//!
//! [`prune`]: CheckpointManager::prune

mod manager;

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::vcs::{ChangeKind, FileChange};

pub use manager::CheckpointManager;

/// Namespace for all checkpoint references.
pub const REF_ROOT: &str = "refs/checkpoints";

/// Path component reserved for pre-restore safety snapshots.
pub const SAFETY_COMPONENT: &str = "safety";

/// An immutable snapshot of one workspace's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub branch: String,
    pub sequence: u64,
    /// Epoch of the session that took it (unix milliseconds).
    pub epoch: i64,
    /// The write that triggered it, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_file: Option<PathBuf>,
    pub object_id: String,
    pub reference: String,
    /// Commit time (unix seconds).
    pub created_at: i64,
}

/// `refs/checkpoints/<branch>/`
pub fn branch_prefix(branch: &str) -> String {
    format!("{REF_ROOT}/{branch}/")
}

/// Reference name for checkpoint `sequence` of the session with `epoch`.
pub fn checkpoint_ref(branch: &str, epoch: i64, sequence: u64) -> String {
    format!("{}{epoch}/{sequence}", branch_prefix(branch))
}

/// Reference name for a safety snapshot.
pub fn safety_ref(branch: &str, stamp: &str) -> String {
    format!("{}{SAFETY_COMPONENT}/{stamp}", branch_prefix(branch))
}

/// `(epoch, sequence)` of a checkpoint ref of `branch`.
///
/// Safety refs and refs of branches nested under `branch` (e.g. `feat/x`
/// under `feat`) yield `None`.
pub fn parse_checkpoint_ref(branch: &str, name: &str) -> Option<(i64, u64)> {
    let rest = name.strip_prefix(&branch_prefix(branch))?;
    let (epoch, sequence) = rest.split_once('/')?;
    if !is_digits(epoch) || !is_digits(sequence) {
        return None;
    }
    Some((epoch.parse().ok()?, sequence.parse().ok()?))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Commit message for a checkpoint.
pub(crate) fn checkpoint_message(branch: &str, sequence: u64, target: Option<&std::path::Path>) -> String {
    match target {
        Some(file) => format!("checkpoint {branch}#{sequence}: {}", file.display()),
        None => format!("checkpoint {branch}#{sequence}"),
    }
}

/// The triggering file recorded in a checkpoint message.
pub(crate) fn target_from_message(subject: &str) -> Option<PathBuf> {
    let (_, file) = subject.split_once(": ")?;
    (!file.is_empty()).then(|| PathBuf::from(file))
}

/// Paths that a restore would change, from the current tree's point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    /// Present in the target only; restore creates them.
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    /// Present in the current tree only; restore deletes them.
    pub deleted: Vec<PathBuf>,
}

impl DiffSummary {
    pub fn from_changes(changes: Vec<FileChange>) -> Self {
        let mut summary = Self::default();
        for change in changes {
            match change.kind {
                ChangeKind::Added => summary.added.push(change.path),
                ChangeKind::Modified | ChangeKind::TypeChanged => summary.modified.push(change.path),
                ChangeKind::Deleted => summary.deleted.push(change.path),
            }
        }
        summary.added.sort();
        summary.modified.sort();
        summary.deleted.sort();
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} ~{} -{}",
            self.added.len(),
            self.modified.len(),
            self.deleted.len()
        )
    }
}

/// What restoring a checkpoint would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePlan {
    pub target: Checkpoint,
    pub diff: DiffSummary,
    /// The current tree holds changes that neither HEAD nor any checkpoint captures.
    pub destroys_uncommitted: bool,
    /// Snapshot of the current tree taken while planning.
    pub current_object: String,
}

/// Result of a restore request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// Nothing was changed; the caller must confirm.
    ConfirmationRequired { plan: RestorePlan },
    Restored {
        plan: RestorePlan,
        /// Safety snapshot of the pre-restore state.
        #[serde(skip_serializing_if = "Option::is_none")]
        safety_ref: Option<String>,
    },
}
