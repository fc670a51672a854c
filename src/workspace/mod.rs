// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolated workspaces.
//!
//! A workspace is a git worktree under the isolation root, one per branch,
//! owned by at most one session at a time. Three sources describe the set of
//! workspaces: the directories on disk, the VCS worktree list and the
//! registry file. They can drift apart; the [`reconcile`] module brings them
//! back in line.
//!
//! - [`lock`]: per-workspace lock markers with mtime-based staleness
//! - [`registry`]: the registry file
//! - [`isolation`]: path naming and workspace create/remove
//! - [`reconcile`]: three-way drift detection and cleanup

pub mod isolation;
pub mod lock;
pub mod reconcile;
pub mod registry;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use isolation::{sanitize_branch_name, workspace_path, WorkspaceManager};
pub use lock::{Acquired, LockInfo, LockManager};
pub use reconcile::{
    DriftKind, ReconcileAction, ReconcileReport, ReconcileTrigger, Reconciler, ReconciliationView,
};
pub use registry::Registry;

/// Longest accepted workspace id.
pub const MAX_ID_LEN: usize = 200;

/// Whether `id` is usable as a workspace id (a single safe path component).
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Lock state derived from the marker at lookup time. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Active { holder: String },
    Stale { holder: String, age_secs: u64 },
}

impl LockState {
    pub fn from_info(info: Option<&LockInfo>) -> Self {
        match info {
            None => LockState::Unlocked,
            Some(info) if info.stale => LockState::Stale {
                holder: info.holder.clone(),
                age_secs: info.age.as_secs(),
            },
            Some(info) => LockState::Active {
                holder: info.holder.clone(),
            },
        }
    }

    pub fn holder(&self) -> Option<&str> {
        match self {
            LockState::Unlocked => None,
            LockState::Active { holder } | LockState::Stale { holder, .. } => Some(holder),
        }
    }
}

/// Input to [`Registry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub issue: Option<String>,
    pub session: Option<String>,
}

impl Registration {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            branch: branch.into(),
            issue: None,
            session: None,
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issue = Some(issue.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

/// One persisted registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A workspace as seen by callers: the registry record plus its lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub created_at: DateTime<Utc>,
    pub lock_state: LockState,
}

impl Workspace {
    pub fn from_entry(entry: RegistryEntry, lock: Option<&LockInfo>) -> Self {
        Self {
            id: entry.id,
            path: entry.path,
            branch: entry.branch,
            issue: entry.issue,
            session: entry.session,
            created_at: entry.created_at,
            lock_state: LockState::from_info(lock),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.lock_state, LockState::Active { .. })
    }
}

/// Human-readable age, e.g. `3h12m`.
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("feat-auth"));
        assert!(is_valid_id("fix_bug.123"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id(".hidden"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id("-rf"));
        assert!(!is_valid_id(&"a".repeat(MAX_ID_LEN + 1)));
    }

    #[test]
    fn test_lock_state_from_info() {
        assert_eq!(LockState::from_info(None), LockState::Unlocked);
        let info = LockInfo {
            id: "feat-auth".to_string(),
            holder: "s1".to_string(),
            modified: std::time::SystemTime::UNIX_EPOCH,
            age: Duration::from_secs(90_000),
            stale: true,
        };
        assert_eq!(
            LockState::from_info(Some(&info)),
            LockState::Stale {
                holder: "s1".to_string(),
                age_secs: 90_000
            }
        );
        assert_eq!(LockState::from_info(Some(&info)).holder(), Some("s1"));
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_secs(5)), "5s");
        assert_eq!(format_age(Duration::from_secs(300)), "5m");
        assert_eq!(format_age(Duration::from_secs(25 * 3600 + 120)), "25h02m");
    }
}
