// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session types.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session identifier.
pub type SessionId = String;

/// One agent's tenure on one workspace.
///
/// The session owns the checkpoint counter for its branch. The counter
/// restarts at zero for every new session; `epoch` keeps checkpoint refs of
/// different sessions on the same branch apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub workspace_id: String,
    pub branch: String,
    /// Worktree directory of the workspace.
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Start time in unix milliseconds; namespaces this session's checkpoints.
    pub epoch: i64,
    /// Sequence number of the last checkpoint taken (0 = none yet).
    pub checkpoint_counter: u64,
    pub writes_since_checkpoint: u32,
    /// Files written at least once during this session.
    #[serde(default)]
    pub touched_files: BTreeSet<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        workspace_id: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            id,
            workspace_id: workspace_id.into(),
            branch: branch.into(),
            path: path.into(),
            started_at,
            epoch: started_at.timestamp_millis(),
            checkpoint_counter: 0,
            writes_since_checkpoint: 0,
            touched_files: BTreeSet::new(),
            ended_at: None,
        }
    }

    /// Generate a unique session ID based on timestamp and UUID.
    pub fn generate_id() -> SessionId {
        let now = Utc::now();
        let short_uuid = &uuid::Uuid::new_v4().to_string()[..8];
        format!("session-{}-{}", now.format("%Y-%m-%d-%H-%M-%S"), short_uuid)
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Sequence number the next checkpoint will get.
    pub fn next_sequence(&self) -> u64 {
        self.checkpoint_counter + 1
    }
}
