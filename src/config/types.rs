// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of workspace and resolved configuration,
//! supporting JSON and YAML formats.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default protected integration branch.
pub const DEFAULT_PROTECTED_BRANCH: &str = "main";

/// Default state directory, relative to the repository root.
pub const DEFAULT_STATE_DIR: &str = ".gatehouse";

/// Default lock freshness window in hours.
pub const DEFAULT_STALE_AFTER_HOURS: u64 = 24;

/// Default number of file writes between automatic checkpoints.
pub const DEFAULT_CHECKPOINT_EVERY: u32 = 5;

/// Default project-local temp directory used by path-safety rewrites.
pub const DEFAULT_LOCAL_TEMP_DIR: &str = ".tmp";

/// Workspace configuration for Gatehouse.
/// Can be defined in .gatehouse.json or .gatehouse/config.json in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Integration branch that may only be changed through a workspace merge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_branch: Option<String>,

    /// Directory holding one subdirectory per workspace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation_root: Option<PathBuf>,

    /// Directory for the registry, session store and lock markers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Hours after which an untouched lock is considered stale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_after_hours: Option<u64>,

    /// Number of file writes between automatic checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_every: Option<u32>,

    /// Project-local replacement for shared temp directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_temp_dir: Option<String>,

    /// Additional deny patterns (regex) for guarded commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_patterns: Option<Vec<String>>,

    /// Additional confirm patterns (regex) for guarded commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_patterns: Option<Vec<String>>,

    /// Git executable to invoke
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_binary: Option<String>,
}

/// Fully resolved configuration after merging all sources.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub protected_branch: String,
    /// `None` means "derive from the repository root".
    pub isolation_root: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub stale_after_hours: u64,
    pub checkpoint_every: u32,
    pub local_temp_dir: String,
    pub deny_patterns: Vec<String>,
    pub confirm_patterns: Vec<String>,
    pub git_binary: String,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            protected_branch: DEFAULT_PROTECTED_BRANCH.to_string(),
            isolation_root: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            stale_after_hours: DEFAULT_STALE_AFTER_HOURS,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            local_temp_dir: DEFAULT_LOCAL_TEMP_DIR.to_string(),
            deny_patterns: Vec::new(),
            confirm_patterns: Vec::new(),
            git_binary: "git".to_string(),
        }
    }
}

impl ResolvedConfig {
    /// Lock freshness window as a duration.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_hours * 3600)
    }

    /// State directory resolved against the repository root.
    pub fn state_dir_in(&self, repo_root: &std::path::Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            repo_root.join(&self.state_dir)
        }
    }

    /// Isolation root resolved against the repository root.
    ///
    /// Defaults to a sibling directory named `<repo>.worktrees`.
    pub fn isolation_root_in(&self, repo_root: &std::path::Path) -> PathBuf {
        match &self.isolation_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => repo_root.join(root),
            None => {
                let name = repo_root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "repo".to_string());
                repo_root
                    .parent()
                    .unwrap_or(repo_root)
                    .join(format!("{name}.worktrees"))
            }
        }
    }
}
