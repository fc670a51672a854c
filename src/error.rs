// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the Gatehouse control plane.
//!
//! Each subsystem gets its own strongly-typed error, defined with `thiserror`.
//! [`ControlError`] is the cross-cutting outcome taxonomy surfaced to callers
//! (policy violations, drift, stale resources, snapshot failures, unparseable
//! commands). Glue code propagates with `anyhow` via [`Result`].

use std::time::Duration;

use thiserror::Error;

/// Cross-cutting control-plane outcomes.
///
/// None of these is fatal to the whole system: each command or operation
/// fails independently.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Policy violation ({rule}): {reason}")]
    PolicyViolation { rule: String, reason: String },

    #[error("Drift detected: {count} workspace(s) need attention")]
    DriftDetected { count: usize },

    #[error("Stale resource {id}: last touched {}h ago", .age.as_secs() / 3600)]
    StaleResource { id: String, age: Duration },

    #[error("Snapshot failure: {0}")]
    SnapshotFailure(String),

    #[error("Unparseable command: {0}")]
    UnparseableCommand(String),
}

impl ControlError {
    /// Create a policy violation for a firing rule.
    pub fn policy(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Name of the rule that produced this outcome, if any.
    pub fn rule(&self) -> Option<&str> {
        match self {
            Self::PolicyViolation { rule, .. } => Some(rule),
            Self::UnparseableCommand(_) => Some("unparseable"),
            _ => None,
        }
    }
}

/// Errors raised by the version-control adapter.
#[derive(Error, Debug)]
pub enum VcsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Reference not found: {0}")]
    RefNotFound(String),

    #[error("Unexpected git output: {0}")]
    Parse(String),
}

impl VcsError {
    /// Create a command failure from the subcommand and its stderr.
    pub fn command(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            stderr: stderr.into().trim().to_string(),
        }
    }
}

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Workspace {id} is locked by session {holder}")]
    Held { id: String, holder: String },

    #[error("Lock for {id} held by {holder} is stale ({}h old)", .age.as_secs() / 3600)]
    Stale {
        id: String,
        holder: String,
        age: Duration,
    },

    #[error("Lock for {id} is not held by session {session}")]
    NotHeld { id: String, session: String },

    #[error("Stale lock for {id} cannot be reclaimed: {reason}")]
    ReclaimRefused { id: String, reason: String },

    #[error("Invalid workspace id: {0}")]
    InvalidId(String),

    #[error("VCS error during lock validation: {0}")]
    Vcs(#[from] VcsError),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<LockError> for ControlError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Stale { id, age, .. } => Self::StaleResource { id, age },
            other => Self::policy("workspace-lock", other.to_string()),
        }
    }
}

/// Errors from the atomically-replaced JSON state files.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State file corrupted: {0}")]
    Corrupted(String),

    #[error("State file busy: could not acquire mutation guard after {0}ms")]
    Busy(u64),

    #[error("Unsupported state file version {0}")]
    UnsupportedVersion(u32),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupted(err.to_string())
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::IoError(err.error.to_string())
    }
}

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Workspace not registered: {0}")]
    NotFound(String),

    #[error("Invalid workspace id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from workspace create/remove.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Branch {0} cannot be isolated: {1}")]
    InvalidBranch(String, String),

    #[error("Workspace {0} already exists")]
    AlreadyExists(String),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Workspace {id} is locked by session {holder}")]
    Locked { id: String, holder: String },

    #[error("Workspace {id} has {count} uncommitted change(s)")]
    Dirty { id: String, count: usize },

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for WorkspaceError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Errors raised while reconciling workspace state.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Errors that can occur during checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint {branch}#{sequence} not found")]
    NotFound { branch: String, sequence: u64 },

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),
}

impl From<CheckpointError> for ControlError {
    fn from(err: CheckpointError) -> Self {
        Self::SnapshotFailure(err.to_string())
    }
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Workspace {0} already has an active session")]
    AlreadyActive(String),

    #[error("Session {0} has already ended")]
    Ended(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
