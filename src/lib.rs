// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gatehouse - workspace isolation and command policy for coding agents.
//!
//! Several autonomous agents share one repository. Gatehouse keeps them out
//! of each other's way and away from irreversible mistakes:
//!
//! - every agent works in its own git worktree, held by a lock;
//! - every shell command is classified before it runs;
//! - working-tree state is checkpointed outside the branch history.
//!
//! # Architecture
//!
//! - [`error`] - Error types and the control-plane outcome taxonomy
//! - [`config`] - Layered configuration loading and validation
//! - [`telemetry`] - Tracing subscriber setup and in-process metrics
//! - [`vcs`] - The version-control boundary and its `git` implementation
//! - [`store`] - Versioned JSON state files with atomic replace
//! - [`workspace`] - Locks, the registry, worktree isolation and reconciliation
//! - [`guard`] - Shell command lexer and tiered policy evaluator
//! - [`checkpoint`] - Working-tree snapshots under `refs/checkpoints/`
//! - [`session`] - Session lifecycle tying the above together
//!
//! # Example
//!
//! ```rust,ignore
//! use gatehouse::guard::{Guard, GuardContext};
//!
//! let guard = Guard::default();
//! let verdict = guard.classify("git push --force origin feat", &GuardContext::new("/work/repo"));
//! assert_eq!(verdict.exit_code(), 0); // rewritten to --force-with-lease
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod guard;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod vcs;
pub mod workspace;

// Re-export commonly used types at crate root
pub use checkpoint::{Checkpoint, CheckpointManager, RestoreOutcome, RestorePlan};
pub use config::{load_config, CliOptions, ResolvedConfig};
pub use error::{ConfigError, ControlError, Result};
pub use guard::{Guard, GuardContext, Tier, Verdict};
pub use session::{Session, SessionService};
pub use vcs::{GitCli, Vcs};
pub use workspace::{
    LockManager, ReconcileReport, ReconcileTrigger, Reconciler, Registry, Workspace,
    WorkspaceManager,
};

/// Gatehouse version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let guard = Guard::default();
        let verdict = guard.classify("ls -la", &GuardContext::new("/work/repo"));
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(ReconcileTrigger::Manual.to_string(), "manual");
    }
}
