// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent sessions.
//!
//! A session is one agent's tenure on one workspace. It holds the
//! workspace lock for its lifetime and owns the branch's checkpoint counter.
//!
//! - **Types**: [`Session`]
//! - **Storage**: `sessions.json` beside the registry, atomic whole-file replace
//! - **Service**: start (reconcile, ensure workspace, lock), heartbeat, writes,
//!   end, post-merge cleanup
//!
//! ```text
//!  start ──► reconcile(session-start) ──► ensure workspace ──► lock ──► record
//!  write ──► record_write ──► checkpoint every Nth write / first touch
//!  end   ──► release lock
//!  merged ─► end sessions ──► prune checkpoints ──► remove workspace ──► reconcile(post-merge)
//! ```

mod service;
mod storage;
mod types;

pub use service::{MergeOutcome, SessionService, SessionStart, LOCKS_DIR};
pub use storage::{SessionStorage, SESSIONS_FILE};
pub use types::{Session, SessionId};
