// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session store: `<state_dir>/sessions.json`, beside the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::store::JsonStore;

use super::types::Session;

/// Session file name inside the state directory.
pub const SESSIONS_FILE: &str = "sessions.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(default)]
    sessions: BTreeMap<String, Session>,
}

/// Persistent record of sessions, keyed by id.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    store: JsonStore<SessionDocument>,
}

impl SessionStorage {
    /// Store in `state_dir`.
    pub fn open(state_dir: &Path) -> Self {
        Self::at(state_dir.join(SESSIONS_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path, "session.write"),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Insert `session`, refusing if its workspace already has an active session.
    pub fn create(&self, session: &Session) -> Result<(), SessionError> {
        self.store.update(|doc| {
            let busy = doc
                .sessions
                .values()
                .any(|s| s.is_active() && s.workspace_id == session.workspace_id);
            if busy {
                return Err(SessionError::AlreadyActive(session.workspace_id.clone()));
            }
            doc.sessions.insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.store.load()?.sessions.remove(id))
    }

    /// Apply `f` to session `id` and persist the result. Ended sessions are read-only.
    pub fn modify<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        self.store.update(|doc| {
            let session = doc
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if !session.is_active() {
                return Err(SessionError::Ended(id.to_string()));
            }
            f(session)
        })
    }

    /// Replace a stored session wholesale.
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        self.store.update(|doc| {
            doc.sessions.insert(session.id.clone(), session.clone());
            Ok::<_, SessionError>(())
        })
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions: Vec<Session> = self.store.load()?.sessions.into_values().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// The active session on `workspace_id`, if any.
    pub fn active_for(&self, workspace_id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self
            .store
            .load()?
            .sessions
            .into_values()
            .find(|s| s.is_active() && s.workspace_id == workspace_id))
    }

    /// Workspaces that currently have an active session.
    pub fn active_workspaces(&self) -> Result<BTreeSet<String>, SessionError> {
        Ok(self
            .store
            .load()?
            .sessions
            .into_values()
            .filter(Session::is_active)
            .map(|s| s.workspace_id)
            .collect())
    }

    /// Drop ended sessions, keeping the newest `keep`.
    pub fn prune_ended(&self, keep: usize) -> Result<usize, SessionError> {
        self.store.update(|doc| {
            let mut ended: Vec<(chrono::DateTime<chrono::Utc>, String)> = doc
                .sessions
                .values()
                .filter_map(|s| s.ended_at.map(|at| (at, s.id.clone())))
                .collect();
            ended.sort();
            let excess = ended.len().saturating_sub(keep);
            for (_, id) in ended.into_iter().take(excess) {
                doc.sessions.remove(&id);
            }
            Ok::<_, SessionError>(excess)
        })
    }
}
