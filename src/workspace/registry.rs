// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace registry: `<state_dir>/registry.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::store::JsonStore;

use super::{is_valid_id, Registration, RegistryEntry};

/// Registry file name inside the state directory.
pub const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    entries: BTreeMap<String, RegistryEntry>,
}

/// Persistent record of known workspaces, keyed by id.
#[derive(Debug, Clone)]
pub struct Registry {
    store: JsonStore<RegistryDocument>,
}

impl Registry {
    /// Registry in `state_dir`.
    pub fn open(state_dir: &Path) -> Self {
        Self::at(state_dir.join(REGISTRY_FILE))
    }

    /// Registry at an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path, "registry.write"),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Insert or replace an entry. Re-registering keeps the original `created_at`.
    pub fn register(&self, registration: Registration) -> Result<RegistryEntry, RegistryError> {
        if !is_valid_id(&registration.id) {
            return Err(RegistryError::InvalidId(registration.id));
        }

        let entry = self.store.update(|doc| {
            let now = Utc::now();
            let created_at = doc
                .entries
                .get(&registration.id)
                .map(|existing| existing.created_at)
                .unwrap_or(now);
            let entry = RegistryEntry {
                id: registration.id.clone(),
                path: registration.path,
                branch: registration.branch,
                issue: registration.issue,
                session: registration.session,
                created_at,
                updated_at: now,
            };
            doc.entries.insert(registration.id, entry.clone());
            Ok::<_, RegistryError>(entry)
        })?;

        info!(workspace = %entry.id, branch = %entry.branch, "Workspace registered");
        Ok(entry)
    }

    pub fn lookup(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.store.load()?.entries.remove(id))
    }

    /// Like [`Registry::lookup`], but a missing entry is an error.
    pub fn get(&self, id: &str) -> Result<RegistryEntry, RegistryError> {
        self.lookup(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Entry whose branch is `branch`, if any.
    pub fn find_by_branch(&self, branch: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self
            .store
            .load()?
            .entries
            .into_values()
            .find(|entry| entry.branch == branch))
    }

    /// All entries, sorted by id.
    pub fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.store.load()?.entries.into_values().collect())
    }

    /// Delete an entry, returning it if it existed.
    pub fn remove(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        let removed = self
            .store
            .update(|doc| Ok::<_, RegistryError>(doc.entries.remove(id)))?;
        if removed.is_some() {
            info!(workspace = id, "Workspace unregistered");
        }
        Ok(removed)
    }

    /// Record which session owns a workspace.
    pub fn set_session(&self, id: &str, session: Option<&str>) -> Result<RegistryEntry, RegistryError> {
        let entry = self.store.update(|doc| {
            let entry = doc
                .entries
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            entry.session = session.map(str::to_string);
            entry.updated_at = Utc::now();
            Ok::<_, RegistryError>(entry.clone())
        })?;
        debug!(workspace = id, session = ?session, "Workspace owner updated");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Registry {
        Registry::open(dir.path())
    }

    fn feat_auth() -> Registration {
        Registration::new("feat-auth", "/work/repo.worktrees/feat-auth", "feat/auth")
    }

    #[test]
    fn test_register_and_lookup() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.register(feat_auth().with_issue("GH-42")).unwrap();

        let entry = registry.lookup("feat-auth").unwrap().unwrap();
        assert_eq!(entry.branch, "feat/auth");
        assert_eq!(entry.issue.as_deref(), Some("GH-42"));
        assert_eq!(registry.lookup("other").unwrap(), None);
        assert!(matches!(registry.get("other"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_register_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let first = registry.register(feat_auth()).unwrap();
        let second = registry.register(feat_auth().with_session("s1")).unwrap();

        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.session.as_deref(), Some("s1"));
    }

    #[test]
    fn test_list_is_sorted() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.register(Registration::new("b", "/w/b", "b")).unwrap();
        registry.register(Registration::new("a", "/w/a", "a")).unwrap();
        let ids: Vec<_> = registry.list().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.register(feat_auth()).unwrap();
        assert!(registry.remove("feat-auth").unwrap().is_some());
        assert!(registry.remove("feat-auth").unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_set_session_and_find_by_branch() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.register(feat_auth()).unwrap();

        registry.set_session("feat-auth", Some("s1")).unwrap();
        let entry = registry.find_by_branch("feat/auth").unwrap().unwrap();
        assert_eq!(entry.session.as_deref(), Some("s1"));

        registry.set_session("feat-auth", None).unwrap();
        assert_eq!(registry.get("feat-auth").unwrap().session, None);
        assert!(matches!(
            registry.set_session("missing", None),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let err = registry
            .register(Registration::new("../x", "/w/x", "x"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidId(_)));
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.register(feat_auth()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(registry.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["entries"]["feat-auth"]["branch"], "feat/auth");
        assert!(raw["entries"]["feat-auth"]["createdAt"].is_string());
    }

    #[test]
    fn test_concurrent_registration_of_one_id() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(registry(&dir));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry
                        .register(feat_auth().with_session(format!("s{i}")))
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<RegistryEntry> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let entries = registry.list().unwrap();
        assert_eq!(entries.len(), 1);
        let winner = &entries[0];
        assert!(results.iter().any(|r| r.session == winner.session));
        assert!(results.iter().all(|r| r.created_at == winner.created_at));
    }

    #[test]
    fn test_concurrent_registration_of_many_ids() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(registry(&dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = format!("ws-{i}");
                    registry
                        .register(Registration::new(id.clone(), format!("/w/{id}"), id))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.list().unwrap().len(), 8);
    }
}
