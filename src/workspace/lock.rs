// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-workspace lock markers.
//!
//! A lock is a file `<locks>/<id>.lock` created with `create_new`. Its
//! content names the holder session; ownership is its existence and its
//! freshness is its mtime. A marker older than `stale_after` may be
//! reclaimed by another session once the workspace checks out.
//!
//! Reclaiming renames the marker to a unique tombstone first, so of several
//! sessions racing for one stale marker only the one whose rename succeeded
//! can recreate it. If the tombstone turns out fresh (the holder touched it
//! in between) it is linked back into place without clobbering.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::LockError;
use crate::vcs::Vcs;

use super::is_valid_id;

const MARKER_EXT: &str = "lock";
const TOMBSTONE_EXT: &str = "tomb";

/// How an acquisition succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// No marker existed.
    Created,
    /// The caller already held the lock; its mtime was refreshed.
    Renewed,
    /// A stale marker from another session was replaced.
    Reclaimed,
}

/// A marker as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub id: String,
    pub holder: String,
    pub modified: SystemTime,
    pub age: Duration,
    pub stale: bool,
}

/// Lock markers in one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn marker_path(&self, id: &str) -> Result<PathBuf, LockError> {
        if !is_valid_id(id) {
            return Err(LockError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.{MARKER_EXT}")))
    }

    /// Read the marker for `id`, if any.
    pub fn inspect(&self, id: &str) -> Result<Option<LockInfo>, LockError> {
        let path = self.marker_path(id)?;
        read_marker(&path, id, self.stale_after)
    }

    /// All markers, sorted by id.
    pub fn list(&self) -> Result<Vec<LockInfo>, LockError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut locks = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_id(id) {
                continue;
            }
            if let Some(info) = read_marker(&path, id, self.stale_after)? {
                locks.push(info);
            }
        }
        locks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(locks)
    }

    /// Take the lock for `session`.
    ///
    /// Re-acquiring a lock the session already holds renews it. A marker held
    /// by another session fails with [`LockError::Held`] while fresh and with
    /// [`LockError::Stale`] once stale; see [`LockManager::acquire_validated`].
    pub fn acquire(&self, id: &str, session: &str) -> Result<Acquired, LockError> {
        let path = self.marker_path(id)?;
        fs::create_dir_all(&self.dir)?;

        // A marker released between create and inspect is retried once.
        for _ in 0..2 {
            match create_marker(&path, session) {
                Ok(()) => {
                    info!(workspace = id, session, "Lock acquired");
                    return Ok(Acquired::Created);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let Some(info) = read_marker(&path, id, self.stale_after)? else {
                continue;
            };
            if info.holder == session {
                touch(&path)?;
                debug!(workspace = id, session, "Lock renewed");
                return Ok(Acquired::Renewed);
            }
            return Err(if info.stale {
                LockError::Stale {
                    id: id.to_string(),
                    holder: info.holder,
                    age: info.age,
                }
            } else {
                LockError::Held {
                    id: id.to_string(),
                    holder: info.holder,
                }
            });
        }
        Err(LockError::ReclaimRefused {
            id: id.to_string(),
            reason: "lock changed hands during acquisition".to_string(),
        })
    }

    /// Acquire, reclaiming a stale marker once the VCS confirms the
    /// worktree at `worktree` still exists.
    pub async fn acquire_validated(
        &self,
        vcs: &dyn Vcs,
        id: &str,
        session: &str,
        worktree: &Path,
    ) -> Result<Acquired, LockError> {
        match self.acquire(id, session) {
            Err(LockError::Stale { holder, age, .. }) => {
                let worktrees = vcs.worktrees().await?;
                let canonical = worktree.canonicalize().ok();
                let known = worktrees.iter().any(|wt| {
                    !wt.prunable
                        && (wt.path == worktree || canonical.as_deref() == Some(wt.path.as_path()))
                });
                if !known || !worktree.is_dir() {
                    return Err(LockError::ReclaimRefused {
                        id: id.to_string(),
                        reason: format!("worktree {} no longer exists", worktree.display()),
                    });
                }
                warn!(
                    workspace = id,
                    session,
                    previous = %holder,
                    age_hours = age.as_secs() / 3600,
                    "Reclaiming stale lock"
                );
                self.reclaim(id, session)
            }
            other => other,
        }
    }

    /// Replace a stale marker with one held by `session`.
    pub fn reclaim(&self, id: &str, session: &str) -> Result<Acquired, LockError> {
        let path = self.marker_path(id)?;
        let tombstone = self.dir.join(format!(
            ".{id}.{}.{TOMBSTONE_EXT}",
            uuid::Uuid::new_v4().simple()
        ));

        match fs::rename(&path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LockError::ReclaimRefused {
                    id: id.to_string(),
                    reason: "lock changed hands during reclaim".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        let Some(info) = read_marker(&tombstone, id, self.stale_after)? else {
            return Err(LockError::ReclaimRefused {
                id: id.to_string(),
                reason: "lock changed hands during reclaim".to_string(),
            });
        };
        if !info.stale {
            // Touched since it was judged stale: put it back.
            let restored = fs::hard_link(&tombstone, &path);
            let _ = fs::remove_file(&tombstone);
            if let Err(e) = restored {
                warn!(workspace = id, "Could not restore fresh lock marker: {}", e);
            }
            return Err(LockError::Held {
                id: id.to_string(),
                holder: info.holder,
            });
        }
        fs::remove_file(&tombstone)?;

        match create_marker(&path, session) {
            Ok(()) => {
                info!(workspace = id, session, previous = %info.holder, "Stale lock reclaimed");
                Ok(Acquired::Reclaimed)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_marker(&path, id, self.stale_after)?
                    .map(|i| i.holder)
                    .unwrap_or_default();
                Err(LockError::Held {
                    id: id.to_string(),
                    holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give a marker `session` reclaimed back to its previous holder, with
    /// the previous mtime so it reads as stale again.
    pub fn hand_back(&self, id: &str, session: &str, previous: &LockInfo) -> Result<(), LockError> {
        let path = self.marker_path(id)?;
        self.check_holder(&path, id, session)?;
        let mut file = OpenOptions::new().write(true).truncate(true).open(&path)?;
        writeln!(file, "{}", previous.holder)?;
        file.set_modified(previous.modified)?;
        file.sync_all()?;
        debug!(workspace = id, session, holder = %previous.holder, "Lock handed back");
        Ok(())
    }

    /// Refresh the marker's mtime.
    pub fn heartbeat(&self, id: &str, session: &str) -> Result<(), LockError> {
        let path = self.marker_path(id)?;
        self.check_holder(&path, id, session)?;
        touch(&path)?;
        debug!(workspace = id, session, "Lock heartbeat");
        Ok(())
    }

    /// Remove the marker. A missing marker counts as released.
    pub fn release(&self, id: &str, session: &str) -> Result<(), LockError> {
        let path = self.marker_path(id)?;
        match self.check_holder(&path, id, session) {
            Ok(()) => {}
            Err(LockError::NotHeld { .. }) if !path.exists() => return Ok(()),
            Err(e) => return Err(e),
        }
        remove_if_exists(&path)?;
        info!(workspace = id, session, "Lock released");
        Ok(())
    }

    /// Remove the marker regardless of holder. Returns whether one existed.
    pub fn force_release(&self, id: &str) -> Result<bool, LockError> {
        let path = self.marker_path(id)?;
        let removed = remove_if_exists(&path)?;
        if removed {
            warn!(workspace = id, "Lock force-released");
        }
        Ok(removed)
    }

    fn check_holder(&self, path: &Path, id: &str, session: &str) -> Result<(), LockError> {
        match read_marker(path, id, self.stale_after)? {
            Some(info) if info.holder == session => Ok(()),
            _ => Err(LockError::NotHeld {
                id: id.to_string(),
                session: session.to_string(),
            }),
        }
    }
}

fn create_marker(path: &Path, session: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{session}")?;
    file.sync_all()
}

fn read_marker(path: &Path, id: &str, stale_after: Duration) -> Result<Option<LockInfo>, LockError> {
    let (content, modified) = match File::open(path).and_then(|mut f| {
        let modified = f.metadata()?.modified()?;
        let mut content = String::new();
        io::Read::read_to_string(&mut f, &mut content)?;
        Ok((content, modified))
    }) {
        Ok(found) => found,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // Clock skew can put the mtime in the future; treat that as fresh.
    // Strictly older than the window is stale.
    let age = SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO);
    Ok(Some(LockInfo {
        id: id.to_string(),
        holder: content.trim().to_string(),
        modified,
        age,
        stale: age > stale_after,
    }))
}

fn touch(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::{MockVcs, Worktree};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 3600);
    const HOUR: Duration = Duration::from_secs(3600);

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path().join("locks"), DAY)
    }

    fn age_marker(locks: &LockManager, id: &str, age: Duration) {
        let path = locks.marker_path(id).unwrap();
        OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[test]
    fn test_acquire_and_inspect() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        assert_eq!(locks.inspect("feat-auth").unwrap(), None);

        assert_eq!(locks.acquire("feat-auth", "s1").unwrap(), Acquired::Created);
        let info = locks.inspect("feat-auth").unwrap().unwrap();
        assert_eq!(info.holder, "s1");
        assert!(!info.stale);
    }

    #[test]
    fn test_acquire_is_reentrant_for_holder() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();
        assert_eq!(locks.acquire("feat-auth", "s1").unwrap(), Acquired::Renewed);
    }

    #[test]
    fn test_acquire_held_by_other_session() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();
        let err = locks.acquire("feat-auth", "s2").unwrap_err();
        assert!(matches!(err, LockError::Held { ref holder, .. } if holder == "s1"));
    }

    #[test]
    fn test_staleness_threshold() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        locks.acquire("old", "s1").unwrap();
        age_marker(&locks, "old", 25 * HOUR);
        assert!(locks.inspect("old").unwrap().unwrap().stale);

        locks.acquire("recent", "s1").unwrap();
        age_marker(&locks, "recent", 23 * HOUR);
        assert!(!locks.inspect("recent").unwrap().unwrap().stale);
    }

    #[test]
    fn test_stale_lock_is_reported_then_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();
        age_marker(&locks, "feat-auth", 25 * HOUR);

        let err = locks.acquire("feat-auth", "s2").unwrap_err();
        assert!(matches!(err, LockError::Stale { ref holder, .. } if holder == "s1"));

        assert_eq!(locks.reclaim("feat-auth", "s2").unwrap(), Acquired::Reclaimed);
        let info = locks.inspect("feat-auth").unwrap().unwrap();
        assert_eq!(info.holder, "s2");
        assert!(!info.stale);
    }

    #[test]
    fn test_reclaim_restores_fresh_marker() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();

        let err = locks.reclaim("feat-auth", "s2").unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
        assert_eq!(locks.inspect("feat-auth").unwrap().unwrap().holder, "s1");
        // No tombstones left behind.
        let leftovers = fs::read_dir(locks.dir()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_heartbeat_refreshes_and_checks_holder() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();
        age_marker(&locks, "feat-auth", 25 * HOUR);

        locks.heartbeat("feat-auth", "s1").unwrap();
        assert!(!locks.inspect("feat-auth").unwrap().unwrap().stale);

        assert!(matches!(
            locks.heartbeat("feat-auth", "s2"),
            Err(LockError::NotHeld { .. })
        ));
        assert!(matches!(
            locks.heartbeat("missing", "s1"),
            Err(LockError::NotHeld { .. })
        ));
    }

    #[test]
    fn test_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();

        assert!(matches!(
            locks.release("feat-auth", "s2"),
            Err(LockError::NotHeld { .. })
        ));
        locks.release("feat-auth", "s1").unwrap();
        assert_eq!(locks.inspect("feat-auth").unwrap(), None);
        // Idempotent.
        locks.release("feat-auth", "s1").unwrap();
    }

    #[test]
    fn test_force_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();
        assert!(locks.force_release("feat-auth").unwrap());
        assert!(!locks.force_release("feat-auth").unwrap());
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        assert!(matches!(
            locks.acquire("../escape", "s1"),
            Err(LockError::InvalidId(_))
        ));
    }

    #[test]
    fn test_list_skips_tombstones() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("b", "s1").unwrap();
        locks.acquire("a", "s2").unwrap();
        fs::write(locks.dir().join(".c.123.tomb"), "s3").unwrap();

        let ids: Vec<_> = locks.list().unwrap().into_iter().map(|l| l.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_acquire_yields_one_holder() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.acquire("feat-auth", &format!("s{i}")).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_reclaim_yields_one_holder() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir));
        locks.acquire("feat-auth", "dead").unwrap();
        age_marker(&locks, "feat-auth", 30 * HOUR);
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let session = format!("s{i}");
                    barrier.wait();
                    locks.reclaim("feat-auth", &session).ok().map(|_| session)
                })
            })
            .collect();
        let winners: Vec<String> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();

        assert_eq!(winners.len(), 1);
        let info = locks.inspect("feat-auth").unwrap().unwrap();
        assert_eq!(info.holder, winners[0]);
        assert!(!info.stale);
    }

    #[test]
    fn test_hand_back_restores_stale_marker() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "dead").unwrap();
        age_marker(&locks, "feat-auth", 30 * HOUR);
        let previous = locks.inspect("feat-auth").unwrap().unwrap();

        locks.reclaim("feat-auth", "sweeper").unwrap();
        assert!(matches!(
            locks.hand_back("feat-auth", "other", &previous),
            Err(LockError::NotHeld { .. })
        ));
        locks.hand_back("feat-auth", "sweeper", &previous).unwrap();

        let info = locks.inspect("feat-auth").unwrap().unwrap();
        assert_eq!(info.holder, "dead");
        assert!(info.stale);
    }

    #[tokio::test]
    async fn test_acquire_validated_reclaims_live_worktree() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let worktree = dir.path().join("feat-auth");
        fs::create_dir_all(&worktree).unwrap();
        locks.acquire("feat-auth", "s1").unwrap();
        age_marker(&locks, "feat-auth", 25 * HOUR);

        let listed = worktree.clone();
        let mut vcs = MockVcs::new();
        vcs.expect_worktrees().returning(move || {
            Ok(vec![Worktree {
                path: listed.clone(),
                branch: Some("feat/auth".to_string()),
                ..Worktree::default()
            }])
        });

        let acquired = locks
            .acquire_validated(&vcs, "feat-auth", "s2", &worktree)
            .await
            .unwrap();
        assert_eq!(acquired, Acquired::Reclaimed);
    }

    #[tokio::test]
    async fn test_acquire_validated_refuses_missing_worktree() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("feat-auth", "s1").unwrap();
        age_marker(&locks, "feat-auth", 25 * HOUR);

        let mut vcs = MockVcs::new();
        vcs.expect_worktrees().returning(|| Ok(Vec::new()));

        let err = locks
            .acquire_validated(&vcs, "feat-auth", "s2", &dir.path().join("feat-auth"))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::ReclaimRefused { .. }));
        assert_eq!(locks.inspect("feat-auth").unwrap().unwrap().holder, "s1");
    }
}
