// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace and session lifecycle against a real repository.

#[macro_use]
mod common;

use std::fs;

use common::{git, Fixture};
use gatehouse::config::ResolvedConfig;
use gatehouse::error::SessionError;
use gatehouse::session::SessionService;
use gatehouse::workspace::{DriftKind, LockState, ReconcileTrigger};

fn service(fixture: &Fixture) -> SessionService {
    SessionService::open(&fixture.repo, &ResolvedConfig::default())
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_session_lifecycle() {
    require_git!();
    let fixture = Fixture::new();
    let service = service(&fixture);

    let started = service.start("feat/auth", Some("GH-7")).await.unwrap();
    let path = started.workspace.path.clone();
    assert_eq!(path, fixture.isolation_root().join("feat-auth"));
    assert!(path.join("README.md").is_file());
    assert_eq!(git(&path, &["branch", "--show-current"]), "feat/auth");
    assert!(matches!(
        started.workspace.lock_state,
        LockState::Active { ref holder } if *holder == started.session.id
    ));

    // The main checkout never moves.
    assert_eq!(git(&fixture.repo, &["branch", "--show-current"]), "main");

    let err = service.start("feat/auth", None).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyActive(_)));

    service.heartbeat(&started.session.id).unwrap();
    service.checkpoint(&started.session.id, None).await.unwrap();
    service.end(&started.session.id).unwrap();
    let workspace = service.workspaces().lookup("feat-auth").unwrap().unwrap();
    assert_eq!(workspace.lock_state, LockState::Unlocked);
    assert_eq!(workspace.issue.as_deref(), Some("GH-7"));

    let merged = service.complete_merge("feat/auth").await.unwrap();
    assert!(merged.removed);
    assert_eq!(merged.pruned, 1);
    assert!(merged.reconcile.is_clean());
    assert!(!path.exists());
    assert!(service.workspaces().list().unwrap().is_empty());
    assert!(!git(&fixture.repo, &["worktree", "list"]).contains("feat-auth"));
}

#[tokio::test]
async fn test_protected_branch_is_refused() {
    require_git!();
    let fixture = Fixture::new();
    let err = service(&fixture).start("main", None).await.unwrap_err();
    assert!(matches!(err, SessionError::Workspace(_)));
}

#[tokio::test]
async fn test_merge_keeps_dirty_workspace() {
    require_git!();
    let fixture = Fixture::new();
    let service = service(&fixture);
    let started = service.start("feat/dirty", None).await.unwrap();
    fs::write(started.workspace.path.join("unsaved.txt"), "keep me\n").unwrap();

    let merged = service.complete_merge("feat/dirty").await.unwrap();
    assert!(!merged.removed);
    assert!(started.workspace.path.join("unsaved.txt").exists());
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_reconcile_repairs_drift() {
    require_git!();
    let fixture = Fixture::new();
    let service = service(&fixture);

    // Directory deleted behind git's back: registry + stale worktree entry.
    let gone = service.workspaces().create("feat/gone", None).await.unwrap();
    fs::remove_dir_all(&gone.path).unwrap();

    // A worktree made by hand: on disk and in git, never registered.
    let manual = fixture.isolation_root().join("manual");
    git(
        &fixture.repo,
        &["worktree", "add", "-b", "manual", manual.to_str().unwrap(), "main"],
    );

    // A stray directory that is not a worktree.
    let stray = fixture.isolation_root().join("stray");
    fs::create_dir_all(&stray).unwrap();
    fs::write(stray.join("junk"), "x").unwrap();

    let dry = service.reconcile(ReconcileTrigger::Manual, true).await.unwrap();
    let kinds: Vec<_> = dry.drift.iter().map(|d| (d.id.as_str(), d.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            ("feat-gone", DriftKind::VcsOnly),
            ("manual", DriftKind::Untracked),
            ("stray", DriftKind::FilesystemOnly),
        ]
    );
    assert!(stray.exists());

    let report = service.reconcile(ReconcileTrigger::Manual, false).await.unwrap();
    assert!(report.is_clean(), "{report}");
    assert!(!stray.exists());
    assert!(manual.exists());
    assert_eq!(
        service.workspaces().lookup("manual").unwrap().unwrap().branch,
        "manual"
    );
    assert!(service.workspaces().lookup("feat-gone").unwrap().is_none());
    assert!(!git(&fixture.repo, &["worktree", "list"]).contains("feat-gone"));

    // A second pass finds nothing to do.
    let again = service.reconcile(ReconcileTrigger::Manual, false).await.unwrap();
    assert!(again.actions_taken.is_empty());
}
