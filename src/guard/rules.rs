// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guard rules.
//!
//! Each [`GuardRule`] variant fixes what a rule is allowed to produce: a
//! nuclear or branch-protection rule can only deny, a rewrite rule can only
//! rewrite, and so on. The evaluator in [`super::Guard`] walks [`Tier::ALL`]
//! in order, so priority never depends on the order rules were added.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::command::{has_long, has_short, is_short_bundle, positionals, resolve_target, SimpleCommand, Target};
use super::lexer::Word;
use super::verdict::{Edit, GuardContext, Policy, Refusal, Tier};

pub type DenyCheck = fn(&SimpleCommand<'_>, &GuardContext, &Policy) -> Option<Refusal>;
pub type TextCheck = fn(&str) -> Option<Refusal>;
pub type PathCheck = fn(&SimpleCommand<'_>, &GuardContext, &Policy) -> Option<PathAction>;
pub type RewriteCheck = fn(&SimpleCommand<'_>, &GuardContext, &Policy) -> Option<Rewriting>;
pub type ConfirmCheck = fn(&SimpleCommand<'_>, &GuardContext, &Policy) -> Option<String>;

/// Replacement produced by a rewriting rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewriting {
    pub edits: Vec<Edit>,
    pub reason: String,
    /// Directory the rewritten command expects to exist.
    pub ensure_dir: Option<PathBuf>,
}

/// Result of a path-safety rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAction {
    Deny(Refusal),
    Rewrite(Rewriting),
}

/// What a rule decided about one simple command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Deny(Refusal),
    Rewrite(Rewriting),
    Confirm(String),
}

/// A guard rule, tagged by tier.
#[derive(Debug, Clone)]
pub enum GuardRule {
    /// Irrecoverable operation recognized at command position.
    NuclearDeny { name: &'static str, check: DenyCheck },
    /// Irrecoverable construct recognized on the whole unquoted line.
    NuclearPattern { name: &'static str, check: TextCheck },
    BranchProtect { name: &'static str, check: DenyCheck },
    /// Deployment-configured deny pattern over the normalized command.
    Deny { name: String, pattern: Regex },
    PathSafety { name: &'static str, check: PathCheck },
    Rewrite { name: &'static str, check: RewriteCheck },
    Confirm { name: &'static str, check: ConfirmCheck },
    /// Deployment-configured confirm pattern over the normalized command.
    ConfirmPattern { name: String, pattern: Regex },
}

impl GuardRule {
    pub fn name(&self) -> &str {
        match self {
            GuardRule::NuclearDeny { name, .. }
            | GuardRule::NuclearPattern { name, .. }
            | GuardRule::BranchProtect { name, .. }
            | GuardRule::PathSafety { name, .. }
            | GuardRule::Rewrite { name, .. }
            | GuardRule::Confirm { name, .. } => *name,
            GuardRule::Deny { name, .. } | GuardRule::ConfirmPattern { name, .. } => name.as_str(),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            GuardRule::NuclearDeny { .. } | GuardRule::NuclearPattern { .. } => Tier::NuclearDeny,
            GuardRule::BranchProtect { .. } => Tier::BranchProtect,
            GuardRule::Deny { .. } => Tier::PolicyDeny,
            GuardRule::PathSafety { .. } => Tier::PathSafety,
            GuardRule::Rewrite { .. } => Tier::Rewrite,
            GuardRule::Confirm { .. } | GuardRule::ConfirmPattern { .. } => Tier::Confirm,
        }
    }

    /// Evaluate against one simple command.
    pub fn evaluate(&self, cmd: &SimpleCommand<'_>, ctx: &GuardContext, policy: &Policy) -> Option<Outcome> {
        match self {
            GuardRule::NuclearDeny { check, .. } | GuardRule::BranchProtect { check, .. } => {
                check(cmd, ctx, policy).map(Outcome::Deny)
            }
            GuardRule::NuclearPattern { .. } => None,
            GuardRule::Deny { pattern, .. } => pattern
                .is_match(&cmd.normalized())
                .then(|| Outcome::Deny(Refusal::new(format!("matches deny pattern `{pattern}`")))),
            GuardRule::PathSafety { check, .. } => check(cmd, ctx, policy).map(|action| match action {
                PathAction::Deny(refusal) => Outcome::Deny(refusal),
                PathAction::Rewrite(rewriting) => Outcome::Rewrite(rewriting),
            }),
            GuardRule::Rewrite { check, .. } => check(cmd, ctx, policy).map(Outcome::Rewrite),
            GuardRule::Confirm { check, .. } => check(cmd, ctx, policy).map(Outcome::Confirm),
            GuardRule::ConfirmPattern { pattern, .. } => pattern
                .is_match(&cmd.normalized())
                .then(|| Outcome::Confirm(format!("`{}` matches confirm pattern `{pattern}`", cmd.normalized()))),
        }
    }

    /// Evaluate a whole-line rule against the unquoted skeleton.
    pub fn evaluate_text(&self, skeleton: &str) -> Option<Refusal> {
        match self {
            GuardRule::NuclearPattern { check, .. } => check(skeleton),
            _ => None,
        }
    }
}

/// The built-in rule set.
pub fn builtin_rules() -> Vec<GuardRule> {
    vec![
        GuardRule::NuclearPattern { name: "fork-bomb", check: fork_bomb },
        GuardRule::NuclearDeny { name: "rm-root", check: rm_catastrophic },
        GuardRule::NuclearDeny { name: "rm-everything-here", check: rm_everything_here },
        GuardRule::NuclearDeny { name: "git-reset-hard", check: git_reset_hard },
        GuardRule::NuclearDeny { name: "git-clean-force", check: git_clean_force },
        GuardRule::NuclearDeny { name: "git-discard-worktree", check: git_discard_worktree },
        GuardRule::NuclearDeny { name: "git-stash-destroy", check: git_stash_destroy },
        GuardRule::NuclearDeny { name: "git-push-destructive", check: git_push_destructive },
        GuardRule::NuclearDeny { name: "protected-branch-delete", check: protected_branch_delete },
        GuardRule::NuclearDeny { name: "worktree-force-remove", check: worktree_force_remove },
        GuardRule::NuclearDeny { name: "disk-format", check: disk_format },
        GuardRule::NuclearDeny { name: "dd-device", check: dd_device },
        GuardRule::NuclearDeny { name: "shred", check: shred },
        GuardRule::NuclearDeny { name: "recursive-permissions-root", check: recursive_permissions_root },
        GuardRule::NuclearDeny { name: "device-redirect", check: device_redirect },
        GuardRule::BranchProtect { name: "protected-branch-commit", check: protected_branch_commit },
        GuardRule::BranchProtect { name: "protected-branch-push", check: protected_branch_push },
        GuardRule::BranchProtect { name: "protected-ref-move", check: protected_ref_move },
        GuardRule::PathSafety { name: "cwd-containment", check: cwd_containment },
        GuardRule::PathSafety { name: "unresolved-removal", check: unresolved_removal },
        GuardRule::PathSafety { name: "shared-temp-delete", check: shared_temp_delete },
        GuardRule::PathSafety { name: "shared-temp-redirect", check: shared_temp_redirect },
        GuardRule::Rewrite { name: "force-with-lease", check: force_with_lease },
        GuardRule::Rewrite { name: "no-verify-strip", check: no_verify_strip },
        GuardRule::Confirm { name: "branch-force-delete", check: branch_force_delete },
        GuardRule::Confirm { name: "history-rewrite", check: history_rewrite },
        GuardRule::Confirm { name: "stash-pop", check: stash_pop },
        GuardRule::Confirm { name: "rm-recursive-outside", check: rm_recursive_outside },
        GuardRule::Confirm { name: "push-tags", check: push_tags },
        GuardRule::Confirm { name: "package-publish", check: package_publish },
        GuardRule::Confirm { name: "pipe-to-shell", check: pipe_to_shell },
    ]
}

// Nuclear deny

/// Top-level directories whose recursive removal wrecks the host.
const SYSTEM_DIRS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/lib32", "/lib64", "/opt", "/proc", "/root",
    "/sbin", "/srv", "/sys", "/usr", "/var", "/Users", "/System", "/Library", "/Applications",
];

/// Device nodes that are safe to read or write.
const SAFE_DEVICES: &[&str] = &[
    "/dev/null", "/dev/zero", "/dev/stdin", "/dev/stdout", "/dev/stderr", "/dev/tty", "/dev/random",
    "/dev/urandom",
];

/// Options of `git push` that take a value.
const PUSH_VALUE_OPTIONS: &[&str] = &["--repo", "-o", "--push-option", "--receive-pack", "--exec"];

/// Removal targets meaning "everything in the current directory".
const EVERYTHING_HERE: &[&str] = &[".", "./", "..", "../", "*", "./*", ".*"];

/// Pathspecs meaning "everything".
const WHOLE_TREE: &[&str] = &[".", "*", ":/", ":/*", "./"];

static FUNCTION_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z_:.][A-Za-z0-9_:.-]*)\s*\(\s*\)\s*\{([^}]*)\}").expect("valid regex")
});

fn fork_bomb(skeleton: &str) -> Option<Refusal> {
    for caps in FUNCTION_DEF.captures_iter(skeleton) {
        let name = &caps[1];
        let body: String = caps[2].chars().filter(|c| !c.is_whitespace()).collect();
        if body.contains(&format!("{name}|{name}")) {
            return Some(Refusal::new(format!(
                "function `{name}` pipes into itself: fork bomb"
            )));
        }
    }
    None
}

fn is_catastrophic(path: &Path, ctx: &GuardContext) -> bool {
    path == Path::new("/")
        || ctx.home.as_deref() == Some(path)
        || SYSTEM_DIRS.iter().any(|dir| path == Path::new(dir))
}

fn is_recursive(cmd: &SimpleCommand<'_>) -> bool {
    has_short(&cmd.args, 'r') || has_short(&cmd.args, 'R') || has_long(&cmd.args, "--recursive")
}

fn is_recursive_rm(cmd: &SimpleCommand<'_>) -> bool {
    cmd.program == "rm" && is_recursive(cmd)
}

fn rm_catastrophic(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<Refusal> {
    let targets: Vec<&Word> = match cmd.program.as_str() {
        "rm" if is_recursive(cmd) => {
            if has_long(&cmd.args, "--no-preserve-root") {
                return Some(Refusal::new("rm --no-preserve-root disables the last safety net"));
            }
            positionals(&cmd.args, &[])
        }
        "find" if cmd.arg_texts().any(|a| a == "-delete") => cmd
            .args
            .iter()
            .copied()
            .take_while(|w| !w.text.starts_with('-') && w.text != "(" && w.text != "!")
            .collect(),
        _ => return None,
    };

    targets.into_iter().find_map(|word| {
        let target = resolve_target(word, ctx);
        let scope = target.scope()?;
        is_catastrophic(scope, ctx).then(|| {
            Refusal::new(format!(
                "recursive removal of `{}` resolves to {}",
                word.text,
                scope.display()
            ))
            .suggest("remove the specific files or directories you mean")
        })
    })
}

fn rm_everything_here(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<Refusal> {
    if !is_recursive_rm(cmd) {
        return None;
    }
    let root = ctx.project_root();
    positionals(&cmd.args, &[]).into_iter().find_map(|word| {
        let text = word.text.as_str();
        let bare = EVERYTHING_HERE.contains(&text);
        let whole_project = match resolve_target(word, ctx) {
            Target::ChildrenOf(dir) => dir == root,
            _ => false,
        };
        (bare || whole_project).then(|| {
            Refusal::new(format!("recursive removal of `{text}` wipes the whole directory"))
                .suggest("name the files or directories to remove")
        })
    })
}

fn git_reset_hard(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    (git.is("reset") && git.has_long("--hard")).then(|| {
        Refusal::new("git reset --hard discards uncommitted work irrecoverably")
            .suggest("gatehouse checkpoint create, then git stash or git reset --soft")
    })
}

fn git_clean_force(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    let forced = git.has_short('f') || git.has_long("--force");
    let dry_run = git.has_short('n') || git.has_long("--dry-run");
    (git.is("clean") && forced && !dry_run).then(|| {
        Refusal::new("git clean -f deletes untracked files irrecoverably").suggest("git clean -n to preview")
    })
}

fn git_discard_worktree(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    let whole_tree = || {
        git.positionals(&[])
            .iter()
            .any(|w| WHOLE_TREE.contains(&w.text.as_str()))
    };
    let discards = match git.subcommand.as_str() {
        "checkout" => git.has_short('f') || git.has_long("--force") || whole_tree(),
        "restore" => {
            let staged_only = (git.has_short('S') || git.has_long("--staged"))
                && !(git.has_short('W') || git.has_long("--worktree"));
            whole_tree() && !staged_only
        }
        _ => false,
    };
    discards.then(|| {
        Refusal::new(format!("git {} discards all uncommitted changes", git.subcommand))
            .suggest("gatehouse checkpoint create first, or git stash")
    })
}

fn git_stash_destroy(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    let action = git.action()?;
    (git.is("stash") && matches!(action, "drop" | "clear"))
        .then(|| Refusal::new(format!("git stash {action} destroys stashed work")))
}

fn git_push_destructive(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    if !git.is("push") {
        return None;
    }
    if git.has_long("--mirror") {
        return Some(Refusal::new("git push --mirror overwrites every remote ref"));
    }
    if git.has_long("--delete") || git.has_short('d') || git.has_long("--prune") {
        return Some(Refusal::new("git push deleting remote branches"));
    }
    let positionals = git.positionals(PUSH_VALUE_OPTIONS);
    positionals
        .iter()
        .skip(1)
        .find(|w| w.text.len() > 1 && w.text.trim_start_matches('+').starts_with(':'))
        .map(|w| Refusal::new(format!("refspec `{}` deletes a remote branch", w.text)))
}

fn protected_branch_delete(cmd: &SimpleCommand<'_>, _: &GuardContext, policy: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    let deleting = git.has_short('d') || git.has_short('D') || git.has_long("--delete");
    let names_protected = || {
        git.positionals(&[])
            .iter()
            .any(|w| w.text == policy.protected_branch)
    };
    (git.is("branch") && deleting && names_protected()).then(|| {
        Refusal::new(format!(
            "deleting protected branch `{}`",
            policy.protected_branch
        ))
    })
}

fn worktree_force_remove(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    let forced = git.has_short('f') || git.has_long("--force");
    (git.is("worktree") && git.action() == Some("remove") && forced).then(|| {
        Refusal::new("forced worktree removal discards the workspace's uncommitted changes")
            .suggest("gatehouse workspace remove <id>")
    })
}

fn disk_format(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    (cmd.program.starts_with("mkfs") || cmd.program == "wipefs")
        .then(|| Refusal::new(format!("{} erases a filesystem", cmd.program)))
}

fn is_raw_device(path: &str) -> bool {
    path.starts_with("/dev/")
        && !SAFE_DEVICES.contains(&path)
        && !path.starts_with("/dev/fd/")
        && !path.starts_with("/dev/pts/")
}

fn dd_device(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    if cmd.program != "dd" {
        return None;
    }
    cmd.arg_texts()
        .filter_map(|a| a.strip_prefix("of="))
        .find(|target| is_raw_device(target))
        .map(|target| Refusal::new(format!("dd writing to device {target}")))
}

fn shred(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    (cmd.program == "shred").then(|| Refusal::new("shred makes file contents unrecoverable"))
}

fn recursive_permissions_root(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<Refusal> {
    if !matches!(cmd.program.as_str(), "chmod" | "chown" | "chgrp") || !is_recursive(cmd) {
        return None;
    }
    positionals(&cmd.args, &[]).into_iter().find_map(|word| {
        let target = resolve_target(word, ctx);
        let scope = target.scope()?;
        is_catastrophic(scope, ctx)
            .then(|| Refusal::new(format!("recursive {} on {}", cmd.program, scope.display())))
    })
}

fn device_redirect(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Refusal> {
    cmd.redirects
        .iter()
        .find(|r| r.op.contains('>') && is_raw_device(&r.target.text))
        .map(|r| Refusal::new(format!("redirecting output onto device {}", r.target.text)))
}

// Branch protection

fn on_protected_branch(ctx: &GuardContext, policy: &Policy) -> bool {
    ctx.current_branch.as_deref() == Some(policy.protected_branch.as_str())
}

fn protected_branch_commit(cmd: &SimpleCommand<'_>, ctx: &GuardContext, policy: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    if ctx.is_in_workspace() || !on_protected_branch(ctx, policy) {
        return None;
    }
    let mutating = matches!(
        git.subcommand.as_str(),
        "commit" | "merge" | "rebase" | "cherry-pick" | "revert" | "am" | "pull" | "reset"
    );
    let recovering = ["--abort", "--quit", "--skip"].iter().any(|f| git.has_long(f));
    (mutating && !recovering).then(|| {
        Refusal::new(format!(
            "git {} would modify protected branch `{}` directly",
            git.subcommand, policy.protected_branch
        ))
        .suggest("gatehouse session start <branch> and work in the workspace")
    })
}

fn protected_branch_push(cmd: &SimpleCommand<'_>, ctx: &GuardContext, policy: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    if !git.is("push") {
        return None;
    }
    let refusal = || {
        Refusal::new(format!("push to protected branch `{}`", policy.protected_branch))
            .suggest("push the workspace branch and open a merge request")
    };
    if git.has_long("--all") {
        return Some(refusal());
    }

    let positionals = git.positionals(PUSH_VALUE_OPTIONS);
    let refspecs = positionals.get(1..).unwrap_or(&[]);
    if refspecs.is_empty() {
        // Pushes the current branch.
        return (on_protected_branch(ctx, policy) && !git.has_long("--tags")).then(refusal);
    }

    let targets_protected = refspecs.iter().any(|spec| {
        let spec = spec.text.trim_start_matches('+');
        let destination = spec.rsplit_once(':').map(|(_, dst)| dst).unwrap_or(spec);
        let destination = destination.strip_prefix("refs/heads/").unwrap_or(destination);
        destination == policy.protected_branch
            || (destination == "HEAD" && on_protected_branch(ctx, policy))
    });
    targets_protected.then(refusal)
}

fn protected_ref_move(cmd: &SimpleCommand<'_>, _: &GuardContext, policy: &Policy) -> Option<Refusal> {
    let git = cmd.git()?;
    let protected_ref = format!("refs/heads/{}", policy.protected_branch);
    let first = git.positionals(&[]).first().map(|w| w.text.clone());
    let moves = match git.subcommand.as_str() {
        "branch" => {
            (git.has_short('f') || git.has_long("--force"))
                && first.as_deref() == Some(policy.protected_branch.as_str())
        }
        "update-ref" => first.as_deref() == Some(protected_ref.as_str()),
        _ => false,
    };
    moves.then(|| Refusal::new(format!("moving protected branch `{}`", policy.protected_branch)))
}

// Path safety

/// Shared temp directories, longest first.
const SHARED_TEMP_DIRS: &[&str] = &["/var/tmp", "/dev/shm", "/tmp"];

fn cwd_containment(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<PathAction> {
    if !is_recursive_rm(cmd) && cmd.program != "rmdir" {
        return None;
    }
    positionals(&cmd.args, &[]).into_iter().find_map(|word| {
        let target = resolve_target(word, ctx);
        ctx.occupied_dirs()
            .filter(|dir| target.covers(dir))
            .map(|dir| {
                PathAction::Deny(
                    Refusal::new(format!(
                        "removing `{}` would delete the working directory {}",
                        word.text,
                        dir.display()
                    ))
                    .suggest("cd to a parent directory first, or remove the contents only"),
                )
            })
            .next()
    })
}

fn unresolved_removal(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<PathAction> {
    if !is_recursive_rm(cmd) {
        return None;
    }
    positionals(&cmd.args, &[])
        .into_iter()
        .find(|word| resolve_target(word, ctx) == Target::Unknown)
        .map(|word| {
            PathAction::Deny(
                Refusal::new(format!(
                    "cannot tell what `{}` removes before the shell expands it",
                    word.text
                ))
                .suggest("spell the path out, or cd to a literal directory first"),
            )
        })
}

fn shared_temp_delete(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<PathAction> {
    if !is_recursive_rm(cmd) {
        return None;
    }
    positionals(&cmd.args, &[]).into_iter().find_map(|word| {
        let target = resolve_target(word, ctx);
        let scope = target.scope()?;
        SHARED_TEMP_DIRS
            .iter()
            .any(|dir| scope == Path::new(dir))
            .then(|| {
                PathAction::Deny(Refusal::new(format!(
                    "`{}` removes a temp directory shared by every process on the host",
                    word.text
                )))
            })
    })
}

fn shared_temp_redirect(cmd: &SimpleCommand<'_>, ctx: &GuardContext, policy: &Policy) -> Option<PathAction> {
    let root = ctx.workspace_root.as_deref()?;
    let local = root.join(&policy.local_temp_dir);

    let edits: Vec<Edit> = cmd
        .args
        .iter()
        .copied()
        .chain(cmd.redirects.iter().map(|r| &r.target))
        .filter(|word| {
            let path = word.text.rsplit_once('=').map(|(_, p)| p).unwrap_or(&word.text);
            !Path::new(path).starts_with(root)
        })
        .filter_map(|word| temp_edit(word, cmd.raw(word), &local))
        .collect();

    if edits.is_empty() {
        return None;
    }
    Some(PathAction::Rewrite(Rewriting {
        edits,
        reason: format!("shared temp paths redirected to {}", local.display()),
        ensure_dir: Some(local),
    }))
}

/// Edit replacing the first shared temp prefix in a word with `local`.
fn temp_edit(word: &Word, raw: &str, local: &Path) -> Option<Edit> {
    for prefix in SHARED_TEMP_DIRS {
        let mut search = 0;
        while let Some(found) = raw[search..].find(prefix) {
            let at = search + found;
            let before = raw[..at].chars().next_back();
            let after = raw[at + prefix.len()..].chars().next();
            let starts_path = matches!(before, None | Some('"') | Some('\'') | Some('='));
            let ends_component = matches!(after, None | Some('/') | Some('"') | Some('\''));
            if starts_path && ends_component {
                let replacement = quote_in_context(&local.to_string_lossy(), quote_state(&raw[..at]));
                let start = word.span.start + at;
                return Some(Edit::replace(start..start + prefix.len(), replacement));
            }
            search = at + prefix.len();
        }
    }
    None
}

/// Quote character open at the end of `prefix`, if any.
fn quote_state(prefix: &str) -> Option<char> {
    let mut open: Option<char> = None;
    let mut escaped = false;
    for c in prefix.chars() {
        match (open, c) {
            (_, _) if escaped => escaped = false,
            (Some('\''), '\'') => open = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (Some('"'), '"') => open = None,
            (None, '\'' | '"') => open = Some(c),
            _ => {}
        }
    }
    open
}

/// Render `text` so it reads literally inside the given quoting context.
fn quote_in_context(text: &str, quote: Option<char>) -> String {
    match quote {
        Some('\'') => text.replace('\'', r"'\''"),
        Some(_) => text
            .chars()
            .flat_map(|c| match c {
                '"' | '\\' | '$' | '`' => vec!['\\', c],
                _ => vec![c],
            })
            .collect(),
        None => shell_quote(text),
    }
}

/// Quote a value for the shell when it contains special characters.
pub fn shell_quote(text: &str) -> String {
    let plain = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

// Rewrite

fn force_with_lease(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Rewriting> {
    let git = cmd.git()?;
    if !git.is("push") {
        return None;
    }

    let mut edits = Vec::new();
    let mut plus_refspec = false;
    let mut lease_flag = false;
    let mut after_separator = false;
    for (index, word) in git.args.iter().enumerate() {
        let text = word.text.as_str();
        if text == "--" {
            after_separator = true;
            continue;
        }
        if !after_separator && text == "--force" {
            edits.push(Edit::replace(word.span.clone(), "--force-with-lease"));
            lease_flag = true;
        } else if !after_separator && is_short_bundle(text) && text.contains('f') {
            let rest: String = text[1..].chars().filter(|&c| c != 'f').collect();
            let replacement = if rest.is_empty() {
                "--force-with-lease".to_string()
            } else {
                format!("--force-with-lease -{rest}")
            };
            edits.push(Edit::replace(word.span.clone(), replacement));
            lease_flag = true;
        } else if text.starts_with('+') && text.len() > 1 && is_refspec_position(&git.args, index) {
            edits.push(Edit::replace(word.span.clone(), shell_quote(&text[1..])));
            plus_refspec = true;
        }
    }

    if plus_refspec && !lease_flag && !git.has_long("--force-with-lease") {
        edits.push(Edit::insert(git.subcommand_word.span.end, " --force-with-lease"));
    }

    (!edits.is_empty()).then(|| Rewriting {
        edits,
        reason: "unconditional force push replaced with --force-with-lease".to_string(),
        ensure_dir: None,
    })
}

/// Whether `args[index]` is a refspec rather than the remote or an option value.
fn is_refspec_position(args: &[&Word], index: usize) -> bool {
    let mut positional = 0;
    let mut skip_next = false;
    for (i, word) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        let text = word.text.as_str();
        if PUSH_VALUE_OPTIONS.contains(&text) {
            skip_next = true;
            continue;
        }
        if text.starts_with('-') {
            continue;
        }
        if i == index {
            return positional >= 1;
        }
        positional += 1;
    }
    false
}

fn no_verify_strip(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<Rewriting> {
    let git = cmd.git()?;
    if !matches!(git.subcommand.as_str(), "commit" | "push" | "merge") {
        return None;
    }
    let edits: Vec<Edit> = git
        .args
        .iter()
        .take_while(|w| w.text != "--")
        .filter(|w| w.text == "--no-verify")
        .map(|w| {
            let start = if cmd.source[..w.span.start].ends_with(' ') {
                w.span.start - 1
            } else {
                w.span.start
            };
            Edit::replace(start..w.span.end, "")
        })
        .collect();
    (!edits.is_empty()).then(|| Rewriting {
        edits,
        reason: "--no-verify removed so repository hooks still run".to_string(),
        ensure_dir: None,
    })
}

// Confirm

fn branch_force_delete(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<String> {
    let git = cmd.git()?;
    let forced = git.has_short('D') || (git.has_short('d') && (git.has_short('f') || git.has_long("--force")));
    if !git.is("branch") || !forced {
        return None;
    }
    let names: Vec<String> = git.positionals(&[]).iter().map(|w| w.text.clone()).collect();
    Some(format!(
        "force-delete branch {} without checking it was merged?",
        names.join(", ")
    ))
}

fn history_rewrite(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<String> {
    let git = cmd.git()?;
    match git.subcommand.as_str() {
        "rebase" => {
            let continuing = ["--abort", "--continue", "--skip", "--quit"]
                .iter()
                .any(|f| git.has_long(f));
            (!continuing).then(|| "rebase rewrites the branch history; continue?".to_string())
        }
        "filter-branch" | "filter-repo" => {
            Some(format!("git {} rewrites repository history; continue?", git.subcommand))
        }
        _ => None,
    }
}

fn stash_pop(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<String> {
    let git = cmd.git()?;
    (git.is("stash") && git.action() == Some("pop"))
        .then(|| "stash pop may conflict with current changes and drops the stash; continue?".to_string())
}

fn rm_recursive_outside(cmd: &SimpleCommand<'_>, ctx: &GuardContext, _: &Policy) -> Option<String> {
    if !is_recursive_rm(cmd) {
        return None;
    }
    let root = ctx.project_root();
    positionals(&cmd.args, &[]).into_iter().find_map(|word| {
        let target = resolve_target(word, ctx);
        let scope = target.scope()?;
        (!scope.starts_with(root)).then(|| {
            format!(
                "recursively remove {} outside {}?",
                scope.display(),
                root.display()
            )
        })
    })
}

fn push_tags(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<String> {
    let git = cmd.git()?;
    (git.is("push") && git.has_long("--tags")).then(|| "publish all local tags to the remote?".to_string())
}

fn package_publish(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<String> {
    let action = cmd.arg_texts().find(|a| !a.starts_with('-'));
    let publishes = match cmd.program.as_str() {
        "cargo" | "npm" | "pnpm" | "yarn" => action == Some("publish"),
        "twine" => action == Some("upload"),
        "gem" => action == Some("push"),
        _ => false,
    };
    publishes.then(|| format!("`{}` publishes a release to a public registry; continue?", cmd.normalized()))
}

fn pipe_to_shell(cmd: &SimpleCommand<'_>, _: &GuardContext, _: &Policy) -> Option<String> {
    let upstream = cmd.upstream.as_deref()?;
    (matches!(upstream, "curl" | "wget") && cmd.is_bare_shell())
        .then(|| format!("run a script downloaded by {upstream} directly in {}?", cmd.program))
}
