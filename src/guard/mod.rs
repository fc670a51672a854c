// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command guard.
//!
//! Classifies every proposed shell command as allow, deny, rewrite or
//! confirm before it runs. Classification is synchronous and side-effect
//! free: the caller decides what to do with the [`Verdict`].
//!
//! # Evaluation
//!
//! The command line is tokenized ([`lexer`]), split into simple commands,
//! and each command is normalized ([`command`]) so wrappers like `sudo` or
//! `env` never hide the program that runs. Command substitutions and
//! `sh -c` payloads are classified recursively. Rules then run tier by tier
//! ([`Tier::ALL`]):
//!
//! 1. nuclear deny
//! 2. branch protection
//! 3. deployment deny patterns
//! 4. path safety
//! 5. rewrite
//! 6. confirm
//! 7. allow
//!
//! Within one simple command the first tier that matches wins. Across the
//! whole line any denial wins (the highest tier is reported); otherwise a
//! confirmation beats a rewrite, which beats allow. Input the lexer cannot
//! account for is denied, and so is a program name that is only known after
//! expansion (`$x`, `$(...)`, `$'...'`).
//!
//! Paths resolve against the directory the shell is in at that point of the
//! line: a literal `cd` moves it for the rest of its subshell, and after a
//! `cd` that cannot be resolved relative paths count as unknown.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatehouse::guard::{Guard, GuardContext, Policy, Verdict};
//!
//! let guard = Guard::new(Policy::default());
//! let ctx = GuardContext::new("/work/repo").on_branch("feat/auth");
//! match guard.classify("git push -f origin feat/auth", &ctx) {
//!     Verdict::Rewrite { command, .. } => assert!(command.contains("--force-with-lease")),
//!     other => panic!("unexpected {other}"),
//! }
//! ```

pub mod command;
pub mod lexer;
pub mod rules;
mod verdict;

use std::path::PathBuf;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::error::{ConfigError, ControlError};
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;
use crate::telemetry::TimedOperation;

use self::command::SimpleCommand;
use self::lexer::{lex, LexError};
use self::rules::{builtin_rules, Outcome, Rewriting};

pub use self::rules::GuardRule;
pub use self::verdict::{Edit, GuardContext, Policy, Refusal, ShellDir, Tier, Verdict};

/// Rule name reported when a command cannot be tokenized.
pub const UNPARSEABLE_RULE: &str = "unparseable";

/// Deepest nesting of substitutions and `sh -c` payloads that is classified.
const MAX_NESTING: usize = 4;

/// The command guard: an ordered rule set plus the policy it enforces.
#[derive(Debug, Clone)]
pub struct Guard {
    policy: Policy,
    rules: Vec<GuardRule>,
}

impl Guard {
    /// Guard with the built-in rules.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            rules: builtin_rules(),
        }
    }

    /// Guard configured from resolved configuration, including custom patterns.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, ConfigError> {
        let policy = Policy {
            protected_branch: config.protected_branch.clone(),
            local_temp_dir: config.local_temp_dir.clone(),
        };
        let mut guard = Self::new(policy);

        for (index, pattern) in config.deny_patterns.iter().enumerate() {
            let pattern = Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("denyPatterns", e.to_string()))?;
            guard.rules.push(GuardRule::Deny {
                name: format!("deny-pattern-{}", index + 1),
                pattern,
            });
        }
        for (index, pattern) in config.confirm_patterns.iter().enumerate() {
            let pattern = Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("confirmPatterns", e.to_string()))?;
            guard.rules.push(GuardRule::ConfirmPattern {
                name: format!("confirm-pattern-{}", index + 1),
                pattern,
            });
        }
        Ok(guard)
    }

    /// Add a rule. Its tier, not its position, decides when it runs.
    pub fn with_rule(mut self, rule: GuardRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn rules(&self) -> &[GuardRule] {
        &self.rules
    }

    /// Classify a command. Pure: no logging, metrics or I/O.
    pub fn classify(&self, command: &str, ctx: &GuardContext) -> Verdict {
        let mut assessment = Assessment::default();
        match self.assess(command, ctx, 0, Some(0), &mut assessment) {
            Ok(()) => assessment.into_verdict(command),
            Err(err) => Verdict::Deny {
                rule: UNPARSEABLE_RULE.to_string(),
                tier: Tier::NuclearDeny,
                reason: format!("cannot classify command: {err}"),
                suggestion: Some("simplify the command or split it into separate steps".to_string()),
            },
        }
    }

    /// Classify a command, logging the outcome and recording verdict metrics.
    pub fn check(&self, command: &str, ctx: &GuardContext) -> Verdict {
        let _timer = TimedOperation::start("guard.classify");
        let verdict = self.classify(command, ctx);

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_verdict(verdict.kind());

        match &verdict {
            Verdict::Allow => debug!(command, "Command allowed"),
            Verdict::Deny { rule, tier, reason, .. } => {
                warn!(command, rule = %rule, tier = %tier, "Command denied: {}", reason)
            }
            Verdict::Rewrite { rules, command: rewritten, .. } => {
                info!(command, rewritten = %rewritten, rules = ?rules, "Command rewritten")
            }
            Verdict::Confirm { rules, prompt, .. } => {
                info!(command, rules = ?rules, "Confirmation required: {}", prompt)
            }
        }
        verdict
    }

    /// Like [`Guard::check`], but denials become errors.
    pub fn enforce(&self, command: &str, ctx: &GuardContext) -> Result<Verdict, ControlError> {
        match self.check(command, ctx) {
            Verdict::Deny { rule, reason, .. } if rule == UNPARSEABLE_RULE => {
                Err(ControlError::UnparseableCommand(reason))
            }
            Verdict::Deny { rule, reason, .. } => Err(ControlError::policy(rule, reason)),
            verdict => Ok(verdict),
        }
    }

    /// Classify `source` into `out`. `offset` locates `source` in the top-level
    /// command when it appears there verbatim.
    fn assess(
        &self,
        source: &str,
        ctx: &GuardContext,
        depth: usize,
        offset: Option<usize>,
        out: &mut Assessment,
    ) -> Result<(), LexError> {
        if depth > MAX_NESTING {
            out.deny(
                Tier::NuclearDeny,
                UNPARSEABLE_RULE,
                Refusal::new(format!("more than {MAX_NESTING} levels of nested commands")),
            );
            return Ok(());
        }

        let lexed = match lex(source) {
            Ok(lexed) => lexed,
            // `$()` runs nothing.
            Err(LexError::Empty) if depth > 0 => return Ok(()),
            Err(err) => return Err(err),
        };

        for rule in &self.rules {
            if let Some(refusal) = rule.evaluate_text(&lexed.skeleton) {
                out.deny(rule.tier(), rule.name(), refusal);
            }
        }

        // Context per subshell depth; a `cd` only moves its own subshell.
        let mut scopes: Vec<GuardContext> = vec![ctx.clone()];
        let mut previous: Option<String> = None;
        for segment in &lexed.segments {
            scopes.truncate(segment.subshell + 1);
            while scopes.len() <= segment.subshell {
                let inner = scopes.last().cloned().unwrap_or_else(|| ctx.clone());
                scopes.push(inner);
            }
            let local = scopes.last().cloned().unwrap_or_else(|| ctx.clone());

            let upstream = if segment.piped_from { previous.take() } else { None };
            let cmd = SimpleCommand::from_segment(segment, source, upstream);
            previous = cmd.as_ref().map(|c| c.program.clone());
            let Some(cmd) = cmd else {
                continue;
            };

            if cmd.program_word.expands {
                out.deny(
                    Tier::NuclearDeny,
                    UNPARSEABLE_RULE,
                    Refusal::new(format!(
                        "program `{}` is only known after expansion",
                        cmd.raw(cmd.program_word)
                    ))
                    .suggest("name the program literally"),
                );
                continue;
            }

            self.assess_command(&cmd, &local, offset, out);
            if let Some(dir) = cmd.directory_change(&local) {
                if let Some(scope) = scopes.last_mut() {
                    scope.shell_dir = dir;
                }
            }

            if let Some(payload) = cmd.shell_payload() {
                let raw = cmd.raw(payload);
                let inner = if raw == payload.text {
                    Some(payload.span.start)
                } else if raw.len() == payload.text.len() + 2 && raw.starts_with('\'') {
                    Some(payload.span.start + 1)
                } else {
                    None
                };
                let nested_offset = offset.zip(inner).map(|(a, b)| a + b);
                self.assess(&payload.text, &local, depth + 1, nested_offset, out)?;
            }
            if cmd.program == "eval" && !cmd.args.is_empty() {
                let script = cmd.arg_texts().collect::<Vec<_>>().join(" ");
                self.assess(&script, &local, depth + 1, None, out)?;
            }
        }

        for nested in &lexed.nested {
            let nested_offset = offset.zip(nested.offset).map(|(a, b)| a + b);
            self.assess(&nested.source, ctx, depth + 1, nested_offset, out)?;
        }
        Ok(())
    }

    /// Run the tiers against one simple command.
    fn assess_command(
        &self,
        cmd: &SimpleCommand<'_>,
        ctx: &GuardContext,
        offset: Option<usize>,
        out: &mut Assessment,
    ) {
        let mut rewrites: Vec<(&str, Rewriting)> = Vec::new();
        let mut confirms: Vec<(&str, String)> = Vec::new();

        for tier in Tier::ALL {
            for rule in self.rules.iter().filter(|r| r.tier() == tier) {
                match rule.evaluate(cmd, ctx, &self.policy) {
                    None => {}
                    Some(Outcome::Deny(refusal)) => {
                        out.deny(tier, rule.name(), refusal);
                        return;
                    }
                    Some(Outcome::Rewrite(rewriting)) => rewrites.push((rule.name(), rewriting)),
                    Some(Outcome::Confirm(prompt)) => confirms.push((rule.name(), prompt)),
                }
            }
            // First matching tier wins for this command.
            if !rewrites.is_empty() || !confirms.is_empty() {
                break;
            }
        }

        for (rule, rewriting) in rewrites {
            match offset {
                Some(offset) => out.rewrite(rule, rewriting, offset),
                None => out.confirm(
                    rule,
                    format!(
                        "nested command `{}` needs rewriting ({}); run it anyway?",
                        cmd.normalized(),
                        rewriting.reason
                    ),
                ),
            }
        }
        for (rule, prompt) in confirms {
            out.confirm(rule, prompt);
        }
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

/// Findings accumulated across every simple command of one input.
#[derive(Debug, Default)]
struct Assessment {
    denial: Option<(Tier, String, Refusal)>,
    edits: Vec<Edit>,
    ensure_dirs: Vec<PathBuf>,
    rewrite_rules: Vec<String>,
    rewrite_reasons: Vec<String>,
    confirm_rules: Vec<String>,
    prompts: Vec<String>,
}

impl Assessment {
    fn deny(&mut self, tier: Tier, rule: &str, refusal: Refusal) {
        let replaces = match &self.denial {
            Some((current, ..)) => tier < *current,
            None => true,
        };
        if replaces {
            self.denial = Some((tier, rule.to_string(), refusal));
        }
    }

    fn rewrite(&mut self, rule: &str, rewriting: Rewriting, offset: usize) {
        self.edits
            .extend(rewriting.edits.into_iter().map(|edit| edit.shifted(offset)));
        if let Some(dir) = rewriting.ensure_dir {
            if !self.ensure_dirs.contains(&dir) {
                self.ensure_dirs.push(dir);
            }
        }
        push_unique(&mut self.rewrite_rules, rule);
        push_unique(&mut self.rewrite_reasons, &rewriting.reason);
    }

    fn confirm(&mut self, rule: &str, prompt: String) {
        push_unique(&mut self.confirm_rules, rule);
        push_unique(&mut self.prompts, &prompt);
    }

    fn into_verdict(self, command: &str) -> Verdict {
        if let Some((tier, rule, refusal)) = self.denial {
            return Verdict::Deny {
                rule,
                tier,
                reason: refusal.reason,
                suggestion: refusal.suggestion,
            };
        }

        let rewritten = apply_edits(command, self.edits, &self.ensure_dirs);
        if !self.prompts.is_empty() {
            let mut rules = self.confirm_rules;
            for rule in self.rewrite_rules {
                push_unique(&mut rules, &rule);
            }
            return Verdict::Confirm {
                rules,
                prompt: self.prompts.join("; "),
                command: rewritten,
            };
        }
        if !self.rewrite_rules.is_empty() {
            return Verdict::Rewrite {
                rules: self.rewrite_rules,
                command: rewritten,
                reason: self.rewrite_reasons.join("; "),
            };
        }
        Verdict::Allow
    }
}

fn push_unique(items: &mut Vec<String>, item: &str) {
    if !items.iter().any(|existing| existing == item) {
        items.push(item.to_string());
    }
}

/// Apply non-overlapping edits, prefixing any directories the result needs.
fn apply_edits(command: &str, mut edits: Vec<Edit>, ensure_dirs: &[PathBuf]) -> String {
    edits.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.span.end.cmp(&a.span.end)));

    let mut text = command.to_string();
    let mut floor = usize::MAX;
    for edit in edits {
        if edit.span.end > floor || edit.span.end > text.len() {
            continue;
        }
        text.replace_range(edit.span.clone(), &edit.replacement);
        floor = edit.span.start;
    }

    let prefix: String = ensure_dirs
        .iter()
        .map(|dir| format!("mkdir -p {} && ", rules::shell_quote(&dir.to_string_lossy())))
        .collect();
    format!("{prefix}{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> Guard {
        Guard::default()
    }

    fn outside() -> GuardContext {
        GuardContext::new("/work/repo")
            .on_branch("main")
            .with_home("/home/dev")
    }

    fn workspace() -> GuardContext {
        GuardContext::new("/work/repo.worktrees/feat-auth")
            .in_workspace("/work/repo.worktrees/feat-auth")
            .on_branch("feat/auth")
            .with_home("/home/dev")
    }

    fn denied_by(verdict: &Verdict) -> (&str, Tier) {
        match verdict {
            Verdict::Deny { rule, tier, .. } => (rule.as_str(), *tier),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    fn rewritten(verdict: &Verdict) -> &str {
        match verdict {
            Verdict::Rewrite { command, .. } => command,
            other => panic!("expected rewrite, got {other:?}"),
        }
    }

    #[test]
    fn test_rm_rf_root_is_nuclear() {
        for cmd in [
            "rm -rf /",
            "rm -rf / --verbose",
            "rm -fr /*",
            "sudo rm -Rf /",
            "rm -r -f ~",
            "rm -rf $HOME",
            "rm -rf \"/\"",
            "/bin/rm -rf /usr",
            "rm --recursive --force /etc/",
            "rm -rf --no-preserve-root /",
            "FOO=1 env rm -rf /",
        ] {
            let verdict = guard().classify(cmd, &outside());
            assert_eq!(denied_by(&verdict).1, Tier::NuclearDeny, "{cmd}");
        }
    }

    #[test]
    fn test_patterns_inside_arguments_are_not_commands() {
        for cmd in [
            "echo 'rm -rf /'",
            "git commit -m \"never run rm -rf / or git reset --hard\"",
            "grep -r 'git push --force' docs/",
            "cat rm-rf-notes.txt",
            "ls # rm -rf /",
        ] {
            let ctx = workspace();
            assert_eq!(guard().classify(cmd, &ctx), Verdict::Allow, "{cmd}");
        }
    }

    #[test]
    fn test_obfuscated_commands_are_caught() {
        for cmd in [
            "echo ok && rm -rf /",
            "true; git reset --hard HEAD~1",
            "echo $(rm -rf /)",
            "echo `git clean -fdx`",
            "bash -c 'git reset --hard'",
            "sh -c \"rm -rf ~\"",
            "eval git reset --hard",
            "\\rm -rf /",
            "(cd /tmp && git reset --hard)",
            "git -C ../other reset --hard",
            "xargs rm -rf /",
            "$'rm' -rf /",
            "$'\\x72m' -rf /",
            "$(echo rm) -rf /",
            "`echo rm` -rf /",
            "x=rm; $x -rf /",
            "sudo \"$CMD\" -rf /",
        ] {
            let verdict = guard().classify(cmd, &workspace());
            assert!(verdict.is_deny(), "{cmd}: {verdict:?}");
        }
    }

    #[test]
    fn test_git_destructive_operations() {
        let cases = [
            ("git reset --hard", "git-reset-hard"),
            ("git clean -fd", "git-clean-force"),
            ("git checkout -- .", "git-discard-worktree"),
            ("git checkout .", "git-discard-worktree"),
            ("git restore .", "git-discard-worktree"),
            ("git stash drop", "git-stash-destroy"),
            ("git stash clear", "git-stash-destroy"),
            ("git push --mirror origin", "git-push-destructive"),
            ("git push origin --delete feat", "git-push-destructive"),
            ("git push origin :feat", "git-push-destructive"),
            ("git branch -D main", "protected-branch-delete"),
            ("git worktree remove --force ../x", "worktree-force-remove"),
        ];
        for (cmd, rule) in cases {
            let verdict = guard().classify(cmd, &workspace());
            assert_eq!(denied_by(&verdict), (rule, Tier::NuclearDeny), "{cmd}");
        }
    }

    #[test]
    fn test_safe_git_variants_are_allowed() {
        for cmd in [
            "git reset --soft HEAD~1",
            "git clean -n",
            "git checkout -- src/lib.rs",
            "git restore --staged .",
            "git stash list",
            "git push origin feat/auth",
            "git status",
        ] {
            assert_eq!(guard().classify(cmd, &workspace()), Verdict::Allow, "{cmd}");
        }
    }

    #[test]
    fn test_host_destruction() {
        for (cmd, rule) in [
            ("mkfs.ext4 /dev/sdb1", "disk-format"),
            ("dd if=/dev/zero of=/dev/sda bs=1M", "dd-device"),
            ("shred -u secrets.txt", "shred"),
            ("chmod -R 777 /", "recursive-permissions-root"),
            ("cat image.iso > /dev/sdb", "device-redirect"),
            (":(){ :|:& };:", "fork-bomb"),
        ] {
            let verdict = guard().classify(cmd, &workspace());
            assert_eq!(denied_by(&verdict).0, rule, "{cmd}");
        }
        assert_eq!(
            guard().classify("dd if=/dev/zero of=/dev/null count=1", &workspace()),
            Verdict::Allow
        );
        assert_eq!(guard().classify("make 2>/dev/null", &workspace()), Verdict::Allow);
    }

    #[test]
    fn test_branch_protection_outside_workspace() {
        for cmd in [
            "git commit -m 'fix'",
            "git merge feat/auth",
            "git cherry-pick abc123",
            "git pull",
        ] {
            let verdict = guard().classify(cmd, &outside());
            assert_eq!(denied_by(&verdict), ("protected-branch-commit", Tier::BranchProtect), "{cmd}");
        }
        assert_eq!(guard().classify("git merge --abort", &outside()), Verdict::Allow);
        assert_eq!(guard().classify("git commit -m 'fix'", &workspace()), Verdict::Allow);

        let feature = GuardContext::new("/work/repo").on_branch("feat/x");
        assert_eq!(guard().classify("git commit -m x", &feature), Verdict::Allow);
    }

    #[test]
    fn test_push_to_protected_branch_from_anywhere() {
        for cmd in [
            "git push origin main",
            "git push origin HEAD:main",
            "git push origin feat:refs/heads/main",
            "git push --all origin",
        ] {
            let verdict = guard().classify(cmd, &workspace());
            assert_eq!(denied_by(&verdict).0, "protected-branch-push", "{cmd}");
        }
        let verdict = guard().classify("git push", &outside());
        assert_eq!(denied_by(&verdict).0, "protected-branch-push");
        assert_eq!(guard().classify("git push", &workspace()), Verdict::Allow);
    }

    #[test]
    fn test_force_push_to_protected_is_denied_not_rewritten() {
        let verdict = guard().classify("git push --force origin main", &workspace());
        assert_eq!(denied_by(&verdict).1, Tier::BranchProtect);
    }

    #[test]
    fn test_protected_branch_honours_policy() {
        let guard = Guard::new(Policy {
            protected_branch: "trunk".to_string(),
            ..Policy::default()
        });
        assert!(guard.classify("git push origin trunk", &workspace()).is_deny());
        assert_eq!(guard.classify("git push origin main", &workspace()), Verdict::Allow);
    }

    #[test]
    fn test_cwd_containment() {
        let ctx = GuardContext::new("/tmp/foo");
        let verdict = guard().classify("rm -rf /tmp/foo", &ctx);
        assert_eq!(denied_by(&verdict), ("cwd-containment", Tier::PathSafety));

        let ctx = GuardContext::new("/work/repo/src");
        for cmd in ["rm -r ../../repo", "rmdir .", "rm -rf /work/repo"] {
            let verdict = guard().classify(cmd, &ctx);
            assert_eq!(denied_by(&verdict).0, "cwd-containment", "{cmd}");
        }
        assert_eq!(guard().classify("rm -rf build", &ctx), Verdict::Allow);
    }

    #[test]
    fn test_expanded_program_fails_closed() {
        let verdict = guard().classify("$EDITOR notes.md", &workspace());
        assert_eq!(denied_by(&verdict), (UNPARSEABLE_RULE, Tier::NuclearDeny));
        let err = guard().enforce("x=rm; $x -rf /", &workspace()).unwrap_err();
        assert!(matches!(err, ControlError::UnparseableCommand(_)));
        // Expansions in arguments are fine.
        assert_eq!(guard().classify("echo $HOME", &workspace()), Verdict::Allow);
    }

    #[test]
    fn test_everything_here_is_nuclear() {
        let ctx = GuardContext::new("/work/repo/src");
        for cmd in ["rm -rf .", "rm -rf ..", "rm -rf *", "rm -rf ./*", "rm -r -f \".\"", "rm -rf /work/repo/src/*"] {
            let verdict = guard().classify(cmd, &ctx);
            assert_eq!(denied_by(&verdict), ("rm-everything-here", Tier::NuclearDeny), "{cmd}");
        }
        let verdict = guard().classify("rm -rf *", &workspace());
        assert_eq!(denied_by(&verdict), ("rm-everything-here", Tier::NuclearDeny));
        assert_eq!(guard().classify("rm -rf build/*", &ctx), Verdict::Allow);
    }

    #[test]
    fn test_cd_moves_path_resolution() {
        let ctx = GuardContext::new("/tmp/foo");
        for cmd in ["cd .. && rm -rf foo", "cd /tmp; rm -rf foo", "pushd /tmp && rm -rf foo/"] {
            let verdict = guard().classify(cmd, &ctx);
            assert_eq!(denied_by(&verdict).0, "cwd-containment", "{cmd}");
        }

        let ctx = GuardContext::new("/work/repo/src");
        let verdict = guard().classify("cd / && rm -rf *", &ctx);
        match &verdict {
            Verdict::Deny { rule, tier, reason, .. } => {
                assert_eq!((rule.as_str(), *tier), ("rm-root", Tier::NuclearDeny));
                assert!(reason.contains("resolves to /"), "{reason}");
            }
            other => panic!("expected deny, got {other:?}"),
        }

        let verdict = guard().classify("cd /opt/cache && rm -rf old", &ctx);
        assert_eq!(verdict.rule(), Some("rm-recursive-outside"));
    }

    #[test]
    fn test_cd_inside_subshell_does_not_leak() {
        let ctx = GuardContext::new("/tmp/foo");
        let verdict = guard().classify("(cd /opt) && rm -rf ../foo", &ctx);
        assert_eq!(denied_by(&verdict).0, "cwd-containment");
        let verdict = guard().classify("(cd build && rm -rf out); ls", &ctx);
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_unresolved_removal_is_denied() {
        let ctx = GuardContext::new("/work/repo/src");
        for cmd in ["rm -rf $BUILD_DIR", "cd $X && rm -rf foo", "cd - && rm -rf foo", "popd; rm -r out"] {
            let verdict = guard().classify(cmd, &ctx);
            assert_eq!(denied_by(&verdict), ("unresolved-removal", Tier::PathSafety), "{cmd}");
        }
        // Absolute paths stay resolvable after an unknown `cd`.
        assert_eq!(guard().classify("cd $X && rm -rf /work/repo/src/build", &ctx), Verdict::Allow);
        // Non-recursive commands are unaffected.
        assert_eq!(guard().classify("cd $X && ls foo", &ctx), Verdict::Allow);
    }

    #[test]
    fn test_cwd_containment_covers_workspace_root() {
        let ctx = GuardContext::new("/work/repo.worktrees/feat-auth/src")
            .in_workspace("/work/repo.worktrees/feat-auth");
        let verdict = guard().classify("rm -rf /work/repo.worktrees/feat-auth", &ctx);
        assert_eq!(denied_by(&verdict).0, "cwd-containment");
    }

    #[test]
    fn test_shared_temp_removal_denied() {
        let verdict = guard().classify("rm -rf /tmp", &outside());
        assert_eq!(denied_by(&verdict).0, "shared-temp-delete");
        let verdict = guard().classify("rm -rf /tmp/*", &outside());
        assert_eq!(denied_by(&verdict).0, "shared-temp-delete");
    }

    #[test]
    fn test_shared_temp_rewritten_inside_workspace() {
        let verdict = guard().classify("cargo test > /tmp/out.log", &workspace());
        insta::assert_snapshot!(
            rewritten(&verdict),
            @"mkdir -p /work/repo.worktrees/feat-auth/.tmp && cargo test > /work/repo.worktrees/feat-auth/.tmp/out.log"
        );

        let verdict = guard().classify("cp a.txt \"/tmp/my dir/\"", &workspace());
        assert!(rewritten(&verdict).ends_with("cp a.txt \"/work/repo.worktrees/feat-auth/.tmp/my dir/\""));

        let verdict = guard().classify("tool --out=/var/tmp/x", &workspace());
        assert!(rewritten(&verdict).ends_with("tool --out=/work/repo.worktrees/feat-auth/.tmp/x"));

        // Outside a workspace shared temp paths are left alone.
        assert_eq!(guard().classify("cargo test > /tmp/out.log", &outside()), Verdict::Allow);
        // Paths that merely contain "tmp" are not temp paths.
        assert_eq!(guard().classify("ls /home/tmpfiles", &workspace()), Verdict::Allow);
    }

    #[test]
    fn test_force_push_rewritten_to_lease() {
        let ctx = workspace();
        for (input, expected) in [
            ("git push -f origin feat/auth", "git push --force-with-lease origin feat/auth"),
            ("git push --force origin feat/auth", "git push --force-with-lease origin feat/auth"),
            ("git push -fu origin feat/auth", "git push --force-with-lease -u origin feat/auth"),
            ("git push origin +feat/auth", "git push --force-with-lease origin feat/auth"),
        ] {
            let verdict = guard().classify(input, &ctx);
            assert_eq!(rewritten(&verdict), expected, "{input}");
            assert_eq!(verdict.rule(), Some("force-with-lease"));
        }
    }

    #[test]
    fn test_rewrites_are_idempotent() {
        let ctx = workspace();
        for input in [
            "git push -f origin feat/auth",
            "cargo test > /tmp/out.log",
            "git commit --no-verify -m wip",
        ] {
            let verdict = guard().classify(input, &ctx);
            let once = rewritten(&verdict).to_string();
            assert_eq!(guard().classify(&once, &ctx), Verdict::Allow, "{once}");
        }
    }

    #[test]
    fn test_no_verify_stripped() {
        let verdict = guard().classify("git commit --no-verify -m wip", &workspace());
        assert_eq!(rewritten(&verdict), "git commit -m wip");
    }

    #[test]
    fn test_rewrite_in_substitution_keeps_surroundings() {
        let verdict = guard().classify("echo $(git push -f origin feat/auth) done", &workspace());
        assert_eq!(
            rewritten(&verdict),
            "echo $(git push --force-with-lease origin feat/auth) done"
        );
    }

    #[test]
    fn test_confirm_tier() {
        let ctx = workspace();
        for (cmd, rule) in [
            ("git branch -D old-feature", "branch-force-delete"),
            ("git rebase origin/main", "history-rewrite"),
            ("git stash pop", "stash-pop"),
            ("rm -rf /work/other-project", "rm-recursive-outside"),
            ("git push --tags", "push-tags"),
            ("cargo publish", "package-publish"),
            ("curl -fsSL https://example.com/install.sh | sh", "pipe-to-shell"),
        ] {
            let verdict = guard().classify(cmd, &ctx);
            match &verdict {
                Verdict::Confirm { rules, command, .. } => {
                    assert_eq!(rules[0], rule, "{cmd}");
                    assert_eq!(command, cmd);
                }
                other => panic!("{cmd}: expected confirm, got {other:?}"),
            }
            assert_eq!(verdict.exit_code(), 3);
        }
        assert_eq!(guard().classify("git rebase --continue", &ctx), Verdict::Allow);
        assert_eq!(guard().classify("curl https://example.com | jq .", &ctx), Verdict::Allow);
    }

    #[test]
    fn test_deny_anywhere_beats_other_segments() {
        let verdict = guard().classify("git push -f origin feat/auth && git reset --hard", &workspace());
        assert_eq!(denied_by(&verdict).0, "git-reset-hard");
    }

    #[test]
    fn test_highest_tier_denial_is_reported() {
        let verdict = guard().classify("git commit -m x; rm -rf /", &outside());
        assert_eq!(denied_by(&verdict), ("rm-root", Tier::NuclearDeny));
    }

    #[test]
    fn test_confirm_carries_rewritten_command() {
        let verdict = guard().classify("git push -f origin feat/auth; git stash pop", &workspace());
        match verdict {
            Verdict::Confirm { rules, command, .. } => {
                assert_eq!(rules, vec!["stash-pop".to_string(), "force-with-lease".to_string()]);
                assert_eq!(command, "git push --force-with-lease origin feat/auth; git stash pop");
            }
            other => panic!("expected confirm, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_fails_closed() {
        for cmd in ["echo 'unterminated", "git commit -m \"oops", "echo $(date", "", "   ", "ls >"] {
            let verdict = guard().classify(cmd, &workspace());
            assert_eq!(denied_by(&verdict).0, UNPARSEABLE_RULE, "{cmd:?}");
        }
    }

    #[test]
    fn test_excessive_nesting_fails_closed() {
        let cmd = "bash -c 'bash -c \"echo $(echo $(echo $(echo $(ls))))\"'";
        let verdict = guard().classify(cmd, &workspace());
        assert_eq!(denied_by(&verdict).0, UNPARSEABLE_RULE);
    }

    #[test]
    fn test_custom_patterns_from_config() {
        let config = ResolvedConfig {
            deny_patterns: vec![r"^terraform destroy".to_string()],
            confirm_patterns: vec![r"^kubectl delete".to_string()],
            ..ResolvedConfig::default()
        };
        let guard = Guard::from_config(&config).unwrap();
        let verdict = guard.classify("terraform destroy -auto-approve", &workspace());
        assert_eq!(denied_by(&verdict), ("deny-pattern-1", Tier::PolicyDeny));
        let verdict = guard.classify("sudo kubectl delete pod x", &workspace());
        assert_eq!(verdict.rule(), Some("confirm-pattern-1"));
    }

    #[test]
    fn test_custom_patterns_cannot_preempt_nuclear() {
        let config = ResolvedConfig {
            deny_patterns: vec![r"rm".to_string()],
            ..ResolvedConfig::default()
        };
        let guard = Guard::from_config(&config).unwrap();
        let verdict = guard.classify("rm -rf /", &workspace());
        assert_eq!(denied_by(&verdict), ("rm-root", Tier::NuclearDeny));
    }

    #[test]
    fn test_invalid_custom_pattern_is_config_error() {
        let config = ResolvedConfig {
            deny_patterns: vec!["(".to_string()],
            ..ResolvedConfig::default()
        };
        assert!(matches!(
            Guard::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_enforce_maps_denials_to_errors() {
        let ctx = GuardContext::new("/tmp/foo");
        let err = guard().enforce("rm -rf /tmp/foo", &ctx).unwrap_err();
        assert_eq!(err.rule(), Some("cwd-containment"));

        let err = guard().enforce("echo 'x", &ctx).unwrap_err();
        assert!(matches!(err, ControlError::UnparseableCommand(_)));

        assert_eq!(guard().enforce("ls", &ctx).unwrap(), Verdict::Allow);
    }

    #[test]
    fn test_apply_edits_skips_overlaps() {
        let edits = vec![Edit::replace(0..3, "abc"), Edit::replace(1..2, "z")];
        assert_eq!(apply_edits("xyz-", edits, &[]), "xzz-");
    }
}
