// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guard inputs and outputs.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::telemetry::VerdictKind;

/// Priority tier of a guard rule. Declaration order is evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Irrecoverable destructive operations. Never overridable.
    NuclearDeny,
    /// Direct modification of the protected integration branch.
    BranchProtect,
    /// Deployment-configured deny patterns.
    PolicyDeny,
    /// Shared temp paths and removal of the working directory.
    PathSafety,
    /// Risky flag combinations normalized in place.
    Rewrite,
    /// Consequential but reversible operations that need a human.
    Confirm,
    /// Default.
    Allow,
}

impl Tier {
    /// All tiers in evaluation order.
    pub const ALL: [Tier; 7] = [
        Tier::NuclearDeny,
        Tier::BranchProtect,
        Tier::PolicyDeny,
        Tier::PathSafety,
        Tier::Rewrite,
        Tier::Confirm,
        Tier::Allow,
    ];

    /// Whether configuration or context can ever suppress this tier.
    pub fn is_overridable(self) -> bool {
        !matches!(self, Tier::NuclearDeny)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::NuclearDeny => "nuclear-deny",
            Tier::BranchProtect => "branch-protect",
            Tier::PolicyDeny => "policy-deny",
            Tier::PathSafety => "path-safety",
            Tier::Rewrite => "rewrite",
            Tier::Confirm => "confirm",
            Tier::Allow => "allow",
        };
        f.write_str(name)
    }
}

/// Where and on what a command is about to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardContext {
    /// Directory the command will execute in.
    pub cwd: PathBuf,
    /// Root of the isolated workspace containing `cwd`, if any.
    pub workspace_root: Option<PathBuf>,
    /// Branch checked out in `cwd`, if known.
    pub current_branch: Option<String>,
    /// Home directory used to expand `~` and `$HOME`.
    pub home: Option<PathBuf>,
    /// Directory relative paths resolve against at this point of the line.
    pub shell_dir: ShellDir,
}

/// Where the shell stands after the `cd`s seen so far on one command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShellDir {
    /// Still in `cwd`.
    #[default]
    Launch,
    /// Moved to a directory known lexically.
    Changed(PathBuf),
    /// Moved somewhere only known after expansion (`cd $X`, `cd -`, `popd`).
    Unknown,
}

impl GuardContext {
    /// Context for a command outside any workspace.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            workspace_root: None,
            current_branch: None,
            home: None,
            shell_dir: ShellDir::Launch,
        }
    }

    /// Mark the command as running inside the workspace rooted at `root`.
    pub fn in_workspace(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Set the checked-out branch.
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.current_branch = Some(branch.into());
        self
    }

    /// Set the home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Whether the command runs inside an isolated workspace.
    pub fn is_in_workspace(&self) -> bool {
        self.workspace_root.is_some()
    }

    /// Workspace root, or the cwd when outside a workspace.
    pub fn project_root(&self) -> &Path {
        self.workspace_root.as_deref().unwrap_or(&self.cwd)
    }

    /// Directory relative paths resolve against; `None` after an unresolvable `cd`.
    pub fn base_dir(&self) -> Option<&Path> {
        match &self.shell_dir {
            ShellDir::Launch => Some(&self.cwd),
            ShellDir::Changed(dir) => Some(dir),
            ShellDir::Unknown => None,
        }
    }

    /// Directories whose removal would pull the floor from under the command.
    pub fn occupied_dirs(&self) -> impl Iterator<Item = &Path> {
        let changed = match &self.shell_dir {
            ShellDir::Changed(dir) => Some(dir.as_path()),
            _ => None,
        };
        std::iter::once(self.cwd.as_path())
            .chain(self.workspace_root.as_deref())
            .chain(changed)
    }
}

/// Deployment policy the built-in rules consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub protected_branch: String,
    /// Project-local temp directory, relative to the project root.
    pub local_temp_dir: String,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            protected_branch: crate::config::DEFAULT_PROTECTED_BRANCH.to_string(),
            local_temp_dir: crate::config::DEFAULT_LOCAL_TEMP_DIR.to_string(),
        }
    }
}

/// Why a rule refused a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub reason: String,
    pub suggestion: Option<String>,
}

impl Refusal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            suggestion: None,
        }
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// A replacement of one byte range of the command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub span: Range<usize>,
    pub replacement: String,
}

impl Edit {
    pub fn replace(span: Range<usize>, replacement: impl Into<String>) -> Self {
        Self {
            span,
            replacement: replacement.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::replace(at..at, text)
    }

    pub(crate) fn shifted(mut self, offset: usize) -> Self {
        self.span = self.span.start + offset..self.span.end + offset;
        self
    }
}

/// Classification of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny {
        rule: String,
        tier: Tier,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
    Rewrite {
        rules: Vec<String>,
        command: String,
        reason: String,
    },
    Confirm {
        rules: Vec<String>,
        prompt: String,
        /// Command to run once approved; differs from the input when rewrites also applied.
        command: String,
    },
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Allow => VerdictKind::Allow,
            Verdict::Deny { .. } => VerdictKind::Deny,
            Verdict::Rewrite { .. } => VerdictKind::Rewrite,
            Verdict::Confirm { .. } => VerdictKind::Confirm,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Verdict::Deny { .. })
    }

    /// The firing rule for a denial, or the first contributing rule otherwise.
    pub fn rule(&self) -> Option<&str> {
        match self {
            Verdict::Allow => None,
            Verdict::Deny { rule, .. } => Some(rule),
            Verdict::Rewrite { rules, .. } | Verdict::Confirm { rules, .. } => {
                rules.first().map(String::as_str)
            }
        }
    }

    /// Process exit code used by the CLI and hook integrations.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Allow | Verdict::Rewrite { .. } => 0,
            Verdict::Deny { .. } => 2,
            Verdict::Confirm { .. } => 3,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "ALLOW"),
            Verdict::Deny {
                rule,
                tier,
                reason,
                suggestion,
            } => {
                write!(f, "DENY [{tier}/{rule}] {reason}")?;
                if let Some(suggestion) = suggestion {
                    write!(f, " (try: {suggestion})")?;
                }
                Ok(())
            }
            Verdict::Rewrite { command, reason, .. } => write!(f, "REWRITE {command} ({reason})"),
            Verdict::Confirm { prompt, .. } => write!(f, "CONFIRM {prompt}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        assert!(Tier::NuclearDeny < Tier::BranchProtect);
        assert!(Tier::PathSafety < Tier::Rewrite);
        assert!(Tier::Confirm < Tier::Allow);
        let mut sorted = Tier::ALL;
        sorted.sort();
        assert_eq!(sorted, Tier::ALL);
    }

    #[test]
    fn test_only_nuclear_is_not_overridable() {
        for tier in Tier::ALL {
            assert_eq!(tier.is_overridable(), tier != Tier::NuclearDeny);
        }
    }

    #[test]
    fn test_verdict_exit_codes() {
        assert_eq!(Verdict::Allow.exit_code(), 0);
        let deny = Verdict::Deny {
            rule: "rm-root".to_string(),
            tier: Tier::NuclearDeny,
            reason: "no".to_string(),
            suggestion: None,
        };
        assert_eq!(deny.exit_code(), 2);
        assert_eq!(deny.rule(), Some("rm-root"));
    }

    #[test]
    fn test_deny_display() {
        let deny = Verdict::Deny {
            rule: "cwd-containment".to_string(),
            tier: Tier::PathSafety,
            reason: "target contains the working directory".to_string(),
            suggestion: Some("cd .. first".to_string()),
        };
        insta::assert_snapshot!(
            deny.to_string(),
            @"DENY [path-safety/cwd-containment] target contains the working directory (try: cd .. first)"
        );
    }

    #[test]
    fn test_verdict_json_tag() {
        let json = serde_json::to_value(Verdict::Allow).unwrap();
        assert_eq!(json["verdict"], "allow");
    }

    #[test]
    fn test_edit_shift() {
        let edit = Edit::replace(2..4, "x").shifted(10);
        assert_eq!(edit.span, 12..14);
    }
}
