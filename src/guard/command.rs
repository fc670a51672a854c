// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Simple-command normalization.
//!
//! Strips environment assignments, shell keywords and transparent wrappers
//! (`sudo`, `env`, `nohup`, ...) so rules always see the program that
//! actually runs, and offers the flag and path helpers the rules share.

use std::path::{Component, Path, PathBuf};

use super::lexer::{Redirect, Segment, Word};
use super::verdict::{GuardContext, ShellDir};

/// Shell keywords that may precede a command word.
const KEYWORDS: &[&str] = &["if", "then", "else", "elif", "do", "while", "until", "!", "{", "}", "time"];

/// A normalized simple command.
#[derive(Debug, Clone)]
pub struct SimpleCommand<'a> {
    /// Program basename (`/bin/rm` becomes `rm`).
    pub program: String,
    pub program_word: &'a Word,
    pub args: Vec<&'a Word>,
    pub redirects: &'a [Redirect],
    /// Text the word spans index into.
    pub source: &'a str,
    /// Program of the previous pipeline stage feeding this one.
    pub upstream: Option<String>,
}

impl<'a> SimpleCommand<'a> {
    /// Normalize a segment; `None` when it runs no program (bare assignments).
    pub fn from_segment(segment: &'a Segment, source: &'a str, upstream: Option<String>) -> Option<Self> {
        let words = &segment.words;
        let mut index = 0;

        loop {
            let word = words.get(index)?;
            let text = word.text.as_str();
            if is_assignment(word) || KEYWORDS.contains(&text) {
                index += 1;
                continue;
            }
            let skip = match basename(text) {
                "sudo" | "doas" => skip_options(&words[index + 1..], &["-u", "-g", "-C", "-h", "-p", "-U", "-r", "-t"]),
                "env" => skip_env(&words[index + 1..]),
                "nice" => skip_options(&words[index + 1..], &["-n"]),
                "timeout" => skip_timeout(&words[index + 1..]),
                "xargs" => skip_options(
                    &words[index + 1..],
                    &["-n", "-I", "-P", "-L", "-d", "-E", "-s", "-a", "-i"],
                ),
                "nohup" | "exec" | "builtin" | "stdbuf" | "unbuffer" => skip_options(&words[index + 1..], &[]),
                "command" => {
                    // `command -v name` only looks the name up.
                    if words
                        .get(index + 1)
                        .is_some_and(|w| w.text == "-v" || w.text == "-V")
                    {
                        return None;
                    }
                    skip_options(&words[index + 1..], &[])
                }
                _ => {
                    return Some(Self {
                        program: basename(text).to_string(),
                        program_word: word,
                        args: words[index + 1..].iter().collect(),
                        redirects: &segment.redirects,
                        source,
                        upstream,
                    })
                }
            };
            index += 1 + skip;
        }
    }

    /// Argument texts.
    pub fn arg_texts(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|w| w.text.as_str())
    }

    /// Source text of a word, quotes included.
    pub fn raw(&self, word: &Word) -> &'a str {
        self.source.get(word.span.clone()).unwrap_or("")
    }

    /// The command rebuilt from unquoted words, for pattern matching.
    pub fn normalized(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.arg_texts())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Git subcommand and its arguments when this is a `git` invocation.
    pub fn git(&self) -> Option<GitInvocation<'a>> {
        if self.program != "git" {
            return None;
        }
        let mut rest = self.args.as_slice();
        while let Some((first, tail)) = rest.split_first() {
            let text = first.text.as_str();
            match text {
                "-C" | "-c" | "--git-dir" | "--work-tree" | "--namespace" | "--exec-path" => {
                    rest = tail.get(1..).unwrap_or(&[]);
                }
                _ if text.starts_with('-') => rest = tail,
                _ => {
                    return Some(GitInvocation {
                        subcommand: text.to_string(),
                        subcommand_word: *first,
                        args: tail.to_vec(),
                    })
                }
            }
        }
        None
    }

    /// Payload of `bash -c '...'` and friends.
    pub fn shell_payload(&self) -> Option<&'a Word> {
        if !matches!(self.program.as_str(), "sh" | "bash" | "zsh" | "dash" | "ksh") {
            return None;
        }
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            let text = arg.text.as_str();
            if text.starts_with('-') && !text.starts_with("--") && text.contains('c') {
                return args.next().copied();
            }
            if !text.starts_with('-') && !text.starts_with('+') {
                break;
            }
        }
        None
    }

    /// Where a `cd`, `pushd` or `popd` leaves the shell; `None` for other programs.
    pub fn directory_change(&self, ctx: &GuardContext) -> Option<ShellDir> {
        match self.program.as_str() {
            "cd" | "pushd" => {}
            "popd" => return Some(ShellDir::Unknown),
            _ => return None,
        }
        let destination = positionals(&self.args, &[]).into_iter().next();
        let Some(word) = destination else {
            // Bare `cd` goes home; bare `pushd` swaps the top two entries.
            return Some(match (&ctx.home, self.program.as_str()) {
                (Some(home), "cd") => ShellDir::Changed(home.clone()),
                _ => ShellDir::Unknown,
            });
        };
        if word.text == "-" || word.text.starts_with('+') {
            return Some(ShellDir::Unknown);
        }
        Some(match resolve_target(word, ctx) {
            Target::Path(dir) => ShellDir::Changed(dir),
            Target::ChildrenOf(_) | Target::Unknown => ShellDir::Unknown,
        })
    }

    /// Whether this is an interactive shell reading commands from stdin.
    pub fn is_bare_shell(&self) -> bool {
        matches!(self.program.as_str(), "sh" | "bash" | "zsh" | "dash" | "ksh")
            && self.shell_payload().is_none()
            && self.arg_texts().all(|a| a.starts_with('-') || a.starts_with('+'))
    }
}

/// A git subcommand with the global options stripped.
#[derive(Debug, Clone)]
pub struct GitInvocation<'a> {
    pub subcommand: String,
    pub subcommand_word: &'a Word,
    pub args: Vec<&'a Word>,
}

impl<'a> GitInvocation<'a> {
    pub fn is(&self, subcommand: &str) -> bool {
        self.subcommand == subcommand
    }

    pub fn has_long(&self, flag: &str) -> bool {
        has_long(&self.args, flag)
    }

    pub fn has_short(&self, flag: char) -> bool {
        has_short(&self.args, flag)
    }

    /// Non-option arguments; `value_options` consume the word after them.
    pub fn positionals(&self, value_options: &[&str]) -> Vec<&'a Word> {
        positionals(&self.args, value_options)
    }

    /// First positional argument, typically a nested subcommand.
    pub fn action(&self) -> Option<&str> {
        self.args
            .iter()
            .map(|w| w.text.as_str())
            .find(|t| !t.starts_with('-'))
    }
}

/// Whether `word` is a `NAME=value` assignment.
fn is_assignment(word: &Word) -> bool {
    let Some((name, _)) = word.text.split_once('=') else {
        return false;
    };
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Final path component of a program word.
pub fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

/// Count leading option words, including values of `value_options`.
fn skip_options(words: &[Word], value_options: &[&str]) -> usize {
    let mut index = 0;
    while let Some(word) = words.get(index) {
        let text = word.text.as_str();
        if text == "--" {
            return index + 1;
        }
        if !text.starts_with('-') || text == "-" {
            break;
        }
        index += if value_options.contains(&text) { 2 } else { 1 };
    }
    index.min(words.len())
}

fn skip_env(words: &[Word]) -> usize {
    let mut index = 0;
    while let Some(word) = words.get(index) {
        let text = word.text.as_str();
        if text == "-u" || text == "--unset" || text == "-C" || text == "--chdir" {
            index += 2;
        } else if text.starts_with('-') || is_assignment(word) {
            index += 1;
        } else {
            break;
        }
    }
    index.min(words.len())
}

fn skip_timeout(words: &[Word]) -> usize {
    let options = skip_options(words, &["-s", "--signal", "-k", "--kill-after"]);
    // The duration follows the options.
    (options + 1).min(words.len())
}

/// Whether a long flag (`--force`, `--force=...`) is present before `--`.
pub fn has_long(args: &[&Word], flag: &str) -> bool {
    args.iter()
        .map(|w| w.text.as_str())
        .take_while(|t| *t != "--")
        .any(|t| t == flag || t.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
}

/// Whether a short flag is present, alone or bundled (`-rf`), before `--`.
pub fn has_short(args: &[&Word], flag: char) -> bool {
    args.iter()
        .map(|w| w.text.as_str())
        .take_while(|t| *t != "--")
        .any(|t| is_short_bundle(t) && t[1..].contains(flag))
}

/// `-abc` style option word.
pub fn is_short_bundle(text: &str) -> bool {
    text.len() > 1
        && text.starts_with('-')
        && !text.starts_with("--")
        && text[1..].chars().all(|c| c.is_ascii_alphanumeric())
}

/// Non-option arguments; everything after `--` counts.
pub fn positionals<'a>(args: &[&'a Word], value_options: &[&str]) -> Vec<&'a Word> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(word) = iter.next() {
        let text = word.text.as_str();
        if text == "--" {
            out.extend(iter.copied());
            break;
        }
        if value_options.contains(&text) {
            iter.next();
        } else if !text.starts_with('-') || text == "-" {
            out.push(*word);
        }
    }
    out
}

/// Outcome of resolving a path argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A concrete path.
    Path(PathBuf),
    /// A glob in the last component matching entries of this directory.
    ChildrenOf(PathBuf),
    /// Depends on an expansion the guard cannot evaluate.
    Unknown,
}

impl Target {
    /// Whether removing this target would remove `dir` or something containing it.
    pub fn covers(&self, dir: &Path) -> bool {
        match self {
            Target::Path(path) => dir.starts_with(path),
            Target::ChildrenOf(parent) => dir.starts_with(parent) && dir != parent,
            Target::Unknown => false,
        }
    }

    /// The directory whose contents are at stake.
    pub fn scope(&self) -> Option<&Path> {
        match self {
            Target::Path(path) | Target::ChildrenOf(path) => Some(path),
            Target::Unknown => None,
        }
    }
}

/// Resolve a path argument lexically against the context.
pub fn resolve_target(word: &Word, ctx: &GuardContext) -> Target {
    let text = word.text.as_str();
    let expanded = if text == "~" || text.starts_with("~/") {
        match &ctx.home {
            Some(home) => home.join(text.trim_start_matches('~').trim_start_matches('/')),
            None => return Target::Unknown,
        }
    } else if let Some(rest) = text
        .strip_prefix("${HOME}")
        .or_else(|| text.strip_prefix("$HOME"))
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
    {
        match &ctx.home {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => return Target::Unknown,
        }
    } else if word.expands || text.contains('`') {
        return Target::Unknown;
    } else {
        match ctx.base_dir() {
            Some(base) => base.join(text),
            None if text.starts_with('/') => PathBuf::from(text),
            None => return Target::Unknown,
        }
    };

    let normalized = normalize(&expanded);
    let is_glob = normalized
        .file_name()
        .map(|n| n.to_string_lossy().contains(&['*', '?', '['][..]))
        .unwrap_or(false);
    if is_glob {
        let parent = normalized.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"));
        Target::ChildrenOf(parent)
    } else {
        Target::Path(normalized)
    }
}

/// Lexically normalize `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("/");
                }
                if out.as_os_str().is_empty() {
                    out.push("/");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}
