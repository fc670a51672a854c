// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use regex::Regex;

use crate::error::ConfigError;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub protected_branch: Option<String>,
    pub isolation_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub stale_after_hours: Option<u64>,
    pub checkpoint_every: Option<u32>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.gatehouse.local.json)
/// 3. Workspace config (.gatehouse.json)
/// 4. Global config (~/.gatehouse/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref branch) = config.protected_branch {
        result.protected_branch = branch.clone();
    }

    if config.isolation_root.is_some() {
        result.isolation_root = config.isolation_root.clone();
    }

    if let Some(ref dir) = config.state_dir {
        result.state_dir = dir.clone();
    }

    if let Some(hours) = config.stale_after_hours {
        result.stale_after_hours = hours;
    }

    if let Some(every) = config.checkpoint_every {
        result.checkpoint_every = every;
    }

    if let Some(ref dir) = config.local_temp_dir {
        result.local_temp_dir = dir.clone();
    }

    // Pattern lists accumulate across layers; a lower layer can't be unset.
    if let Some(ref patterns) = config.deny_patterns {
        for pattern in patterns {
            if !result.deny_patterns.contains(pattern) {
                result.deny_patterns.push(pattern.clone());
            }
        }
    }

    if let Some(ref patterns) = config.confirm_patterns {
        for pattern in patterns {
            if !result.confirm_patterns.contains(pattern) {
                result.confirm_patterns.push(pattern.clone());
            }
        }
    }

    if let Some(ref git) = config.git_binary {
        result.git_binary = git.clone();
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref branch) = cli.protected_branch {
        result.protected_branch = branch.clone();
    }
    if cli.isolation_root.is_some() {
        result.isolation_root = cli.isolation_root.clone();
    }
    if let Some(ref dir) = cli.state_dir {
        result.state_dir = dir.clone();
    }
    if let Some(hours) = cli.stale_after_hours {
        result.stale_after_hours = hours;
    }
    if let Some(every) = cli.checkpoint_every {
        result.checkpoint_every = every;
    }
}

/// Validate a resolved configuration.
pub fn validate_config(config: &ResolvedConfig) -> Result<(), ConfigError> {
    if config.protected_branch.trim().is_empty() {
        return Err(ConfigError::invalid("protectedBranch", "must not be empty"));
    }
    if config.stale_after_hours == 0 {
        return Err(ConfigError::invalid("staleAfterHours", "must be at least 1"));
    }
    if config.checkpoint_every == 0 {
        return Err(ConfigError::invalid("checkpointEvery", "must be at least 1"));
    }
    if config.local_temp_dir.starts_with('/') || config.local_temp_dir.contains("..") {
        return Err(ConfigError::invalid(
            "localTempDir",
            "must be a relative path inside the project",
        ));
    }
    for (field, patterns) in [
        ("denyPatterns", &config.deny_patterns),
        ("confirmPatterns", &config.confirm_patterns),
    ] {
        for pattern in patterns {
            Regex::new(pattern).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
        }
    }
    Ok(())
}
