// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for Gatehouse.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.gatehouse/config.json
//! - Workspace config: .gatehouse.json, .gatehouse/config.json, .gatehouse.yaml
//!   or gatehouse.config.json
//! - Local config: .gatehouse.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    get_example_config, get_global_config_dir, get_global_config_path, init_config,
    load_config_file, load_global_config, load_local_config, load_workspace_config,
    save_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, validate_config, CliOptions};

pub use types::{
    ResolvedConfig, WorkspaceConfig, DEFAULT_CHECKPOINT_EVERY, DEFAULT_LOCAL_TEMP_DIR,
    DEFAULT_PROTECTED_BRANCH, DEFAULT_STALE_AFTER_HOURS, DEFAULT_STATE_DIR,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load, merge and validate all configuration sources for a repository.
pub fn load_config(repo_root: &Path, cli_options: CliOptions) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(repo_root)?;
    let local = load_local_config(repo_root)?;

    let config = merge_config(global, workspace, local, cli_options);
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_workspace_and_local() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".gatehouse.json"),
            r#"{"protectedBranch": "trunk", "checkpointEvery": 8}"#,
        )
        .unwrap();
        std::fs::write(
            temp.path().join(".gatehouse.local.json"),
            r#"{"checkpointEvery": 2}"#,
        )
        .unwrap();

        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.protected_branch, "trunk");
        assert_eq!(config.checkpoint_every, 2);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".gatehouse.json"),
            r#"{"staleAfterHours": 0}"#,
        )
        .unwrap();

        let cli = CliOptions::default();
        assert!(load_config(temp.path(), cli).is_err());
    }

    #[test]
    fn test_load_config_cli_override() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".gatehouse.json"),
            r#"{"protectedBranch": "trunk"}"#,
        )
        .unwrap();

        let cli = CliOptions {
            protected_branch: Some("release".to_string()),
            ..Default::default()
        };
        let config = load_config(temp.path(), cli).unwrap();
        assert_eq!(config.protected_branch, "release");
    }
}
