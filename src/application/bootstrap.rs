use crate::infrastructure::config::{ensure_default_configs, load_settings_with_lookup, Settings};
use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn under(workspace_root: &Path) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            config_dir: workspace_root.join("config"),
            data_dir: workspace_root.join("data"),
            logs_dir: workspace_root.join("logs"),
            backups_dir: workspace_root.join("backups"),
        }
    }
}

#[derive(Debug)]
pub struct BootstrapResult {
    pub paths: WorkspacePaths,
    pub settings: Settings,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    bootstrap_workspace_with_lookup(workspace_root, |key| std::env::var(key).ok())
}

/// Creates the workspace layout and default config, then loads settings.
pub fn bootstrap_workspace_with_lookup<F>(
    workspace_root: &Path,
    lookup: F,
) -> Result<BootstrapResult, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let paths = WorkspacePaths::under(workspace_root);

    fs::create_dir_all(&paths.config_dir)?;
    fs::create_dir_all(&paths.data_dir)?;
    fs::create_dir_all(&paths.logs_dir)?;
    fs::create_dir_all(&paths.backups_dir)?;

    ensure_default_configs(&paths.config_dir)?;
    let settings = load_settings_with_lookup(&paths.config_dir, lookup)?;

    Ok(BootstrapResult { paths, settings })
}
