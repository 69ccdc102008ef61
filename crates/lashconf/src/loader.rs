//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, LashConfig, PartialConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override and is kept
/// whether or not it exists: an operator-named file that cannot be read
/// must surface as an error, not a silent fallback to defaults.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/lash/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("lash/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("lash.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load one config layer from a TOML file.
pub fn load_from_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply `LASH_*` environment variable overrides (highest precedence).
pub fn apply_env_overrides(config: &mut LashConfig) {
    if let Ok(socket) = env::var("LASH_SOCKET") {
        config.paths.socket = PathBuf::from(socket);
    }
    if let Ok(dir) = env::var("LASH_PROJECTS_DIR") {
        config.paths.projects_dir = PathBuf::from(dir);
    }
    if let Ok(filter) = env::var("LASH_LOG") {
        config.log.filter = filter;
    }
}
