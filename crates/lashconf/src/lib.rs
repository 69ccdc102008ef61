//! Minimal configuration loading for the LASH session daemon.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/lash/config.toml` (system)
//! 2. `~/.config/lash/config.toml` (user)
//! 3. `./lash.toml` (local override)
//! 4. Environment variables (`LASH_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! socket = "/run/user/1000/lash/socket"
//! projects_dir = "~/audio-projects"
//!
//! [log]
//! filter = "info"
//! ```

pub mod loader;

pub use loader::{discover_config_files, load_from_file};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Filesystem locations the daemon uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Unix socket the daemon listens on and clients connect to.
    pub socket: PathBuf,
    /// Directory under which project save directories are created.
    pub projects_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Self {
            socket: PathBuf::from(&home).join(".lash/socket"),
            projects_dir: PathBuf::from(&home).join("audio-projects"),
        }
    }
}

/// Logging knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing-subscriber EnvFilter directive, e.g. "info" or "lashd=debug".
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LashConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl LashConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/lash/config.toml`
    /// 3. `~/.config/lash/config.toml`
    /// 4. `./lash.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, optionally from an explicit file.
    ///
    /// If `config_path` is provided it replaces the local `./lash.toml`
    /// override; system and user configs still load first. Unlike the
    /// discovered locations, a named file that is missing is an error.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = LashConfig::default();
        for path in loader::discover_config_files_with_override(config_path) {
            let layer = loader::load_from_file(&path)?;
            config.merge(layer);
        }
        loader::apply_env_overrides(&mut config);
        Ok(config)
    }

    fn merge(&mut self, layer: PartialConfig) {
        if let Some(paths) = layer.paths {
            if let Some(socket) = paths.socket {
                self.paths.socket = socket;
            }
            if let Some(projects_dir) = paths.projects_dir {
                self.paths.projects_dir = projects_dir;
            }
        }
        if let Some(log) = layer.log {
            if let Some(filter) = log.filter {
                self.log.filter = filter;
            }
        }
    }
}

/// A config file layer: every field optional so partial files overlay
/// cleanly onto earlier layers.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PartialConfig {
    pub paths: Option<PartialPaths>,
    pub log: Option<PartialLog>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PartialPaths {
    pub socket: Option<PathBuf>,
    pub projects_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PartialLog {
    pub filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = LashConfig::default();
        assert!(config.paths.socket.to_string_lossy().ends_with("socket"));
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn partial_layer_overrides_only_named_fields() {
        let mut config = LashConfig::default();
        let original_projects = config.paths.projects_dir.clone();

        let layer: PartialConfig = toml::from_str(
            r#"
            [paths]
            socket = "/run/lash/socket"
            "#,
        )
        .unwrap();
        config.merge(layer);

        assert_eq!(config.paths.socket, PathBuf::from("/run/lash/socket"));
        assert_eq!(config.paths.projects_dir, original_projects);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn explicit_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lash.toml");
        std::fs::write(
            &path,
            r#"
            [log]
            filter = "lashd=debug"
            "#,
        )
        .unwrap();

        let config = LashConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.log.filter, "lashd=debug");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let path = std::path::Path::new("/nonexistent/definitely/lash.toml");
        let err = LashConfig::load_from(Some(path)).unwrap_err();
        match err {
            ConfigError::FileRead { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected read error, got {other}"),
        }
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lash.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();

        let err = LashConfig::load_from(Some(&path)).unwrap_err();
        match err {
            ConfigError::Parse { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected parse error, got {other}"),
        }
    }
}
