use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::types::RunboxConfig;
use crate::error::{Result, RunboxError};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "RUNBOX_CONFIG";

/// Configuration file path: `RUNBOX_CONFIG` when set, otherwise the
/// platform config dir (`~/.config/runbox/config.toml` on Linux).
pub fn get_config_path() -> PathBuf {
    config_path_from(std::env::var_os(CONFIG_ENV))
}

fn config_path_from(explicit: Option<OsString>) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    match directories::ProjectDirs::from("dev", "runbox", "runbox") {
        Some(dirs) => dirs.config_dir().join("config.toml"),
        None => PathBuf::from(".runbox.toml"),
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<RunboxConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        debug!(path = %path.display(), "No config file, using defaults");
        return Ok(RunboxConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

/// Parse a TOML configuration document.
pub fn parse_config(content: &str) -> Result<RunboxConfig> {
    toml::from_str(content).map_err(|e| RunboxError::TomlParse(e.to_string()))
}
