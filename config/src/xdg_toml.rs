//! Read `$XDG_CONFIG_HOME/<app>/config.toml`: the `[env]` table plus any other top-level tables.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

/// Location of the app's config file, whether or not it exists.
pub fn config_path(app_name: &str) -> Result<PathBuf, LoadError> {
    let base = match std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .map(|h| h.join(".config"))
            .ok_or_else(|| LoadError::XdgPath("no home directory".to_string()))?,
    };
    Ok(base.join(app_name).join("config.toml"))
}

#[derive(Debug, Default)]
pub(crate) struct ConfigFile {
    pub env: HashMap<String, String>,
    pub sections: toml::Table,
}

#[derive(serde::Deserialize, Default)]
struct RawFile {
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(flatten)]
    rest: toml::Table,
}

/// Parses the config file. A missing file yields an empty [`ConfigFile`].
pub(crate) fn load(app_name: &str) -> Result<ConfigFile, LoadError> {
    let path = config_path(app_name)?;
    if !path.is_file() {
        return Ok(ConfigFile::default());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let raw: RawFile = toml::from_str(&content)?;
    Ok(ConfigFile {
        env: raw.env,
        sections: raw.rest,
    })
}
