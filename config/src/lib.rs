//! Load configuration for weft from the XDG `config.toml` and a project `.env`.
//!
//! Two entry points:
//! - [`load_and_apply`] copies `[env]` keys and `.env` keys into the process environment with
//!   priority **existing env > .env > XDG**.
//! - [`load_section`] deserializes one named TOML table (e.g. `[compiler]`) into a typed struct.
//!
//! The XDG file lives at `$XDG_CONFIG_HOME/<app>/config.toml`, falling back to
//! `~/.config/<app>/config.toml`.

mod dotenv;
mod xdg_toml;

use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;

pub use xdg_toml::config_path;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("xdg config path: {0}")]
    XdgPath(String),
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("section [{section}]: {message}")]
    Section { section: String, message: String },
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Applies `.env` and XDG `[env]` values to the process environment.
///
/// Keys already present in the environment are never overwritten. For a missing key the `.env`
/// value (from `override_dir`, or the current directory) wins over the XDG one.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let file = xdg_toml::load(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: Vec<&String> = file.env.keys().chain(dotenv_map.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        if std::env::var_os(key).is_some() {
            continue;
        }
        if let Some(v) = dotenv_map.get(key).or_else(|| file.env.get(key)) {
            std::env::set_var(key, v);
        }
    }
    Ok(())
}

/// Deserializes table `section` of the app's XDG `config.toml`.
///
/// Returns `Ok(None)` when the file or the table is absent.
pub fn load_section<T: DeserializeOwned>(
    app_name: &str,
    section: &str,
) -> Result<Option<T>, LoadError> {
    let file = xdg_toml::load(app_name)?;
    let Some(value) = file.sections.get(section) else {
        return Ok(None);
    };
    value
        .clone()
        .try_into()
        .map(Some)
        .map_err(|e: toml::de::Error| LoadError::Section {
            section: section.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::Mutex;

    /// Serializes tests that mutate `XDG_CONFIG_HOME`.
    pub static XDG_LOCK: Mutex<()> = Mutex::new(());

    pub fn with_xdg_home<R>(dir: &std::path::Path, f: impl FnOnce() -> R) -> R {
        let _guard = XDG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let prev = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("XDG_CONFIG_HOME", dir);
        let out = f();
        match prev {
            Some(v) => std::env::set_var("XDG_CONFIG_HOME", v),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
        out
    }
}
