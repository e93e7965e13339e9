//! Compiler limits and their sources.
//!
//! Values come from the `[compiler]` table of `$XDG_CONFIG_HOME/weft/config.toml`, then
//! `WEFT_*` environment variables (after `.env` has been applied), then code.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub const APP_NAME: &str = "weft";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] env_config::LoadError),
    #[error("{key}={value:?} is not a valid number")]
    InvalidNumber { key: String, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Limits for one [`Compiler`](crate::compiler::Compiler).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Planning rounds per turn, replans included.
    pub max_rounds: u32,
    /// Tool tasks one round may admit.
    pub max_tasks_per_round: usize,
    /// Concurrent tool calls.
    pub worker_pool_size: usize,
    /// Plan chunks buffered between the plan source and the parser.
    pub plan_channel_capacity: usize,
    /// Joiner attempts per round (first call included).
    pub join_attempts: usize,
    /// Nesting limit for tool chains.
    pub max_chain_depth: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_tasks_per_round: 32,
            worker_pool_size: 8,
            plan_channel_capacity: 64,
            join_attempts: 2,
            max_chain_depth: 4,
        }
    }
}

impl CompilerConfig {
    /// Defaults overridden by `WEFT_*` variables of the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `.env` (from `dotenv_dir` or the current directory) and XDG `[env]` to the
    /// environment, reads the XDG `[compiler]` table, then applies `WEFT_*` overrides.
    pub fn load(dotenv_dir: Option<&Path>) -> Result<Self, ConfigError> {
        env_config::load_and_apply(APP_NAME, dotenv_dir)?;
        let mut config: Self =
            env_config::load_section(APP_NAME, "compiler")?.unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(?config, "compiler config loaded");
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn read<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) -> Result<(), ConfigError> {
            if let Some(value) = lookup(key) {
                *slot = value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                    key: key.to_string(),
                    value,
                })?;
            }
            Ok(())
        }
        read(&lookup, "WEFT_MAX_ROUNDS", &mut self.max_rounds)?;
        read(&lookup, "WEFT_MAX_TASKS_PER_ROUND", &mut self.max_tasks_per_round)?;
        read(&lookup, "WEFT_WORKER_POOL_SIZE", &mut self.worker_pool_size)?;
        read(&lookup, "WEFT_PLAN_CHANNEL_CAPACITY", &mut self.plan_channel_capacity)?;
        read(&lookup, "WEFT_JOIN_ATTEMPTS", &mut self.join_attempts)?;
        read(&lookup, "WEFT_MAX_CHAIN_DEPTH", &mut self.max_chain_depth)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("max_rounds", self.max_rounds as usize),
            ("max_tasks_per_round", self.max_tasks_per_round),
            ("worker_pool_size", self.worker_pool_size),
            ("plan_channel_capacity", self.plan_channel_capacity),
            ("join_attempts", self.join_attempts),
            ("max_chain_depth", self.max_chain_depth),
        ];
        match limits.into_iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let c = CompilerConfig::default();
        assert_eq!(c.max_rounds, 5);
        assert_eq!(c.join_attempts, 2);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn overrides_replace_defaults() {
        let env = HashMap::from([
            ("WEFT_MAX_ROUNDS", "3"),
            ("WEFT_WORKER_POOL_SIZE", " 16 "),
        ]);
        let mut c = CompilerConfig::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.max_rounds, 3);
        assert_eq!(c.worker_pool_size, 16);
        assert_eq!(c.max_tasks_per_round, 32);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut c = CompilerConfig::default();
        let err = c
            .apply_overrides(|k| (k == "WEFT_JOIN_ATTEMPTS").then(|| "two".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { ref key, .. } if key == "WEFT_JOIN_ATTEMPTS"));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let c = CompilerConfig {
            worker_pool_size: 0,
            ..CompilerConfig::default()
        };
        assert_eq!(
            c.validate().unwrap_err().to_string(),
            "worker_pool_size must be greater than zero"
        );
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let c: CompilerConfig = serde_json::from_value(serde_json::json!({"max_rounds": 2})).unwrap();
        assert_eq!(c.max_rounds, 2);
        assert_eq!(c.plan_channel_capacity, 64);
    }
}
