//! Tracker settings, read from the environment of the instrumented program.

use std::{env, str::FromStr};

use thiserror::Error;

pub const ZERO_SIZE_VAR: &str = "MALLOC_CANARY_ZERO_SIZE";
pub const CAPACITY_VAR: &str = "MALLOC_CANARY_CAPACITY";

/// What to do with a request for zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroSizePolicy {
    /// Print a warning and return null.
    Reject,
    /// Hand out a guarded block with an empty payload.
    Minimal,
}

impl Default for ZeroSizePolicy {
    fn default() -> Self {
        ZeroSizePolicy::Reject
    }
}

impl FromStr for ZeroSizePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(ZeroSizePolicy::Reject),
            "minimal" => Ok(ZeroSizePolicy::Minimal),
            _ => Err(ConfigError::ZeroSize(s.to_owned())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MALLOC_CANARY_ZERO_SIZE: expected `reject` or `minimal`, got `{0}`")]
    ZeroSize(String),
    #[error("MALLOC_CANARY_CAPACITY: expected a number of allocations, got `{0}`")]
    Capacity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    pub zero_size: ZeroSizePolicy,
    /// Maximum number of live allocations; `None` is unbounded.
    pub capacity: Option<usize>,
}

impl Config {
    /// Build a config from raw variable values; absent values keep their defaults and a
    /// capacity of `0` means unbounded.
    pub fn parse(zero_size: Option<&str>, capacity: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(zero_size) = zero_size {
            config.zero_size = zero_size.parse()?;
        }
        if let Some(capacity) = capacity {
            let n: usize = capacity
                .trim()
                .parse()
                .map_err(|_| ConfigError::Capacity(capacity.to_owned()))?;
            config.capacity = if n == 0 { None } else { Some(n) };
        }
        Ok(config)
    }

    /// Read the config from the environment.  Bad values are logged and the defaults
    /// used instead, so a typo never stops the program being debugged.
    pub fn from_env() -> Self {
        let zero_size = env::var(ZERO_SIZE_VAR).ok();
        let capacity = env::var(CAPACITY_VAR).ok();
        Config::parse(zero_size.as_deref(), capacity.as_deref()).unwrap_or_else(|e| {
            log::warn!("{}; using defaults", e);
            Config::default()
        })
    }
}
