//! Runtime configuration read from `TCO_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tco_core::AllocationPolicy;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Explicit database file. `None` means the platform data directory.
    pub db_path: Option<PathBuf>,
    pub allocation_policy: AllocationPolicy,
    pub cache_ttl: Duration,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            allocation_policy: AllocationPolicy::default(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get("TCO_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(policy) = get("TCO_ALLOCATION_POLICY") {
            config.allocation_policy = policy
                .parse()
                .context("Invalid TCO_ALLOCATION_POLICY")?;
        }
        if let Some(ttl) = get("TCO_CACHE_TTL_SECS") {
            let secs: u64 = ttl
                .trim()
                .parse()
                .with_context(|| format!("Invalid TCO_CACHE_TTL_SECS '{}'", ttl))?;
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(port) = get("TCO_PORT") {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid TCO_PORT '{}'", port))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 3000);
        assert_eq!(config.cache_ttl, Duration::from_secs(120));
        assert_eq!(config.allocation_policy, AllocationPolicy::Proportional);
    }

    #[test]
    fn reads_every_key() {
        let config = Config::from_lookup(lookup(&[
            ("TCO_DB_PATH", "/tmp/tco.db"),
            ("TCO_ALLOCATION_POLICY", "Even"),
            ("TCO_CACHE_TTL_SECS", "30"),
            ("TCO_PORT", "8080"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/tco.db")));
        assert_eq!(config.allocation_policy, AllocationPolicy::Even);
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[("TCO_PORT", "  ")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(Config::from_lookup(lookup(&[("TCO_ALLOCATION_POLICY", "weighted")])).is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(Config::from_lookup(lookup(&[("TCO_PORT", "http")])).is_err());
    }
}
