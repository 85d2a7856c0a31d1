use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::extract::ArtifactLayout;
use crate::registry::{OciConfig, Platform};
use crate::service::ContentServiceConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Absolute root of the content directories.
    pub base_path: PathBuf,
    pub cache_capacity: NonZeroUsize,
    pub cache_ttl: Duration,
    /// Zero disables the janitor.
    pub prune_interval: Duration,
    pub artifact_name: String,
    pub registry: OciConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let listen_addr = var("BINDROP_LISTEN_ADDR", "0.0.0.0:3000")
            .parse()
            .context("BINDROP_LISTEN_ADDR")?;

        let log_level = var("BINDROP_LOG_LEVEL", "info");

        let base_path = PathBuf::from(var("BINDROP_BASE_PATH", "tmp/webhook"));
        let base_path = if base_path.is_absolute() {
            base_path
        } else {
            std::env::current_dir()
                .context("resolving BINDROP_BASE_PATH")?
                .join(base_path)
        };

        let capacity: usize = parse_var(&var("BINDROP_CACHE_CAPACITY", "20"), "BINDROP_CACHE_CAPACITY")?;
        let Some(cache_capacity) = NonZeroUsize::new(capacity) else {
            bail!("BINDROP_CACHE_CAPACITY must be greater than zero");
        };

        let cache_ttl = Duration::from_secs(parse_var(
            &var("BINDROP_CACHE_TTL_SECS", "600"),
            "BINDROP_CACHE_TTL_SECS",
        )?);

        let prune_interval = Duration::from_secs(parse_var(
            &var("BINDROP_PRUNE_INTERVAL_SECS", "3600"),
            "BINDROP_PRUNE_INTERVAL_SECS",
        )?);

        let artifact_name = var("BINDROP_ARTIFACT_NAME", "minio");
        if artifact_name.is_empty() || artifact_name.contains('/') {
            bail!("BINDROP_ARTIFACT_NAME must be a plain file name");
        }

        let platform: Platform = var("BINDROP_PLATFORM", "linux/amd64")
            .parse()
            .map_err(|e| anyhow::anyhow!("BINDROP_PLATFORM: {e}"))?;

        let timeout = Duration::from_secs(parse_var(
            &var("BINDROP_HTTP_TIMEOUT_SECS", "1800"),
            "BINDROP_HTTP_TIMEOUT_SECS",
        )?);

        let insecure_registries = var("BINDROP_INSECURE_REGISTRIES", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let registry = OciConfig {
            auth_token: lookup("BINDROP_REGISTRY_TOKEN").filter(|t| !t.is_empty()),
            timeout,
            platform,
            insecure_registries,
            ..OciConfig::default()
        };

        Ok(Self {
            listen_addr,
            log_level,
            base_path,
            cache_capacity,
            cache_ttl,
            prune_interval,
            artifact_name,
            registry,
        })
    }

    pub fn content(&self) -> ContentServiceConfig {
        ContentServiceConfig {
            base_path: self.base_path.clone(),
            cache_capacity: self.cache_capacity,
            cache_ttl: self.cache_ttl,
            layout: ArtifactLayout::with_name(&self.artifact_name),
        }
    }
}

fn parse_var<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}: invalid value {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.cache_capacity.get(), 20);
        assert_eq!(config.cache_ttl, Duration::from_secs(600));
        assert_eq!(config.prune_interval, Duration::from_secs(3600));
        assert_eq!(config.artifact_name, "minio");
        assert_eq!(config.log_level, "info");
        assert!(config.base_path.is_absolute());
        assert!(config.base_path.ends_with("tmp/webhook"));
        assert!(config.registry.auth_token.is_none());
        assert!(config.registry.insecure_registries.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BINDROP_BASE_PATH", "/srv/bindrop"),
            ("BINDROP_CACHE_CAPACITY", "5"),
            ("BINDROP_CACHE_TTL_SECS", "0"),
            ("BINDROP_INSECURE_REGISTRIES", "localhost:5000, registry.local"),
            ("BINDROP_REGISTRY_TOKEN", "secret"),
        ])
        .unwrap();
        assert_eq!(config.base_path, PathBuf::from("/srv/bindrop"));
        assert_eq!(config.cache_capacity.get(), 5);
        assert_eq!(config.cache_ttl, Duration::ZERO);
        assert_eq!(
            config.registry.insecure_registries,
            vec!["localhost:5000".to_string(), "registry.local".to_string()]
        );
        assert_eq!(config.registry.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = config(&[("BINDROP_CACHE_CAPACITY", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(config(&[("BINDROP_CACHE_TTL_SECS", "ten")]).is_err());
        assert!(config(&[("BINDROP_LISTEN_ADDR", "nowhere")]).is_err());
        assert!(config(&[("BINDROP_ARTIFACT_NAME", "a/b")]).is_err());
    }
}
