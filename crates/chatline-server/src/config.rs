use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use chatline_api::CoreConfig;
use chatline_delivery::{CacheConfig, PipelineConfig, ReconcilerConfig};
use chatline_gateway::backoff::RetryPolicy;

/// Everything the binary reads from the environment (`CHATLINE_*`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub admin_token: Option<String>,
    pub node_id: Option<String>,
    pub store_timeout: Duration,
    pub cache_window: usize,
    pub cache_ttl: Duration,
    pub history_limit: usize,
    pub workers: usize,
    pub queue_size: usize,
    pub max_retries: u32,
    pub phantom_enabled: bool,
    pub phantom_interval: Duration,
    pub phantom_grace: Duration,
    pub phantom_lookback: Duration,
    pub status_retention: Duration,
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        _ => Ok(default),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> anyhow::Result<Duration> {
    parse(lookup, name, default).map(Duration::from_secs)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            host: optional("CHATLINE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "CHATLINE_PORT", 3000)?,
            db_path: optional("CHATLINE_DB_PATH")
                .unwrap_or_else(|| "chatline.db".into())
                .into(),
            admin_token: optional("CHATLINE_ADMIN_TOKEN"),
            node_id: optional("CHATLINE_NODE_ID"),
            store_timeout: parse(&lookup, "CHATLINE_STORE_TIMEOUT_MS", 3000).map(Duration::from_millis)?,
            cache_window: parse(&lookup, "CHATLINE_CACHE_WINDOW", 1000)?,
            cache_ttl: secs(&lookup, "CHATLINE_CACHE_TTL_SECS", 86_400)?,
            history_limit: parse(&lookup, "CHATLINE_HISTORY_LIMIT", 50)?,
            workers: parse(&lookup, "CHATLINE_WORKERS", 10)?,
            queue_size: parse(&lookup, "CHATLINE_QUEUE_SIZE", 1000)?,
            max_retries: parse(&lookup, "CHATLINE_MAX_RETRIES", 3)?,
            phantom_enabled: parse(&lookup, "CHATLINE_PHANTOM_ENABLED", true)?,
            phantom_interval: secs(&lookup, "CHATLINE_PHANTOM_INTERVAL_SECS", 60)?,
            phantom_grace: secs(&lookup, "CHATLINE_PHANTOM_GRACE_SECS", 30)?,
            phantom_lookback: secs(&lookup, "CHATLINE_PHANTOM_LOOKBACK_SECS", 86_400)?,
            status_retention: secs(&lookup, "CHATLINE_STATUS_RETENTION_SECS", 604_800)?,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn core(&self) -> CoreConfig {
        let defaults = CoreConfig::default();
        CoreConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            admin_token: self.admin_token.clone(),
            history_limit: self.history_limit,
            cache: CacheConfig {
                window: self.cache_window,
                ttl: self.cache_ttl,
            },
            pipeline: PipelineConfig {
                workers: self.workers.max(1),
                queue_size: self.queue_size.max(1),
                retry: RetryPolicy {
                    max_retries: self.max_retries,
                    ..RetryPolicy::default()
                },
                ..PipelineConfig::default()
            },
            reconciler: ReconcilerConfig {
                enabled: self.phantom_enabled,
                interval: self.phantom_interval.max(Duration::from_secs(1)),
                grace: self.phantom_grace,
                lookback: self.phantom_lookback,
                retention: self.status_retention,
                ..ReconcilerConfig::default()
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.addr().unwrap().port(), 3000);
        assert_eq!(config.store_timeout, Duration::from_secs(3));
        assert!(config.admin_token.is_none());

        let core = config.core();
        assert_eq!(core.pipeline.workers, 10);
        assert_eq!(core.pipeline.retry.max_retries, 3);
        assert_eq!(core.cache.window, 1000);
        assert_eq!(core.reconciler.grace, Duration::from_secs(30));
        assert!(!core.node_id.is_empty());
    }

    #[test]
    fn values_are_read_and_validated() {
        let config = load(&[
            ("CHATLINE_PORT", "8080"),
            ("CHATLINE_ADMIN_TOKEN", "s3cret"),
            ("CHATLINE_NODE_ID", "edge-1"),
            ("CHATLINE_PHANTOM_ENABLED", "false"),
            ("CHATLINE_CACHE_WINDOW", "20"),
            ("CHATLINE_DB_PATH", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, PathBuf::from("chatline.db"));

        let core = config.core();
        assert_eq!(core.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(core.node_id, "edge-1");
        assert!(!core.reconciler.enabled);
        assert_eq!(core.cache.window, 20);

        let err = load(&[("CHATLINE_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("CHATLINE_WORKERS"));
    }
}
