use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub default_backend: DefaultBackendConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancerKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub kind: BalancerKind,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    /// Upper bound for a single round trip to the store
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

/// A statically configured origin, for single-backend deployments and
/// local debugging. Endpoint values are single listen addresses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultBackendConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub rtmp: String,
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub rtc: String,
    #[serde(default)]
    pub srt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_timeout() -> u64 {
    3000
}

fn default_listen() -> String {
    "[::]:12025".to_string()
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            kind: BalancerKind::default(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            timeout_ms: default_redis_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.balancer.kind, BalancerKind::Memory);
        assert_eq!(config.balancer.maintenance_interval_secs, 30);
        assert_eq!(config.redis.host, "127.0.0.1");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.redis.timeout_ms, 3000);
        assert!(!config.default_backend.enabled);
        assert_eq!(config.api.listen, "[::]:12025");
    }

    #[test]
    fn test_redis_config() {
        let config = Config::parse(
            r#"
            [balancer]
            kind = "redis"

            [redis]
            host = "redis.internal"
            port = 6380
            password = "s3cret"
            db = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.balancer.kind, BalancerKind::Redis);
        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.password, "s3cret");
        assert_eq!(config.redis.db, 2);
        assert_eq!(config.redis.timeout_ms, 3000);
    }

    #[test]
    fn test_default_backend_section() {
        let config = Config::parse(
            r#"
            [default_backend]
            enabled = true
            ip = "127.0.0.1"
            rtmp = "1935"
            http = "8080"
            "#,
        )
        .unwrap();

        let backend = &config.default_backend;
        assert!(backend.enabled);
        assert_eq!(backend.ip, "127.0.0.1");
        assert_eq!(backend.rtmp, "1935");
        assert_eq!(backend.http, "8080");
        assert!(backend.srt.is_empty());
    }

    #[test]
    fn test_unknown_balancer_kind_rejected() {
        let result = Config::parse("[balancer]\nkind = \"etcd\"\n");
        assert!(result.is_err());
    }
}
