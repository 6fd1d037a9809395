use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_realtime::ingestors::{BridgeConfig, KafkaConfig};

const DEFAULT_CONFIG_FILE: &str = "server_realtime.conf";

/// How `/ws` credentials are checked.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// HS256 bearer tokens signed with `jwt_secret`.
    Jwt,
    /// Any non-empty token is accepted as the development user.
    Static,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Realtime unit telemetry WebSocket relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "REALTIME_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "REALTIME_HOST", help = "Address to bind.")]
    pub host: Option<String>,

    #[clap(long, env = "REALTIME_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "REALTIME_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "REALTIME_LOG_LEVEL", help = "Logging level or filter directive.")]
    pub log_level: Option<String>,

    #[clap(long, env = "REALTIME_KAFKA_BROKERS", help = "Comma separated Kafka bootstrap servers.")]
    pub kafka_brokers: Option<String>,

    #[clap(long, env = "REALTIME_KAFKA_TOPIC", help = "Topic carrying unit records.")]
    pub kafka_topic: Option<String>,

    #[clap(long, env = "REALTIME_KAFKA_GROUP_ID", help = "Consumer group id.")]
    pub kafka_group_id: Option<String>,

    #[clap(long, env = "REALTIME_KAFKA_SESSION_TIMEOUT_SECONDS", help = "Consumer group session timeout.")]
    pub kafka_session_timeout_seconds: Option<u64>,

    #[clap(long, env = "REALTIME_KAFKA_METADATA_TIMEOUT_SECONDS", help = "Startup broker metadata timeout.")]
    pub kafka_metadata_timeout_seconds: Option<u64>,

    #[clap(long, env = "REALTIME_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds between stream retries.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "REALTIME_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds between stream retries.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "REALTIME_PARTITION_QUEUE_CAPACITY", help = "Messages buffered per partition worker.")]
    pub partition_queue_capacity: Option<usize>,

    #[clap(long, env = "REALTIME_AUTH_MODE", value_enum, help = "Credential check: jwt or static.")]
    pub auth_mode: Option<AuthMode>,

    #[clap(long, env = "REALTIME_JWT_SECRET", hide_env_values = true, help = "Shared HS256 secret.")]
    pub jwt_secret: Option<String>,

    #[clap(long, env = "REALTIME_DATABASE_URL", hide_env_values = true, help = "Postgres URL for the unit directory.")]
    pub database_url: Option<String>,

    #[clap(long, env = "REALTIME_REDIS_URL", hide_env_values = true, help = "Redis URL for last-known snapshots.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "REALTIME_REDIS_KEY_PREFIX", help = "Key prefix of cached unit records.")]
    pub redis_key_prefix: Option<String>,

    #[clap(long, env = "REALTIME_READ_TIMEOUT_SECONDS", help = "Time limit for answering an HTTP request.")]
    pub read_timeout_seconds: Option<u64>,

    #[clap(long, env = "REALTIME_WRITE_TIMEOUT_SECONDS", help = "Per-frame WebSocket write timeout.")]
    pub write_timeout_seconds: Option<u64>,

    #[clap(long, env = "REALTIME_SHUTDOWN_GRACE_SECONDS", help = "Grace period for in-flight work at shutdown.")]
    pub shutdown_grace_seconds: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    pub fn defaults() -> Config {
        Config {
            port: Some(8080),
            host: Some("0.0.0.0".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            kafka_brokers: Some("localhost:9092".to_string()),
            kafka_topic: Some("realtime".to_string()),
            kafka_group_id: Some("realtime-consumer".to_string()),
            kafka_session_timeout_seconds: Some(15),
            kafka_metadata_timeout_seconds: Some(10),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(30000),
            partition_queue_capacity: Some(256),
            auth_mode: Some(AuthMode::Jwt),
            jwt_secret: Some("supersecret".to_string()),
            redis_key_prefix: Some("unit:last:".to_string()),
            read_timeout_seconds: Some(15),
            write_timeout_seconds: Some(15),
            shutdown_grace_seconds: Some(5),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            host: other.host.or(self.host),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            kafka_brokers: other.kafka_brokers.or(self.kafka_brokers),
            kafka_topic: other.kafka_topic.or(self.kafka_topic),
            kafka_group_id: other.kafka_group_id.or(self.kafka_group_id),
            kafka_session_timeout_seconds: other.kafka_session_timeout_seconds.or(self.kafka_session_timeout_seconds),
            kafka_metadata_timeout_seconds: other.kafka_metadata_timeout_seconds.or(self.kafka_metadata_timeout_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            partition_queue_capacity: other.partition_queue_capacity.or(self.partition_queue_capacity),
            auth_mode: other.auth_mode.or(self.auth_mode),
            jwt_secret: other.jwt_secret.or(self.jwt_secret),
            database_url: other.database_url.or(self.database_url),
            redis_url: other.redis_url.or(self.redis_url),
            redis_key_prefix: other.redis_key_prefix.or(self.redis_key_prefix),
            read_timeout_seconds: other.read_timeout_seconds.or(self.read_timeout_seconds),
            write_timeout_seconds: other.write_timeout_seconds.or(self.write_timeout_seconds),
            shutdown_grace_seconds: other.shutdown_grace_seconds.or(self.shutdown_grace_seconds),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    pub fn bind_address(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(8080)
        )
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode.unwrap_or(AuthMode::Jwt)
    }

    pub fn jwt_secret(&self) -> &str {
        self.jwt_secret.as_deref().unwrap_or("supersecret")
    }

    pub fn redis_key_prefix(&self) -> &str {
        self.redis_key_prefix.as_deref().unwrap_or("unit:last:")
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds.unwrap_or(15))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds.unwrap_or(15))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds.unwrap_or(5))
    }

    /// Both paths, only when TLS is fully configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn kafka_config(&self) -> KafkaConfig {
        let defaults = KafkaConfig::default();
        KafkaConfig {
            brokers: self.kafka_brokers.clone().unwrap_or(defaults.brokers),
            topic: self.kafka_topic.clone().unwrap_or(defaults.topic),
            group_id: self.kafka_group_id.clone().unwrap_or(defaults.group_id),
            session_timeout: self
                .kafka_session_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            metadata_timeout: self
                .kafka_metadata_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.metadata_timeout),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        let base = self
            .reconnect_base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_base_delay);
        let max = self
            .reconnect_max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_max_delay);
        BridgeConfig {
            reconnect_base_delay: base,
            reconnect_max_delay: max.max(base),
            partition_queue_capacity: self
                .partition_queue_capacity
                .unwrap_or(defaults.partition_queue_capacity)
                .max(1),
        }
    }
}

/// Expands a leading `~/` against the home directory.
fn expand_home(path: PathBuf) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path,
    }
}

/// Layers defaults, the JSON config file and `cli` (CLI args + env).
///
/// A missing config file is fine; one that exists but cannot be read or
/// parsed is an error.
pub fn resolve_config(cli: Config) -> Result<Config> {
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. Load from config file if present. The CLI/env may point elsewhere.
    let config_file_path = expand_home(
        cli.config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
    );

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file: {}", config_file_path.display()))?;
        let file_config = serde_json::from_str::<Config>(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    }

    // 3. Override with environment variables and CLI arguments
    current_config = current_config.merge(cli);

    current_config.config_path = Some(config_file_path);
    current_config.log_dir = current_config.log_dir.map(expand_home);
    current_config.tls_cert_path = current_config.tls_cert_path.map(expand_home);
    current_config.tls_key_path = current_config.tls_key_path.map(expand_home);

    Ok(current_config)
}

pub fn load_config() -> Result<Config> {
    resolve_config(Config::parse())
}
