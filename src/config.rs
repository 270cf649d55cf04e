//! Configuration for Spindle
//!
//! Loaded from a TOML file, then overlaid with environment variables for
//! secrets (sensor tokens and sink credentials). Unknown keys are rejected
//! so typos fail fast instead of silently running with defaults.

use crate::error::{Result, SpindleError};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Main configuration for Spindle
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub enrichment: EnrichmentConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Ingest listener address
    pub listen_address: String,
    /// Serve the ingest listener over TLS
    pub tls: bool,
    pub cert_file: String,
    pub key_file: String,
    /// Management listener (health, readiness, metrics); empty disables it
    pub management_listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8443".to_string(),
            tls: false,
            cert_file: String::new(),
            key_file: String::new(),
            management_listen_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    /// File of `token,sensor_id` lines; `#` starts a comment
    pub token_file: String,
    /// Inline token -> sensor-id map
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    pub max_body_size_bytes: u64,
    pub max_events_per_batch: usize,
    pub max_event_size_bytes: u64,
    /// Requests per second per sensor; 0 = default (50), negative = disabled
    pub per_sensor_rps: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size_bytes: 2 * 1024 * 1024,
            max_events_per_batch: 500,
            max_event_size_bytes: 128 * 1024,
            per_sensor_rps: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EnrichmentConfig {
    /// MaxMind City database; empty skips geo enrichment
    pub geoip_db_path: String,
    /// MaxMind ASN database; empty skips ASN enrichment
    pub asn_db_path: String,
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub cache_ttl_seconds: i64,
    pub max_qps: i64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_seconds: 300,
            max_qps: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputConfig {
    /// One of "stdout", "elasticsearch", "clickhouse"
    pub r#type: String,
    pub elasticsearch_url: String,
    pub elasticsearch_index: String,
    pub elasticsearch_user: String,
    pub elasticsearch_pass: String,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_table: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    pub outbox: OutboxConfig,
    /// Skip the ClickHouse connectivity probe (tests only)
    #[serde(skip)]
    pub skip_clickhouse_ping: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            r#type: "stdout".to_string(),
            elasticsearch_url: String::new(),
            elasticsearch_index: String::new(),
            elasticsearch_user: String::new(),
            elasticsearch_pass: String::new(),
            clickhouse_url: String::new(),
            clickhouse_database: String::new(),
            clickhouse_table: String::new(),
            clickhouse_user: String::new(),
            clickhouse_password: String::new(),
            outbox: OutboxConfig::default(),
            skip_clickhouse_ping: false,
        }
    }
}

/// Local disk spooling for failed ClickHouse batches
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutboxConfig {
    pub enabled: bool,
    pub dir: String,
    /// Total spool size cap in bytes; 0 or negative = uncapped
    pub max_bytes: i64,
    /// Events per spool file; 0 = flush threshold
    pub max_batch_size: usize,
    pub retry_backoff_seconds: u64,
    pub retry_max_backoff_seconds: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: String::new(),
            max_bytes: 0,
            max_batch_size: 0,
            retry_backoff_seconds: 1,
            retry_max_backoff_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Json
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
}

impl Config {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| SpindleError::Config(format!("read config: {e}")))?;
        let mut config: Config = toml::from_str(&data)
            .map_err(|e| SpindleError::Config(format!("parse config: {e}")))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for secrets, applied after the file parse.
    ///
    /// `SPINDLE_SENSOR_<ID>=<token>` adds a credential (underscores in the
    /// ID become dashes). Sink credentials come from
    /// `SPINDLE_ELASTICSEARCH_USER`/`_PASS` and
    /// `SPINDLE_CLICKHOUSE_USER`/`_PASSWORD`.
    fn apply_env(&mut self) -> Result<()> {
        for (key, value) in env::vars() {
            let Some(raw_id) = key.strip_prefix("SPINDLE_SENSOR_") else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let sensor_id = raw_id.replace('_', "-");
            self.auth.tokens.insert(value, sensor_id);
        }
        if !self.auth.token_file.is_empty() {
            let data = fs::read_to_string(&self.auth.token_file)
                .map_err(|e| SpindleError::Config(format!("auth token_file: {e}")))?;
            for line in data.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((token, sensor_id)) = line.split_once(',') else {
                    continue;
                };
                let token = token.trim();
                let sensor_id = sensor_id.trim();
                if !token.is_empty() && !sensor_id.is_empty() {
                    self.auth
                        .tokens
                        .insert(token.to_string(), sensor_id.to_string());
                }
            }
        }
        if let Ok(user) = env::var("SPINDLE_ELASTICSEARCH_USER") {
            if !user.is_empty() {
                self.output.elasticsearch_user = user;
            }
        }
        if let Ok(pass) = env::var("SPINDLE_ELASTICSEARCH_PASS") {
            if !pass.is_empty() {
                self.output.elasticsearch_pass = pass;
            }
        }
        if let Ok(user) = env::var("SPINDLE_CLICKHOUSE_USER") {
            if !user.is_empty() {
                self.output.clickhouse_user = user;
            }
        }
        if let Ok(pass) = env::var("SPINDLE_CLICKHOUSE_PASSWORD") {
            if !pass.is_empty() {
                self.output.clickhouse_password = pass;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.tls {
            if self.server.cert_file.is_empty() || self.server.key_file.is_empty() {
                return Err(SpindleError::Config(
                    "server: tls enabled but cert_file or key_file missing".to_string(),
                ));
            }
            for (name, path) in [
                ("cert_file", &self.server.cert_file),
                ("key_file", &self.server.key_file),
            ] {
                if let Err(e) = fs::metadata(path) {
                    return Err(SpindleError::Config(format!(
                        "server: {name} {path:?} not readable: {e}"
                    )));
                }
            }
        }
        if self.auth.tokens.is_empty() {
            return Err(SpindleError::Config(
                "auth: no tokens configured (use token_file or SPINDLE_SENSOR_* env)".to_string(),
            ));
        }
        // One token per sensor
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (token, sensor_id) in &self.auth.tokens {
            if let Some(prev) = seen.get(sensor_id.as_str()) {
                if *prev != token.as_str() {
                    return Err(SpindleError::Config(format!(
                        "auth: sensor {sensor_id:?} has multiple tokens"
                    )));
                }
            }
            seen.insert(sensor_id, token);
        }
        match self.output.r#type.as_str() {
            "stdout" | "elasticsearch" | "clickhouse" => {}
            other => {
                return Err(SpindleError::Config(format!(
                    "output: unknown type {other:?}"
                )))
            }
        }
        if self.output.r#type == "elasticsearch" && self.output.elasticsearch_url.is_empty() {
            return Err(SpindleError::Config(
                "output: elasticsearch_url required when type=elasticsearch".to_string(),
            ));
        }
        if self.output.r#type == "clickhouse" && self.output.clickhouse_url.is_empty() {
            return Err(SpindleError::Config(
                "output: clickhouse_url required when type=clickhouse".to_string(),
            ));
        }
        if self.output.outbox.enabled && self.output.outbox.dir.is_empty() {
            return Err(SpindleError::Config(
                "output: outbox.dir required when outbox is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
