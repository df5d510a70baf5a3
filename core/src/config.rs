use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: ClusterConfig,
    pub destination: ClusterConfig,
    pub transfer: TransferConfig,
    pub dump: DumpConfig,
    pub telemetry: TelemetryConfig,
}

/// Connection parameters for one Elasticsearch cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Comma-separated list of base URLs
    pub hosts: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    pub docs_per_request: usize,
    pub scroll_keepalive: String,
    /// Search body used for both `_count` and the scroll, as JSON text
    pub query: String,
    pub copy_index_settings: bool,
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DumpConfig {
    pub dir: PathBuf,
    pub max_docs_per_file: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl ClusterConfig {
    pub fn host_list(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl TransferConfig {
    /// Parse the configured query text into a JSON object.
    pub fn query_body(&self) -> Result<serde_json::Value, ConfigError> {
        parse_query(&self.query)
    }
}

pub fn parse_query(text: &str) -> Result<serde_json::Value, ConfigError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ConfigError::Message(format!("invalid JSON query: {}", e)))?;

    if !value.is_object() {
        return Err(ConfigError::Message(
            "invalid JSON query: expected a JSON object".into(),
        ));
    }

    Ok(value)
}

impl Config {
    /// Layer defaults, `config.toml` and `MIGRATOR__*` variables. The result is
    /// not validated: callers apply their overrides, then call `validate`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Layer on config file if it exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Layer on environment variables (MIGRATOR_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("MIGRATOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.host_list().is_empty() {
            return Err(ConfigError::Message("source.hosts is required".into()));
        }

        if self.destination.host_list().is_empty() {
            return Err(ConfigError::Message(
                "destination.hosts is required".into(),
            ));
        }

        if self.transfer.docs_per_request == 0 {
            return Err(ConfigError::Message(
                "transfer.docs_per_request must be greater than 0".into(),
            ));
        }

        if self.dump.max_docs_per_file == 0 {
            return Err(ConfigError::Message(
                "dump.max_docs_per_file must be greater than 0".into(),
            ));
        }

        self.transfer.query_body()?;

        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: ClusterConfig::default(),
            destination: ClusterConfig::default(),
            transfer: TransferConfig {
                docs_per_request: 10000,
                scroll_keepalive: "5m".to_string(),
                query: r#"{"query": {"match_all": {}}}"#.to_string(),
                copy_index_settings: true,
                progress_interval_secs: 5,
            },
            dump: DumpConfig {
                dir: PathBuf::from("./dumps"),
                max_docs_per_file: 100,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: false,
                metrics_port: 9090,
            },
        }
    }
}
