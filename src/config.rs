use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    // BuddyBoss REST root, e.g. https://school.example/wp-json/buddyboss/v1
    #[serde(default = "default_upstream_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            username: String::new(),
            password: String::new(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_assistant_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub technical_assistant_id: String,
    #[serde(default)]
    pub historical_assistant_id: String,
    #[serde(default)]
    pub synthesis_assistant_id: String,
    #[serde(default)]
    pub basic_collection_id: String,
    #[serde(default)]
    pub advanced_collection_id: String,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_run_poll_interval_ms")]
    pub run_poll_interval_ms: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_url: default_assistant_url(),
            api_key: None,
            technical_assistant_id: String::new(),
            historical_assistant_id: String::new(),
            synthesis_assistant_id: String::new(),
            basic_collection_id: String::new(),
            advanced_collection_id: String::new(),
            stage_timeout_secs: default_stage_timeout_secs(),
            run_poll_interval_ms: default_run_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,

    // Scheduler
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,

    // Control channel
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // Dashboard bootstrap view
    #[serde(default = "default_reference_user_id")]
    pub reference_user_id: i64,
    #[serde(default = "default_reference_user_name")]
    pub reference_user_name: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_upstream_url() -> String {
    "http://localhost:8080/wp-json/buddyboss/v1".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_assistant_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_stage_timeout_secs() -> u64 {
    60
}

fn default_run_poll_interval_ms() -> u64 {
    2000
}

fn default_fetch_interval_secs() -> u64 {
    3600
}

fn default_connect_retry_secs() -> u64 {
    60
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_reference_user_id() -> i64 {
    311
}

fn default_reference_user_name() -> String {
    "Dilaur".to_string()
}

fn default_database_path() -> String {
    "critique_history.db".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            assistant: AssistantConfig::default(),
            fetch_interval_secs: default_fetch_interval_secs(),
            connect_retry_secs: default_connect_retry_secs(),
            bind_host: default_bind_host(),
            port: default_port(),
            reference_user_id: default_reference_user_id(),
            reference_user_name: default_reference_user_name(),
            database_path: default_database_path(),
        }
    }
}

impl AppConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `CRITIQUE_CONFIG` if set, else critique_config.toml next to the executable
    pub fn config_path() -> PathBuf {
        match env::var("CRITIQUE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("critique_config.toml"),
        }
    }

    /// Load the config file (if any), then let environment variables override it.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        base.with_env_overrides(|key| env::var(key).ok())
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str::<AppConfig>(contents).context("Failed to parse config TOML")
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("BUDDYBOSS_BASE_URL") {
            self.upstream.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(username) = non_empty("WP_USERNAME") {
            self.upstream.username = username;
        }
        if let Some(password) = non_empty("WP_PASSWORD") {
            self.upstream.password = password;
        }
        if let Some(seconds) = non_empty("FETCH_INTERVAL_SECONDS").and_then(|v| v.parse().ok()) {
            self.fetch_interval_secs = seconds;
        }

        if let Some(url) = non_empty("OPENAI_API_URL") {
            self.assistant.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.assistant.api_key = Some(key);
        }
        if let Some(id) = non_empty("TECHNICAL_AGENT_ID") {
            self.assistant.technical_assistant_id = id;
        }
        if let Some(id) = non_empty("KNOWLEDGE_HISTORIK_AGENT_ID") {
            self.assistant.historical_assistant_id = id;
        }
        if let Some(id) = non_empty("META_AGENT_ID") {
            self.assistant.synthesis_assistant_id = id;
        }
        if let Some(id) = non_empty("BASIC_VECTOR_STORE_ID") {
            self.assistant.basic_collection_id = id;
        }
        if let Some(id) = non_empty("ADVANCED_VECTOR_STORE_ID") {
            self.assistant.advanced_collection_id = id;
        }
        if let Some(seconds) = non_empty("STAGE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.assistant.stage_timeout_secs = seconds;
        }

        if let Some(host) = non_empty("BIND_HOST") {
            self.bind_host = host;
        }
        if let Some(port) = non_empty("PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(path) = non_empty("DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(id) = non_empty("REFERENCE_USER_ID").and_then(|v| v.parse().ok()) {
            self.reference_user_id = id;
        }
        if let Some(name) = non_empty("REFERENCE_USER_NAME") {
            self.reference_user_name = name;
        }

        self
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_host, self.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{} (expected host:port)",
                    self.bind_host, self.port
                )
            })
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs.max(1))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.assistant.stage_timeout_secs.max(1))
    }
}
