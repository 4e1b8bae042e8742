use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VisualboardError};

/// Which analysis/board deployment the panel talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerEnv {
    Dev,
    #[default]
    Prod,
}

impl ServerEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerEnv::Dev => "dev",
            ServerEnv::Prod => "prod",
        }
    }

    /// Lenient parse used for the persisted `server_env` setting.
    /// Anything unrecognised falls back to prod.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("dev") => ServerEnv::Dev,
            _ => ServerEnv::Prod,
        }
    }
}

impl std::fmt::Display for ServerEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerEnv {
    type Err = VisualboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "dev" => Ok(ServerEnv::Dev),
            "prod" => Ok(ServerEnv::Prod),
            other => Err(VisualboardError::ConfigError(format!(
                "server env must be dev or prod, got {}",
                other
            ))),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub content: ContentConfig,

    #[serde(default)]
    pub background: BackgroundConfig,

    #[serde(default)]
    pub sidepanel: SidePanelConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Selected deployment
    #[serde(default)]
    pub env: ServerEnv,

    #[serde(default = "default_dev_base_url")]
    pub dev_base_url: String,

    #[serde(default = "default_prod_base_url")]
    pub prod_base_url: String,

    /// Optional request timeout. Unset means the HTTP stack default.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            env: ServerEnv::default(),
            dev_base_url: default_dev_base_url(),
            prod_base_url: default_prod_base_url(),
            request_timeout_secs: None,
        }
    }
}

fn default_dev_base_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_prod_base_url() -> String {
    "https://rofan.world".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Chat site host the content bridge attaches to
    #[serde(default = "default_host")]
    pub host: String,

    /// Provider id reported in turn messages
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Quiet period before a mutation burst is evaluated
    #[serde(default = "default_mutation_debounce_ms")]
    pub mutation_debounce_ms: u64,

    /// Minimum gap between two new-turn pushes
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// URL path poll interval
    #[serde(default = "default_location_poll_ms")]
    pub location_poll_ms: u64,

    /// Legacy text-selection relay
    #[serde(default)]
    pub selection_mode: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            provider: default_provider(),
            mutation_debounce_ms: default_mutation_debounce_ms(),
            min_request_interval_ms: default_min_request_interval_ms(),
            location_poll_ms: default_location_poll_ms(),
            selection_mode: false,
        }
    }
}

fn default_host() -> String {
    "rofan.ai".to_string()
}

fn default_provider() -> String {
    crate::protocol::runtime::PROVIDER_ROFAN_AI.to_string()
}

fn default_mutation_debounce_ms() -> u64 {
    500
}

fn default_min_request_interval_ms() -> u64 {
    500
}

fn default_location_poll_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Delay between content-bridge re-injection and the retried forward
    #[serde(default = "default_reinject_retry_delay_ms")]
    pub reinject_retry_delay_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            reinject_retry_delay_ms: default_reinject_retry_delay_ms(),
        }
    }
}

fn default_reinject_retry_delay_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidePanelConfig {
    /// Outbound iframe pushes closer than this are refused
    #[serde(default = "default_min_post_interval_ms")]
    pub min_post_interval_ms: u64,

    /// Initial state of the auto-update toggle
    #[serde(default)]
    pub auto_update: bool,

    /// Wait after mount before the one-shot restore
    #[serde(default = "default_mount_restore_delay_ms")]
    pub mount_restore_delay_ms: u64,
}

impl Default for SidePanelConfig {
    fn default() -> Self {
        Self {
            min_post_interval_ms: default_min_post_interval_ms(),
            auto_update: false,
            mount_restore_delay_ms: default_mount_restore_delay_ms(),
        }
    }
}

fn default_min_post_interval_ms() -> u64 {
    100
}

fn default_mount_restore_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the file-backed store
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from all sources (file, env, defaults)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // VISUALBOARD_SERVER__ENV=dev, VISUALBOARD_SIDEPANEL__AUTO_UPDATE=true, ...
            .merge(Env::prefixed("VISUALBOARD_").split("__"))
            .extract()
            .map_err(|e| VisualboardError::ConfigError(e.to_string()))?;

        Ok(config)
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rofan-visualboard")
            .join("config.toml")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| VisualboardError::ConfigError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Remote base URL for the given environment
    pub fn base_url_for(&self, env: ServerEnv) -> String {
        let url = match env {
            ServerEnv::Dev => &self.server.dev_base_url,
            ServerEnv::Prod => &self.server.prod_base_url,
        };
        url.trim_end_matches('/').to_string()
    }

    pub fn base_url(&self) -> String {
        self.base_url_for(self.server.env)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rofan-visualboard")
        })
    }

    pub fn mutation_debounce(&self) -> Duration {
        Duration::from_millis(self.content.mutation_debounce_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.content.min_request_interval_ms)
    }

    pub fn location_poll_interval(&self) -> Duration {
        Duration::from_millis(self.content.location_poll_ms)
    }

    pub fn reinject_retry_delay(&self) -> Duration {
        Duration::from_millis(self.background.reinject_retry_delay_ms)
    }

    pub fn min_post_interval(&self) -> Duration {
        Duration::from_millis(self.sidepanel.min_post_interval_ms)
    }

    pub fn mount_restore_delay(&self) -> Duration {
        Duration::from_millis(self.sidepanel.mount_restore_delay_ms)
    }
}

/// Iframe source for a base URL
pub fn board_frame_src(base_url: &str) -> String {
    format!("{}/test-board?embed=1", base_url.trim_end_matches('/'))
}
