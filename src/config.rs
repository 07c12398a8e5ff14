//! Config modules for the application.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Bind address for the web service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Connection parameters for the remote Device Cloud.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// FQDN used when a client does not specify one alongside the username.
    #[serde(default = "default_cloud_fqdn")]
    pub default_fqdn: String,
    /// Full base URL override (e.g. a local proxy in front of the cloud).
    /// When unset, requests go to `https://{fqdn}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Hard timeout for every cloud request; a timeout is reported the same
    /// way as an unreachable host.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Device types (dpDeviceType) visible to clients; used to filter
    /// device-list queries.
    #[serde(default = "default_device_types")]
    pub supported_device_types: Vec<String>,
}

impl CloudConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            default_fqdn: default_cloud_fqdn(),
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            supported_device_types: default_device_types(),
        }
    }
}

/// Settings for cloud-side push monitors and the webhook they target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Public URL of this server's webhook endpoint, as the cloud must see
    /// it. Monitors pointing at loopback addresses are refused outright.
    #[serde(default)]
    pub public_url: String,
    /// Shared credential the cloud presents on every push. Not a user
    /// account; override via PUSHGATE_MONITOR_AUTH_USER / _PASS.
    #[serde(default = "default_monitor_user")]
    pub auth_user: String,
    #[serde(default = "default_monitor_pass")]
    pub auth_pass: String,
    /// Push batching: the cloud flushes at `batch_size` events or after
    /// `batch_duration_secs`, whichever comes first.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_batch_duration_secs")]
    pub batch_duration_secs: u32,
    #[serde(default = "default_monitor_description")]
    pub description: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            public_url: String::new(),
            auth_user: default_monitor_user(),
            auth_pass: default_monitor_pass(),
            batch_size: default_batch_size(),
            batch_duration_secs: default_batch_duration_secs(),
            description: default_monitor_description(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cloud_fqdn() -> String {
    "devicecloud.digi.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_device_types() -> Vec<String> {
    vec!["XBee WiFi S6B TH".to_string(), "XBee WiFi S6B SMT".to_string()]
}

fn default_monitor_user() -> String {
    "change".to_string()
}

fn default_monitor_pass() -> String {
    "me".to_string()
}

fn default_batch_size() -> u32 {
    1000
}

fn default_batch_duration_secs() -> u32 {
    1
}

fn default_monitor_description() -> String {
    "pushgate push monitor".to_string()
}

impl AppConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = Self::from_toml_str(&contents)
            .map_err(|e| format!("Failed to parse config file: {e}"))?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        // Try to load from standard locations in order: CWD > .config > /etc
        let config_paths = [
            std::path::PathBuf::from("pushgate.toml"),
            dirs::config_dir()
                .map(|config_dir| config_dir.join("pushgate.toml"))
                .unwrap_or_else(|| PathBuf::from("pushgate.toml")),
            std::path::PathBuf::from("/etc/pushgate/pushgate.toml"),
        ];

        let mut config = None;
        for path in &config_paths {
            if path.exists() {
                match Self::from_file(path) {
                    Ok(loaded) => {
                        tracing::info!("Loaded configuration from: {}", path.display());
                        config = Some(loaded);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                    }
                }
                // Only try the first existing config file
                break;
            }
        }

        let mut config = config.unwrap_or_else(|| {
            tracing::info!("No configuration file found, using defaults");
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    /// Secrets and deployment-specific values can be supplied through the
    /// environment instead of the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("PUSHGATE_MONITOR_AUTH_USER") {
            self.monitor.auth_user = user;
        }
        if let Ok(pass) = std::env::var("PUSHGATE_MONITOR_AUTH_PASS") {
            self.monitor.auth_pass = pass;
        }
        if let Ok(url) = std::env::var("PUSHGATE_PUBLIC_URL") {
            self.monitor.public_url = url;
        }
    }
}
