use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_DATA_DIR: &str = "HELPDESK_SYNC_DATA_DIR";
pub const ENV_ENDPOINT_CONFIG: &str = "HELPDESK_SYNC_ENDPOINT_CONFIG";
pub const ENV_BASE_URL: &str = "HELPDESK_SYNC_BASE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root for tenant stores and the credential store.
    pub data_dir: PathBuf,
    /// Declarative endpoint configuration file.
    pub endpoint_config: PathBuf,
    /// `{subdomain}` is replaced with the tenant subdomain.
    pub base_url_template: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub per_page: usize,
    pub request_timeout_secs: u64,
    /// Ceiling on pages followed for a single concrete path.
    pub max_pages: Option<usize>,
    /// Wall-clock budget for paginating a single concrete path.
    pub endpoint_deadline_secs: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            per_page: 100,
            request_timeout_secs: 10,
            max_pages: Some(10_000),
            endpoint_deadline_secs: None,
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn endpoint_deadline(&self) -> Option<Duration> {
        self.endpoint_deadline_secs.map(Duration::from_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            endpoint_config: PathBuf::from("./config/api_endpoint_config.json"),
            base_url_template: "https://{subdomain}.zendesk.com".to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str::<AppConfig>(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => AppConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(ENV_ENDPOINT_CONFIG) {
            self.endpoint_config = PathBuf::from(file);
        }
        if let Some(template) = lookup(ENV_BASE_URL) {
            self.base_url_template = template;
        }
    }

    pub fn tenants_dir(&self) -> PathBuf {
        self.data_dir.join("tenants")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn base_url_for(&self, subdomain: &str) -> String {
        self.base_url_template
            .replace("{subdomain}", subdomain)
            .trim_end_matches('/')
            .to_string()
    }
}
