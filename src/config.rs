use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

fn default_trusted_hosts() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConnection,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConnection {
    pub base_url: String,
    /// Hosts for which the upload size limit is not enforced.
    #[serde(default = "default_trusted_hosts")]
    pub trusted_hosts: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    pub max_file_mb: u64,
    pub poll_interval_ms: u64,
    pub cleanup_grace_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            max_file_mb: 99,
            poll_interval_ms: 1000,
            cleanup_grace_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub name: String,
    pub precache: Vec<String>,
    /// File name inside the config directory.
    pub db_file: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "ai-assistant-v3".to_string(),
            precache: vec![
                "/".to_string(),
                "/static/css/style.css".to_string(),
                "/static/js/app.js".to_string(),
                "/static/img/icon-192.png".to_string(),
                "/static/img/icon-512.png".to_string(),
            ],
            db_file: "assets.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConnection {
                base_url: "http://127.0.0.1:5000".to_string(),
                trusted_hosts: default_trusted_hosts(),
                connect_timeout_secs: default_timeout_secs(),
            },
            upload: UploadConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            window: WindowConfig {
                width: 1100,
                height: 760,
                min_width: 720,
                min_height: 480,
            },
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        let mut config = if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                    eprintln!("Error parsing config.toml: {}. Using defaults.", e);
                    Config::default()
                }),
                Err(e) => {
                    eprintln!("Error reading config.toml: {}. Using defaults.", e);
                    Config::default()
                }
            }
        } else {
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            Config::default()
        };

        config.apply_env();
        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DOC_ASSISTANT_SERVER") {
            self.server.base_url = url;
        }
        if let Ok(level) = std::env::var("DOC_ASSISTANT_LOG") {
            self.logging.level = level;
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.upload.max_file_mb * MIB
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.upload.poll_interval_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.upload.cleanup_grace_ms)
    }

    /// True when the server host is one of the trusted local hosts.
    pub fn server_is_trusted(&self) -> bool {
        match reqwest::Url::parse(&self.server.base_url) {
            Ok(url) => url
                .host_str()
                .map(|host| self.server.trusted_hosts.iter().any(|h| h == host))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/doc-assistant")
        } else {
            PathBuf::from(".")
        }
    }

    pub fn cache_db_path(&self) -> PathBuf {
        Self::get_config_dir().join(&self.cache.db_file)
    }
}
