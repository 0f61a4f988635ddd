use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub reader: ReaderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub max_concurrent_fetches: usize,
    pub prefetch_concurrency: usize,
    pub stall_timeout_secs: u64,
    pub preload_pages: usize,
    pub prefetch_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4567".to_string(),
            username: None,
            password: None,
            reader: ReaderConfig::default(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 3,
            prefetch_concurrency: 1,
            stall_timeout_secs: 30,
            preload_pages: 3,
            prefetch_pages: 2,
        }
    }
}

pub fn app_dir(base: Option<PathBuf>) -> PathBuf {
    let dir = base
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tachidesk-tui");
    fs::create_dir_all(&dir).ok();
    dir
}

pub fn config_path() -> PathBuf {
    app_dir(dirs::config_dir()).join("config.json")
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    /// Missing or unreadable files fall back to the defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Config::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!("ignoring invalid config {}: {}", path.display(), e);
                Config::default()
            }),
            Err(e) => {
                log::warn!("could not read config {}: {}", path.display(), e);
                Config::default()
            }
        }
    }

    pub fn save(&self) {
        self.save_to(&config_path());
    }

    pub fn save_to(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(content) => {
                if let Err(e) = fs::write(path, content) {
                    log::warn!("could not write config {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!("could not serialize config: {}", e),
        }
    }
}
