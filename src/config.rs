use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

pub const CONFIG_DIR: &str = ".wager-client";
const CONFIG_FILE: &str = "config.json";
pub const BACKEND_URL_ENV: &str = "WAGER_BACKEND_URL";
pub const API_KEY_ENV: &str = "WAGER_API_KEY";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_LIST_LIMIT: usize = 50;

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            api_key: None,
            email: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            list_limit: DEFAULT_LIST_LIMIT,
            log_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn list_limit(&self) -> usize {
        self.list_limit.max(1)
    }

    /// Applies `WAGER_BACKEND_URL` and `WAGER_API_KEY` when set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(BACKEND_URL_ENV).ok(),
            std::env::var(API_KEY_ENV).ok(),
        )
    }

    fn with_overrides(mut self, backend_url: Option<String>, api_key: Option<String>) -> Self {
        if let Some(url) = backend_url.filter(|v| !v.trim().is_empty()) {
            self.backend_url = Some(url);
        }
        if let Some(key) = api_key.filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(key);
        }
        self
    }

    /// Backend url and api key, or an error naming what is missing.
    pub fn remote(&self) -> Result<(&str, &str)> {
        let url = self.backend_url.as_deref().ok_or_else(|| {
            eyre!("No backend url configured; set backend_url or {BACKEND_URL_ENV}")
        })?;
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| eyre!("No api key configured; set api_key or {API_KEY_ENV}"))?;
        Ok((url, key))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        match self.log_dir.as_deref() {
            Some(raw) => Ok(expand(raw)),
            None => Ok(default_config_dir()?.join("logs")),
        }
    }
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Opens the config file, creating an empty one on first use.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(raw) => expand(raw),
            None => default_config_dir()?.join(CONFIG_FILE),
        };
        ensure_file(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ClientConfig> {
        read_config(&self.path)
    }

    pub fn save(&self, config: &ClientConfig) -> Result<()> {
        write_config(&self.path, config)
    }
}

pub fn default_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").wrap_err("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(CONFIG_DIR))
}

fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn ensure_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).wrap_err_with(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
    }
    if !path.exists() {
        fs::write(path, b"")
            .wrap_err_with(|| format!("Failed to create config file {}", path.display()))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<ClientConfig> {
    let data = fs::read(path)
        .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(ClientConfig::default());
    }
    serde_json::from_slice(&data)
        .wrap_err_with(|| format!("Failed to parse config JSON in {}", path.display()))
}

fn write_config(path: &Path, config: &ClientConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).wrap_err("Failed to serialize config")?;
    fs::write(path, json)
        .wrap_err_with(|| format!("Failed to write config file {}", path.display()))
}
