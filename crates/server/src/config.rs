use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use library::EngineConfig;
use metadata::FactoryLimits;
use scanner::ScannerConfig;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    /// Directory URLs the scanner starts from.
    pub root_urls: Vec<String>,
    pub port: u16,
    pub snapshot_path: String,
    pub scan_on_start: bool,
    pub parallel_scan: bool,
    pub fetch_timeout_secs: u64,
    pub max_depth: u32,
    pub max_entries_per_dir: usize,
    pub parallel_batch: usize,
    pub max_tag_read_bytes: u64,
    pub max_cover_bytes: usize,
    pub root_markers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let scanner = ScannerConfig::default();
        let factory = FactoryLimits::default();
        Self {
            version: CONFIG_VERSION,
            root_urls: Vec::new(),
            port: 3000,
            snapshot_path: "library.json".to_string(),
            scan_on_start: true,
            parallel_scan: false,
            fetch_timeout_secs: scanner.fetch_timeout.as_secs(),
            max_depth: scanner.max_depth,
            max_entries_per_dir: scanner.max_entries_per_dir,
            parallel_batch: scanner.parallel_batch,
            max_tag_read_bytes: factory.max_read_bytes,
            max_cover_bytes: factory.max_cover_bytes,
            root_markers: factory.root_markers,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("TONEARM_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.snapshot_path.trim().is_empty() {
            config.snapshot_path = "library.json".to_string();
        }
        if config.port == 0 {
            config.port = 3000;
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn engine_config(config: &ServerConfig) -> EngineConfig {
    EngineConfig {
        scanner: ScannerConfig {
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs.max(1)),
            max_depth: config.max_depth,
            max_entries_per_dir: config.max_entries_per_dir,
            parallel_batch: config.parallel_batch.max(1),
            ..ScannerConfig::default()
        },
        factory: FactoryLimits {
            max_read_bytes: config.max_tag_read_bytes,
            max_cover_bytes: config.max_cover_bytes,
            root_markers: config.root_markers.clone(),
        },
        parallel: config.parallel_scan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.port, 3000);

        let (reloaded, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(reloaded.snapshot_path, "library.json");
    }

    #[test]
    fn engine_config_carries_limit_overrides() {
        let config = ServerConfig {
            fetch_timeout_secs: 5,
            max_depth: 3,
            parallel_scan: true,
            ..ServerConfig::default()
        };
        let engine = engine_config(&config);
        assert_eq!(engine.scanner.fetch_timeout, Duration::from_secs(5));
        assert_eq!(engine.scanner.max_depth, 3);
        assert!(engine.parallel);
    }
}
