use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Empty strings mean "use the default location under the home directory".
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PathsConfig {
    #[serde(default)]
    pub projects_dir: String,
    #[serde(default)]
    pub cache_file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IndexConfig {
    pub scan_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    pub source_ttl_secs: u64,
    pub derived_capacity: usize,
    /// Files above this size are scanned ad hoc instead of being held in memory.
    pub max_source_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaginationConfig {
    pub default_per_page: usize,
    pub max_per_page: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            source_ttl_secs: 300,
            derived_capacity: 200,
            max_source_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_per_page: 50,
            max_per_page: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("Could not find home directory")
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(home_dir()?.join(".session-tracer.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }

    /// Directory holding one subdirectory per project.
    pub fn projects_dir(&self) -> Result<PathBuf> {
        if !self.paths.projects_dir.is_empty() {
            return Ok(PathBuf::from(&self.paths.projects_dir));
        }
        Ok(home_dir()?.join(".claude").join("projects"))
    }

    /// Side file for the durable aggregate cache.
    pub fn cache_file(&self) -> Result<PathBuf> {
        if !self.paths.cache_file.is_empty() {
            return Ok(PathBuf::from(&self.paths.cache_file));
        }
        Ok(home_dir()?.join(".claude").join("tracer-cache.json"))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.index.scan_interval_secs.max(1))
    }

    pub fn source_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.source_ttl_secs)
    }

    /// Clamp a requested page size into `1..=max_per_page`.
    pub fn clamp_per_page(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.pagination.default_per_page)
            .clamp(1, self.pagination.max_per_page.max(1))
    }
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("Created default configuration file.");
        println!("   {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            println!("Current configuration:");
            println!("   Projects Dir: {}", config.projects_dir()?.display());
            println!("   Cache File: {}", config.cache_file()?.display());
            println!("   Scan Interval: {}s", config.index.scan_interval_secs);
            println!("   Source TTL: {}s", config.cache.source_ttl_secs);
            println!("   Derived Capacity: {}", config.cache.derived_capacity);
            println!("   Max Source Bytes: {}", config.cache.max_source_bytes);
            println!("   Default Per Page: {}", config.pagination.default_per_page);
            println!("   Max Per Page: {}", config.pagination.max_per_page);
            println!("   Log Level: {}", config.logging.level);
        }
        None => {
            println!("No configuration file found.");
            println!("   Run 'session-tracer config init' to create one.");
        }
    }
    Ok(())
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "projects-dir" => config.paths.projects_dir = value.to_string(),
        "cache-file" => config.paths.cache_file = value.to_string(),
        "scan-interval" => {
            config.index.scan_interval_secs = value
                .parse::<u64>()
                .context("Invalid number value for scan-interval")?;
        }
        "source-ttl" => {
            config.cache.source_ttl_secs = value
                .parse::<u64>()
                .context("Invalid number value for source-ttl")?;
        }
        "derived-capacity" => {
            let capacity = value
                .parse::<usize>()
                .context("Invalid number value for derived-capacity")?;
            if capacity < 4 {
                anyhow::bail!("derived-capacity must be at least 4");
            }
            config.cache.derived_capacity = capacity;
        }
        "max-source-bytes" => {
            config.cache.max_source_bytes = value
                .parse::<u64>()
                .context("Invalid number value for max-source-bytes")?;
        }
        "default-per-page" => {
            config.pagination.default_per_page = value
                .parse::<usize>()
                .context("Invalid number value for default-per-page")?;
        }
        "max-per-page" => {
            config.pagination.max_per_page = value
                .parse::<usize>()
                .context("Invalid number value for max-per-page")?;
        }
        "log-level" => config.logging.level = value.to_string(),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_config() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let config_path = dir.path().join(".session-tracer.toml");
        set_test_config_path(config_path.clone());
        (dir, config_path)
    }

    #[test]
    fn default_config_round_trip() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        let loaded = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(loaded.index.scan_interval_secs, 30);
        assert_eq!(loaded.cache.source_ttl_secs, 300);
        assert_eq!(loaded.cache.derived_capacity, 200);
        assert_eq!(loaded.pagination.default_per_page, 50);
        assert_eq!(loaded.pagination.max_per_page, 100);
        assert_eq!(loaded.logging.level, "warn");
        assert!(loaded.paths.projects_dir.is_empty());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let (_dir, path) = setup_test_config();
        fs::write(&path, "[index]\nscan_interval_secs = 5\n").unwrap();

        let loaded = Config::load().unwrap().unwrap();
        assert_eq!(loaded.index.scan_interval_secs, 5);
        assert_eq!(loaded.cache.derived_capacity, 200);
        assert_eq!(loaded.logging.level, "warn");
    }

    #[test]
    fn explicit_paths_override_home_defaults() {
        let mut config = Config::default();
        config.paths.projects_dir = "/data/projects".into();
        config.paths.cache_file = "/data/cache.json".into();

        assert_eq!(config.projects_dir().unwrap(), PathBuf::from("/data/projects"));
        assert_eq!(config.cache_file().unwrap(), PathBuf::from("/data/cache.json"));
    }

    #[test]
    fn clamp_per_page_bounds() {
        let config = Config::default();
        assert_eq!(config.clamp_per_page(None), 50);
        assert_eq!(config.clamp_per_page(Some(0)), 1);
        assert_eq!(config.clamp_per_page(Some(500)), 100);
        assert_eq!(config.clamp_per_page(Some(10)), 10);
    }

    #[test]
    fn set_config_value_behaviour() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        set_config_value("projects-dir", "/tmp/projects").expect("set projects-dir");
        set_config_value("scan-interval", "10").expect("set scan-interval");
        set_config_value("source-ttl", "60").expect("set source-ttl");
        set_config_value("derived-capacity", "40").expect("set derived-capacity");
        set_config_value("max-per-page", "25").expect("set max-per-page");
        set_config_value("log-level", "debug").expect("set log-level");

        let cfg = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(cfg.paths.projects_dir, "/tmp/projects");
        assert_eq!(cfg.index.scan_interval_secs, 10);
        assert_eq!(cfg.cache.source_ttl_secs, 60);
        assert_eq!(cfg.cache.derived_capacity, 40);
        assert_eq!(cfg.pagination.max_per_page, 25);
        assert_eq!(cfg.logging.level, "debug");

        let err = set_config_value("unknown-key", "value").unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("Unknown config key"),
            "unexpected error message: {msg}"
        );
        let err = set_config_value("scan-interval", "soon").unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("Invalid number value"),
            "unexpected error message: {msg}"
        );
        assert!(set_config_value("derived-capacity", "2").is_err());
    }
}
