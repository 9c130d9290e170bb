// src/config/loader.rs
//! Configuration loader: TOML file plus environment overrides

use crate::config::{constants::paths, SessionConfig};
use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Loads a [`SessionConfig`] from the first configuration file found.
pub struct ConfigLoader {
    config_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create loader searching the default locations
    pub fn new() -> Self {
        Self { config_paths: Self::discover_config_paths() }
    }

    /// Create loader with custom paths
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        Self { config_paths: paths }
    }

    /// Load configuration, falling back to defaults when no file exists.
    pub fn load(&self) -> Result<SessionConfig, ConfigError> {
        let mut config = match self.config_paths.iter().find(|p| p.is_file()) {
            Some(path) => Self::load_file(path)?,
            None => {
                debug!("no configuration file found, using defaults");
                SessionConfig::default()
            }
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a specific file without consulting the search paths.
    pub fn load_file(path: &Path) -> Result<SessionConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse TOML contents
    pub fn parse(contents: &str) -> Result<SessionConfig, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Write a configuration as TOML
    pub fn save(config: &SessionConfig, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(config)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env_overrides(config: &mut SessionConfig) -> Result<(), ConfigError> {
        if let Some(rate) = Self::env_u64(paths::ENV_SAMPLE_RATE_HZ, "sample_rate_hz")? {
            config.sample_rate_hz = rate;
        }
        if let Some(interval) = Self::env_u64(paths::ENV_POLL_INTERVAL_MS, "poll_interval_ms")? {
            config.poll_interval_ms = interval;
        }
        Ok(())
    }

    fn env_u64(var: &str, field: &'static str) -> Result<Option<u64>, ConfigError> {
        match std::env::var(var) {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid { field, reason: format!("{var}={value}: {e}") }),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => {
                warn!(var, error = %e, "ignoring unreadable environment override");
                Ok(None)
            }
        }
    }

    fn discover_config_paths() -> Vec<PathBuf> {
        let mut search = Vec::new();

        if let Ok(explicit) = std::env::var(paths::ENV_CONFIG_PATH) {
            search.push(PathBuf::from(explicit));
        }

        search.push(PathBuf::from(paths::CONFIG_FILE_NAME));

        if let Some(home) = std::env::var_os("HOME") {
            search.push(PathBuf::from(home).join(".config").join("smu").join(paths::CONFIG_FILE_NAME));
        }

        search.push(Path::new(paths::SYSTEM_CONFIG_DIR).join(paths::CONFIG_FILE_NAME));
        search
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_missing_files_fall_back_to_defaults() {
        let loader = ConfigLoader::with_paths(vec![PathBuf::from("/nonexistent/smu.toml")]);
        let config = loader.load().expect("defaults");
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    #[serial]
    fn test_first_existing_file_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.toml");
        let second = dir.path().join("second.toml");

        let mut f = std::fs::File::create(&second).expect("create");
        writeln!(f, "sample_rate_hz = 20000\npoll_interval_ms = 5").expect("write");

        let loader = ConfigLoader::with_paths(vec![first, second]);
        let config = loader.load().expect("load");
        assert_eq!(config.sample_rate_hz, 20_000);
        assert_eq!(config.poll_interval_ms, 5);
    }

    #[test]
    #[serial]
    fn test_env_override_and_validation() {
        std::env::set_var(paths::ENV_SAMPLE_RATE_HZ, "40000");
        let config = ConfigLoader::with_paths(Vec::new()).load();
        std::env::remove_var(paths::ENV_SAMPLE_RATE_HZ);
        assert_eq!(config.expect("load").sample_rate_hz, 40_000);

        std::env::set_var(paths::ENV_POLL_INTERVAL_MS, "fast");
        let config = ConfigLoader::with_paths(Vec::new()).load();
        std::env::remove_var(paths::ENV_POLL_INTERVAL_MS);
        assert!(matches!(config, Err(ConfigError::Invalid { field: "poll_interval_ms", .. })));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("smu.toml");
        let config = SessionConfig { completion_timeout_ms: Some(250), ..Default::default() };

        ConfigLoader::save(&config, &path).expect("save");
        let loaded = ConfigLoader::load_file(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_file_reports_missing_path() {
        let err = ConfigLoader::load_file(Path::new("/nonexistent/smu.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
