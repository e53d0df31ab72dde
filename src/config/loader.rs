//! Configuration Loader
//!
//! Environment-aware configuration loading: base YAML file, optional per-environment
//! overlay, then environment variable overrides.

use super::error::{ConfigResult, ConfigurationError};
use super::LifecycleConfig;
use ::config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_NAME: &str = "lifecycle.yaml";
const ENV_PREFIX: &str = "LIFECYCLE";

pub struct ConfigManager {
    config: LifecycleConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_prefix(config_dir, environment, ENV_PREFIX)
    }

    pub(crate) fn load_with_env_prefix(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_prefix: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment, env_prefix)?;
        config.validate()?;

        info!(
            environment = environment,
            workers = config.scheduler.workers,
            lease_seconds = config.scheduler.lease_seconds,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, e.g. in tests or embedded use
    pub fn from_config(config: LifecycleConfig, environment: &str) -> ConfigResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Current environment: LIFECYCLE_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("LIFECYCLE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        env::var("LIFECYCLE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn find_config_file(config_directory: &Path) -> ConfigResult<PathBuf> {
        let path = config_directory.join(BASE_FILE_NAME);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ConfigurationError::config_file_not_found(vec![path]))
        }
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        env_prefix: &str,
    ) -> ConfigResult<LifecycleConfig> {
        let base = Self::find_config_file(config_directory)?;
        let overlay = config_directory.join(format!("lifecycle.{environment}.yaml"));
        if overlay.is_file() {
            debug!("Applying environment-specific overrides for: {}", environment);
        }

        let config = Config::builder()
            .add_source(File::from(base))
            .add_source(File::from(overlay).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<LifecycleConfig>()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const BASE_YAML: &str = r#"
scheduler:
  workers: 2
  lease_seconds: 120
backoff:
  base_delay_seconds: 5
telemetry:
  metric_prefix: kcp_keb
"#;

    const PRODUCTION_YAML: &str = r#"
scheduler:
  workers: 16
telemetry:
  json_logs: true
"#;

    fn setup_test_config_dir() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("lifecycle.yaml"), BASE_YAML).unwrap();
        fs::write(
            temp_dir.path().join("lifecycle.production.yaml"),
            PRODUCTION_YAML,
        )
        .unwrap();
        temp_dir
    }

    #[test]
    fn test_config_file_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let result =
            ConfigManager::load_from_directory_with_env(Some(temp_dir.path().to_path_buf()), "test");

        match result {
            Err(ConfigurationError::ConfigFileNotFound { searched_paths }) => {
                assert_eq!(searched_paths.len(), 1);
            }
            _ => panic!("Expected ConfigFileNotFound error"),
        }
    }

    #[test]
    fn test_basic_config_loading_keeps_defaults() {
        let temp_dir = setup_test_config_dir();
        let manager = ConfigManager::load_with_env_prefix(
            Some(temp_dir.path().to_path_buf()),
            "development",
            "LIFECYCLE_BASIC_TEST",
        )
        .unwrap();

        let config = manager.config();
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.lease_seconds, 120);
        assert_eq!(config.scheduler.claim_batch_size, 10);
        assert_eq!(config.backoff.base_delay_seconds, 5);
        assert_eq!(config.backoff.max_delay_seconds, 600);
        assert_eq!(config.telemetry.metric_prefix, "kcp_keb");
        assert!(!config.telemetry.json_logs);
        assert_eq!(manager.environment(), "development");
    }

    #[test]
    fn test_environment_specific_overrides() {
        let temp_dir = setup_test_config_dir();
        let manager = ConfigManager::load_with_env_prefix(
            Some(temp_dir.path().to_path_buf()),
            "production",
            "LIFECYCLE_OVERLAY_TEST",
        )
        .unwrap();

        let config = manager.config();
        assert_eq!(config.scheduler.workers, 16);
        assert_eq!(config.scheduler.lease_seconds, 120);
        assert!(config.telemetry.json_logs);
    }

    #[test]
    fn test_environment_variables_win() {
        let temp_dir = setup_test_config_dir();
        env::set_var("LIFECYCLE_ENVVAR_TEST__SCHEDULER__WORKERS", "7");
        env::set_var("LIFECYCLE_ENVVAR_TEST__MANAGER__CONFLICT_RETRIES", "9");

        let result = ConfigManager::load_with_env_prefix(
            Some(temp_dir.path().to_path_buf()),
            "production",
            "LIFECYCLE_ENVVAR_TEST",
        );

        env::remove_var("LIFECYCLE_ENVVAR_TEST__SCHEDULER__WORKERS");
        env::remove_var("LIFECYCLE_ENVVAR_TEST__MANAGER__CONFLICT_RETRIES");

        let manager = result.unwrap();
        assert_eq!(manager.config().scheduler.workers, 7);
        assert_eq!(manager.config().manager.conflict_retries, 9);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("lifecycle.yaml"),
            "scheduler:\n  workers: 0\n",
        )
        .unwrap();

        let result = ConfigManager::load_with_env_prefix(
            Some(temp_dir.path().to_path_buf()),
            "test",
            "LIFECYCLE_INVALID_TEST",
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = LifecycleConfig::default();
        assert!(ConfigManager::from_config(config.clone(), "test").is_ok());

        config.events.channel_capacity = 0;
        assert!(ConfigManager::from_config(config, "test").is_err());
    }
}
