pub mod arena_pool;
pub mod caching;
mod env_overrides;
pub mod log;
pub mod resolve;
pub mod trace;

use std::convert::Infallible;
use std::path::PathBuf;

use config::{builder::DefaultState, Config, ConfigBuilder, File, FileFormat, FileSourceFile};
use envconfig::Envconfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    arena_pool::ArenaPoolSettings,
    caching::CachingConfig,
    env_overrides::{EnvVarOverrides, EnvVarOverridesError},
    log::LoggingConfig,
    resolve::ResolveConfig,
    trace::TraceConfig,
};

#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    /// The logger configuration.
    ///
    /// The loader is mostly silent at `info` level and only prints warnings about failed
    /// fetches and caches.
    #[serde(default)]
    pub log: LoggingConfig,

    /// Request-scoped (L1) and external (L2) cache switches.
    #[serde(default)]
    pub caching: CachingConfig,

    /// Response resolution settings.
    #[serde(default)]
    pub resolve: ResolveConfig,

    /// Fetch tracing.
    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub arena_pool: ArenaPoolSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum LoaderConfigError {
    #[error("Failed to load configuration: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Failed to apply configuration overrides: {0}")]
    EnvVarOverridesError(#[from] EnvVarOverridesError),
    #[error("Failed to load the environment variables: {0}")]
    EnvVarLoadError(#[from] envconfig::Error),
    #[error("Failed to parse the configuration file path: {0}")]
    ConfigPathParseError(Infallible),
}

static DEFAULT_FILE_NAMES: &[&str] = &[
    "loader.config.yaml",
    "loader.config.yml",
    "loader.config.json",
];

/// Loads the configuration from `override_config_path`, or from the first default file
/// found in the working directory, then applies environment overrides.
pub fn load_config(override_config_path: Option<String>) -> Result<LoaderConfig, LoaderConfigError> {
    let env_overrides = EnvVarOverrides::init_from_env()?;
    let mut config = Config::builder();

    if let Some(path_str) = override_config_path {
        let path_buf = path_str
            .parse::<PathBuf>()
            .map_err(LoaderConfigError::ConfigPathParseError)?;
        let as_file: File<FileSourceFile, _> = path_buf.into();
        config = config.add_source(as_file.required(true));
    } else {
        for name in DEFAULT_FILE_NAMES {
            config = config.add_source(File::with_name(name).required(false));
        }
    }

    build(config, env_overrides)
}

pub fn parse_yaml_config(config_raw: &str) -> Result<LoaderConfig, LoaderConfigError> {
    let config = Config::builder().add_source(File::from_str(config_raw, FileFormat::Yaml));
    build(config, EnvVarOverrides::default())
}

fn build(
    config: ConfigBuilder<DefaultState>,
    env_overrides: EnvVarOverrides,
) -> Result<LoaderConfig, LoaderConfigError> {
    let config = env_overrides.apply_overrides(config)?;
    Ok(config.build()?.try_deserialize::<LoaderConfig>()?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        log::{LogFormat, LogLevel},
        resolve::ErrorBehaviorConfig,
    };

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_yaml_config("{}").unwrap();
        assert!(config.caching.l1_enabled);
        assert!(config.caching.l2_enabled);
        assert_eq!(config.caching.default_ttl, Duration::from_secs(60));
        assert_eq!(config.caching.in_memory_max_capacity, 10_000);
        assert_eq!(config.resolve.error_behavior, ErrorBehaviorConfig::Propagate);
        assert!(!config.trace.enabled);
        assert!(config.trace.redact_headers);
        assert_eq!(config.arena_pool.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.arena_pool.peak_window, 50);
        assert_eq!(config.arena_pool.min_capacity, 1024);
    }

    #[test]
    fn parses_every_section() {
        let config = parse_yaml_config(
            r#"
log:
  level: warn
  format: tree
caching:
  l2_enabled: false
  default_ttl: 5m
resolve:
  error_behavior: HALT
  omit_error_locations: true
trace:
  enabled: true
  exclude_output: true
arena_pool:
  idle_timeout: 2s
"#,
        )
        .unwrap();
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.log.format, LogFormat::Tree);
        assert_eq!(config.log.env_filter_str(), "warn");
        assert!(config.caching.l1_enabled);
        assert!(!config.caching.l2_enabled);
        assert_eq!(config.caching.default_ttl, Duration::from_secs(300));
        assert_eq!(config.resolve.error_behavior, ErrorBehaviorConfig::Halt);
        assert!(config.resolve.omit_error_locations);
        assert!(config.trace.enabled);
        assert!(config.trace.exclude_output);
        assert_eq!(config.arena_pool.idle_timeout, Duration::from_secs(2));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_yaml_config("caching:\n  l3_enabled: true\n").unwrap_err();
        assert!(err.to_string().contains("l3_enabled"));
    }

    #[test]
    fn env_overrides_win_over_the_file() {
        let overrides = EnvVarOverrides {
            log_level: Some(LogLevel::Error),
            log_filter: Some("hive_router_fetch_loader=trace".to_string()),
            l1_cache_enabled: Some(false),
            error_behavior: Some(ErrorBehaviorConfig::Null),
            ..Default::default()
        };
        let file = Config::builder().add_source(File::from_str(
            "log:\n  level: info\ncaching:\n  l1_enabled: true\n",
            FileFormat::Yaml,
        ));

        let config = build(file, overrides).unwrap();

        assert_eq!(config.log.level, LogLevel::Error);
        assert_eq!(config.log.env_filter_str(), "hive_router_fetch_loader=trace");
        assert!(!config.caching.l1_enabled);
        assert_eq!(config.resolve.error_behavior, ErrorBehaviorConfig::Null);
    }

    #[test]
    fn parses_env_values_leniently() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(" halt ".parse::<ErrorBehaviorConfig>(), Ok(ErrorBehaviorConfig::Halt));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
