use config::{builder::BuilderState, ConfigBuilder, ConfigError};
use envconfig::Envconfig;
use tracing::debug;

use crate::{
    log::{LogFormat, LogLevel},
    resolve::ErrorBehaviorConfig,
};

#[derive(Envconfig, Default)]
pub struct EnvVarOverrides {
    // Logger overrides
    #[envconfig(from = "LOG_LEVEL")]
    pub log_level: Option<LogLevel>,
    #[envconfig(from = "LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
    #[envconfig(from = "LOG_FILTER")]
    pub log_filter: Option<String>,

    // Caching overrides
    #[envconfig(from = "LOADER_L1_CACHE_ENABLED")]
    pub l1_cache_enabled: Option<bool>,
    #[envconfig(from = "LOADER_L2_CACHE_ENABLED")]
    pub l2_cache_enabled: Option<bool>,

    // Resolve overrides
    #[envconfig(from = "LOADER_ERROR_BEHAVIOR")]
    pub error_behavior: Option<ErrorBehaviorConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvVarOverridesError {
    #[error("Failed to override configuration: {0}")]
    FailedToOverrideConfig(#[from] ConfigError),
}

impl EnvVarOverrides {
    pub fn apply_overrides<T: BuilderState>(
        mut self,
        mut config: ConfigBuilder<T>,
    ) -> Result<ConfigBuilder<T>, EnvVarOverridesError> {
        if let Some(log_level) = self.log_level.take() {
            debug!("[config-override] 'log.level' = {:?}", log_level);
            config = config.set_override("log.level", log_level.as_str())?;
        }
        if let Some(log_format) = self.log_format.take() {
            debug!("[config-override] 'log.format' = {:?}", log_format);
            config = config.set_override("log.format", log_format.as_str())?;
        }
        if let Some(log_filter) = self.log_filter.take() {
            debug!("[config-override] 'log.filter' = {:?}", log_filter);
            config = config.set_override("log.filter", log_filter)?;
        }

        if let Some(enabled) = self.l1_cache_enabled.take() {
            debug!("[config-override] 'caching.l1_enabled' = {}", enabled);
            config = config.set_override("caching.l1_enabled", enabled)?;
        }
        if let Some(enabled) = self.l2_cache_enabled.take() {
            debug!("[config-override] 'caching.l2_enabled' = {}", enabled);
            config = config.set_override("caching.l2_enabled", enabled)?;
        }

        if let Some(error_behavior) = self.error_behavior.take() {
            debug!("[config-override] 'resolve.error_behavior' = {:?}", error_behavior);
            config = config.set_override("resolve.error_behavior", error_behavior.as_str())?;
        }

        Ok(config)
    }
}
