use super::EngineConfig;
use crate::Result;
use config::{Config, Environment};

impl EngineConfig {
    /// Load engine configuration from `CONDUIT_`-prefixed environment
    /// variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("CONDUIT"))
            .build()
            .map_err(|e| crate::EngineError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<EngineConfig>()
            .map_err(|e| crate::EngineError::Config(e.to_string()))?;

        config.validate().map_err(crate::EngineError::Config)?;

        Ok(config)
    }
}
