use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::horizon::DataHorizon;

/// Engine settings, loadable from TOML.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of this controller instance, written into allocation
    /// markers that name a holder field.
    pub instance_name: String,
    /// Database sequence new object ids are drawn from.
    pub id_sequence: String,
    /// Spacing of fresh list order keys.
    pub order_increment: i64,
    /// Data-horizon window used by `synchronize`; `None` loads everything.
    pub data_horizon_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_name: format!("orb-{}", uuid::Uuid::now_v7()),
            id_sequence: "orb_object_ids".into(),
            order_increment: orb_order::DEFAULT_INCREMENT,
            data_horizon_secs: None,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.instance_name.trim().is_empty() {
            return Err(EngineError::Config("instance_name must not be empty".into()));
        }
        if self.id_sequence.trim().is_empty() {
            return Err(EngineError::Config("id_sequence must not be empty".into()));
        }
        if self.order_increment <= 0 {
            return Err(EngineError::Config(format!(
                "order_increment must be positive, got {}",
                self.order_increment
            )));
        }
        if let Some(secs) = self.data_horizon_secs {
            if i64::try_from(secs).is_err() {
                return Err(EngineError::Config(format!(
                    "data_horizon_secs out of range: {secs}"
                )));
            }
        }
        Ok(())
    }

    /// The configured data horizon, if any.
    pub fn data_horizon(&self) -> Option<DataHorizon> {
        self.data_horizon_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| DataHorizon::new(Duration::seconds(secs)))
    }
}
