use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::merge::MergeStrategy;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period before form listeners are notified.
    pub debounce_ms: u64,
    /// Adds the debug action logger in front of the event tap.
    pub log_actions: bool,
    pub merge: MergeStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            log_actions: false,
            merge: MergeStrategy::Deep,
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
