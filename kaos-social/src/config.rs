//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Social client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialConfig {
    /// Capacity of the cache-change broadcast channel. Slow subscribers
    /// past this many events see a lag error and skip ahead.
    pub listener_capacity: usize,
    /// How many resolved call handles to remember for classifying late
    /// duplicate completions.
    pub resolved_history: usize,
    /// Request only the persona name when fetching friend info.
    pub name_only_info: bool,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            listener_capacity: 256,
            resolved_history: 256,
            name_only_info: false,
        }
    }
}

impl SocialConfig {
    /// Parse from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
