use serde::Deserialize;

use super::address::SceneMapping;

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    30
}

/// Configuration for one Helvar router entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Router hostname or IPv4 address. The port is always 50000.
    pub host: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Scenes recalled to switch group lights on and off
    #[serde(default)]
    pub scenes: SceneMapping,

    /// Seconds between device level polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}
