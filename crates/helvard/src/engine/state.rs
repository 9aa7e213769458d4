use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// State of a light entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LightState {
    /// Display name.
    pub name: String,

    /// Whether the light is on or off.
    pub on: bool,

    /// Brightness level (0-255), if supported.
    pub brightness: Option<u8>,
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub lights: BTreeMap<String, LightState>,
}
