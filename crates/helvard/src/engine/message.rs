//! Type-safe message system for helvard
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands from the engine to integrations

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone, PartialEq)]
pub enum FromIntegrationMessage {
    /// An entity was discovered and registered
    EntityDiscovered {
        entity_id: String,
        integration_name: String,
    },

    /// An entity was removed (integration unloaded, etc.)
    EntityRemoved { entity_id: String },

    /// A light's state changed
    LightStateChanged {
        entity_id: String,
        name: String,
        on: bool,
        brightness: Option<u8>,
    },
}

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToIntegrationMessage {
    /// Command to switch a light on or off
    LightCommand { entity_id: String, on: bool },
}

impl ToIntegrationMessage {
    /// The entity this command targets, used for routing.
    pub fn entity_id(&self) -> &str {
        match self {
            ToIntegrationMessage::LightCommand { entity_id, .. } => entity_id,
        }
    }
}
