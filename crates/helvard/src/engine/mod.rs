mod engine;
mod integration;
mod message;
pub mod state;

pub use engine::CommandError;
pub use engine::Engine;
pub use integration::FromIntegrationSender;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use integration::SetupError;
pub use message::FromIntegrationMessage;
pub use message::ToIntegrationMessage;
pub use state::LightState;
pub use state::State;
