use std::error::Error;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;

use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use crate::config::Config;

/// Channel types for messages FROM integrations TO the engine
/// These are bounded channels to provide backpressure
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Channel types for messages FROM the engine TO integrations (unbounded - engine must not block)
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;
pub type ToIntegrationReceiver = mpsc::UnboundedReceiver<ToIntegrationMessage>;

/// Result type for integration factory functions
///
/// A factory may produce any number of integrations, one per configured entry.
pub type IntegrationFactoryResult = anyhow::Result<Vec<Box<dyn Integration>>>;

pub struct IntegrationContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

/// Why [`Integration::setup`] did not complete.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The integration's backend is unreachable right now. The engine calls
    /// `setup` again after a backoff.
    #[error("not ready: {0}")]
    NotReady(#[source] Box<dyn Error + Send + Sync>),

    /// The integration cannot be set up. The engine gives up on it.
    #[error("setup failed: {0}")]
    Failed(#[source] Box<dyn Error + Send + Sync>),
}

/// Integration trait that all integrations must implement
#[async_trait]
pub trait Integration: Send + Sync {
    /// Get the name/identifier of this integration
    fn name(&self) -> &str;

    /// Set up the integration: connect, discover entities and report their
    /// initial state.
    ///
    /// May be called again after returning [`SetupError::NotReady`].
    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), SetupError>;

    /// Handle a command from the engine
    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Shut down the integration: release resources and report every entity
    /// it owned as removed.
    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>>;
}
