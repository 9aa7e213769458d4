use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::IntegrationContext;
use super::integration::SetupError;
use super::integration::ToIntegrationReceiver;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::LightState;
use super::state::State;
use crate::config::EngineConfig;

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

/// Why a command could not be delivered.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("no integration found for entity: {0}")]
    UnknownEntity(String),

    #[error("integration '{0}' is not running")]
    IntegrationGone(String),
}

/// Backoff between setup attempts of a not-ready integration.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    initial: Duration,
    max: Duration,
}

impl RetryPolicy {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        let initial = Duration::from_secs(config.setup_retry_initial_secs);
        Self {
            initial,
            max: Duration::from_secs(config.setup_retry_max_secs).max(initial),
        }
    }
}

/// helvard engine
///
/// Routes commands to the integration that owns each entity and maintains a
/// view of the world with [`State`].
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of entity_id -> integration name for routing messages
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,

    retry: RetryPolicy,
}

impl Engine {
    /// Create a new Engine instance
    pub fn new(config: &EngineConfig) -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            integration_handles: std::sync::Mutex::new(HashMap::new()),
            retry: RetryPolicy::from(config),
        }
    }

    /// Register integrations from configuration
    ///
    /// Runs every registered factory; a failing factory is logged and skipped.
    pub fn register_integrations_from_config(&self, cfg: &crate::config::Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integrations = match constr(&ctx) {
                Ok(i) => i,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
            };
            for integration in integrations {
                self.register_integration(integration);
            }
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&self, integration: Box<dyn Integration>) {
        let name = integration.name().to_string();
        let (to_integration_tx, to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        lock(&self.integration_channels).insert(name.clone(), to_integration_tx);

        let handle = tokio::spawn(run_integration(
            name.clone(),
            integration,
            from_integration_tx,
            to_integration_rx,
            self.retry,
        ));

        if let Some(old) = lock(&self.integration_handles).insert(name.clone(), handle) {
            warn!("Integration '{}' registered twice, stopping the old one", name);
            old.abort();
        }
    }

    /// Unload an integration
    ///
    /// Closes its command channel so it shuts down once idle. The returned
    /// handle resolves when shutdown has finished.
    pub fn unload_integration(&self, name: &str) -> Option<JoinHandle<()>> {
        let channel = lock(&self.integration_channels).remove(name);
        let handle = lock(&self.integration_handles).remove(name);
        if channel.is_some() || handle.is_some() {
            info!("Unloading integration '{}'", name);
        }
        handle
    }

    /// Unload every integration. See [`Engine::unload_integration`].
    pub fn unload_all(&self) -> Vec<JoinHandle<()>> {
        let names: Vec<String> = lock(&self.integration_handles).keys().cloned().collect();
        names
            .iter()
            .filter_map(|name| self.unload_integration(name))
            .collect()
    }

    /// Send a command to an integration
    ///
    /// Routes the command to the appropriate integration based on entity_id.
    pub fn send_command(&self, msg: ToIntegrationMessage) -> Result<(), CommandError> {
        let entity_id = msg.entity_id().to_string();

        let integration_name = lock(&self.entity_integration_map)
            .get(&entity_id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownEntity(entity_id.clone()))?;

        let channels = lock(&self.integration_channels);
        let tx = channels
            .get(&integration_name)
            .ok_or_else(|| CommandError::IntegrationGone(integration_name.clone()))?;

        tx.send(msg)
            .map_err(|_| CommandError::IntegrationGone(integration_name))
    }

    /// Send a light command to control a light entity
    pub fn send_light_command(&self, entity_id: String, on: bool) -> Result<(), CommandError> {
        self.send_command(ToIntegrationMessage::LightCommand { entity_id, on })
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming events from integrations and updates state.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send>> {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
        Ok(())
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Whether any integration owns `entity_id`.
    pub fn has_entity(&self, entity_id: &str) -> bool {
        lock(&self.entity_integration_map).contains_key(entity_id)
    }

    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let mut state = State::clone(&self.state.load());
        f(&mut state);
        self.state.store(Arc::new(state));
    }

    /// Handle an event from an integration
    fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    entity_id, integration_name
                );

                // State is not populated until the first state-change message arrives.
                lock(&self.entity_integration_map).insert(entity_id, integration_name);
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                self.update_state(|state| {
                    state.lights.remove(&entity_id);
                });
                lock(&self.entity_integration_map).remove(&entity_id);
            }
            FromIntegrationMessage::LightStateChanged {
                entity_id,
                name,
                on,
                brightness,
            } => {
                if !self.has_entity(&entity_id) {
                    warn!("State change for unknown entity {}, ignoring", entity_id);
                    return;
                }
                info!(
                    "Light state changed: {} -> on={}, brightness={:?}",
                    entity_id, on, brightness
                );

                self.update_state(|state| {
                    state.lights.insert(
                        entity_id,
                        LightState {
                            name,
                            on,
                            brightness,
                        },
                    );
                });
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Body of an integration task: set up with retries, serve commands until
/// the channel closes, then shut down.
async fn run_integration(
    name: String,
    mut integration: Box<dyn Integration>,
    tx: FromIntegrationSender,
    mut rx: ToIntegrationReceiver,
    retry: RetryPolicy,
) {
    let mut delay = retry.initial;
    loop {
        match integration.setup(tx.clone()).await {
            Ok(()) => {
                info!("Integration '{}' set up", name);
                break;
            }
            Err(SetupError::NotReady(e)) => {
                warn!(
                    "Integration '{}' not ready, retrying in {}s: {}",
                    name,
                    delay.as_secs(),
                    e
                );
                if !wait_for_retry(&name, delay, &mut rx).await {
                    info!("Integration '{}' unloaded before it became ready", name);
                    return;
                }
                delay = retry.next(delay);
            }
            Err(e @ SetupError::Failed(_)) => {
                error!("Integration '{}' {}", name, e);
                return;
            }
        }
    }

    // Process commands from engine
    while let Some(msg) = rx.recv().await {
        if let Err(e) = integration.handle_message(msg).await {
            warn!("Integration '{}' failed to handle message: {}", name, e);
        }
    }

    if let Err(e) = integration.shutdown().await {
        warn!("Integration '{}' shutdown failed: {}", name, e);
    }
}

/// Sleep for `delay`, discarding commands meanwhile. Returns false if the
/// integration was unloaded.
async fn wait_for_retry(name: &str, delay: Duration, rx: &mut ToIntegrationReceiver) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            msg = rx.recv() => match msg {
                Some(msg) => debug!("Integration '{}' not ready, dropping {:?}", name, msg),
                None => return false,
            },
        }
    }
}
