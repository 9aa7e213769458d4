use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;
use tracing::info;

use super::address::DeviceAddress;
use super::address::SceneAddress;
use super::protocol::ProtocolError;
use super::subscription::Callback;
use super::subscription::Subscription;

/// Errors reported by a router client.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by router")]
    Closed,

    #[error("router is not connected")]
    NotConnected,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for reply to {0}")]
    Timeout(String),

    #[error("router rejected {request}: {reason}")]
    Rejected { request: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unknown group {0}")]
    UnknownGroup(u16),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceAddress),
}

impl RouterError {
    /// Whether this error is a connection-level failure that may clear up on
    /// its own (refused, reset, dropped).
    pub fn is_connection_error(&self) -> bool {
        match self {
            RouterError::Connection { .. } | RouterError::Closed | RouterError::NotConnected => {
                true
            }
            RouterError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A group of devices, driven by recalling scenes.
#[async_trait]
pub trait Scened: Send + Sync {
    fn group_id(&self) -> u16;

    fn name(&self) -> String;

    /// The scene most recently recalled on this group, if the router knows it.
    fn last_scene(&self) -> Option<SceneAddress>;

    async fn set_scene(&self, scene: SceneAddress) -> Result<(), RouterError>;

    /// Register for change notifications on this group.
    fn subscribe(&self, callback: Callback) -> Subscription;
}

/// A single device, driven by load level.
#[async_trait]
pub trait Dimmable: Send + Sync {
    fn address(&self) -> DeviceAddress;

    fn name(&self) -> String;

    /// Current brightness, 0..=255.
    fn brightness(&self) -> u8;

    async fn set_brightness(&self, brightness: u8) -> Result<(), RouterError>;

    /// Register for change notifications on this device.
    fn subscribe(&self, callback: Callback) -> Subscription;
}

/// A connection to one lighting router.
///
/// Implementations keep their group and device handles up to date from the
/// router; callers never copy or cache what they return.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// Open the transport to the router.
    async fn connect(&self) -> Result<(), RouterError>;

    /// Discover groups and devices.
    async fn initialize(&self) -> Result<(), RouterError>;

    fn groups(&self) -> Vec<Arc<dyn Scened>>;

    fn light_devices(&self) -> Vec<Arc<dyn Dimmable>>;

    /// Close the transport. Handles stay readable but commands fail.
    async fn disconnect(&self);
}

/// Why a session could not become ready.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Connection-level failure; setup should be retried later.
    #[error("router at {host} not ready: {source}")]
    NotReady {
        host: String,
        #[source]
        source: RouterError,
    },

    /// Anything else; retrying will not help.
    #[error("router at {host} failed to initialize: {source}")]
    Failed {
        host: String,
        #[source]
        source: RouterError,
    },
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::NotReady { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Ready,
    Failed(FailureKind),
}

/// Owns the connection to a single router for one config entry.
pub struct RouterSession<R: Router> {
    host: String,
    port: u16,
    available: bool,
    state: SessionState,
    router: Arc<R>,
}

impl<R: Router> RouterSession<R> {
    pub fn new(host: impl Into<String>, port: u16, router: R) -> Self {
        Self {
            host: host.into(),
            port,
            available: true,
            state: SessionState::Uninitialized,
            router: Arc::new(router),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// The router handle, once connected and initialized.
    pub fn api(&self) -> Option<&Arc<R>> {
        match self.state {
            SessionState::Ready => Some(&self.router),
            _ => None,
        }
    }

    /// Connect to the router and run discovery.
    ///
    /// Connection-level failures come back as [`SessionError::NotReady`] so
    /// the caller can schedule another attempt; every other failure is
    /// [`SessionError::Failed`].
    pub async fn connect_and_initialize(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            return Ok(());
        }

        self.state = SessionState::Connecting;
        info!("Connecting to Helvar router at {}:{}", self.host, self.port);

        let result = match self.router.connect().await {
            Ok(()) => self.router.initialize().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.state = SessionState::Ready;
                self.available = true;
                info!("Helvar router at {} ready", self.host);
                Ok(())
            }
            Err(e) => {
                self.router.disconnect().await;
                self.available = false;
                if e.is_connection_error() {
                    error!("Error connecting to the Helvar router at {}: {}", self.host, e);
                    self.state = SessionState::Failed(FailureKind::Retryable);
                    Err(SessionError::NotReady {
                        host: self.host.clone(),
                        source: e,
                    })
                } else {
                    error!(
                        "Unknown error connecting with the Helvar router at {}: {}",
                        self.host, e
                    );
                    self.state = SessionState::Failed(FailureKind::Fatal);
                    Err(SessionError::Failed {
                        host: self.host.clone(),
                        source: e,
                    })
                }
            }
        }
    }

    /// Disconnect from the router.
    pub async fn close(&mut self) {
        if self.state == SessionState::Ready {
            info!("Disconnecting from Helvar router at {}", self.host);
        }
        self.router.disconnect().await;
        self.available = false;
        self.state = SessionState::Uninitialized;
    }
}

impl<R: Router> fmt::Debug for RouterSession<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterSession")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("available", &self.available)
            .field("state", &self.state)
            .finish()
    }
}

/// In-memory router for tests.
#[cfg(test)]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::integrations::helvar::subscription::SubscriptionKey;
    use crate::integrations::helvar::subscription::SubscriptionRegistry;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        SetScene(SceneAddress),
        SetBrightness(DeviceAddress, u8),
    }

    pub type CallLog = Arc<Mutex<Vec<MockCall>>>;

    pub struct MockGroup {
        pub id: u16,
        pub name: String,
        pub last_scene: Mutex<Option<SceneAddress>>,
        pub calls: CallLog,
        pub registry: SubscriptionRegistry,
        pub fail_commands: AtomicBool,
    }

    impl MockGroup {
        pub fn new(id: u16, name: &str, calls: CallLog, registry: SubscriptionRegistry) -> Self {
            Self {
                id,
                name: name.to_string(),
                last_scene: Mutex::new(None),
                calls,
                registry,
                fail_commands: AtomicBool::new(false),
            }
        }

        /// Simulate the router reporting a recalled scene.
        pub fn report_scene(&self, scene: Option<SceneAddress>) {
            *self.last_scene.lock().unwrap() = scene;
            self.registry.notify(SubscriptionKey::Group(self.id));
        }
    }

    #[async_trait]
    impl Scened for MockGroup {
        fn group_id(&self) -> u16 {
            self.id
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn last_scene(&self) -> Option<SceneAddress> {
            *self.last_scene.lock().unwrap()
        }

        async fn set_scene(&self, scene: SceneAddress) -> Result<(), RouterError> {
            if self.fail_commands.load(Ordering::SeqCst) {
                return Err(RouterError::NotConnected);
            }
            self.calls.lock().unwrap().push(MockCall::SetScene(scene));
            Ok(())
        }

        fn subscribe(&self, callback: Callback) -> Subscription {
            self.registry.register(SubscriptionKey::Group(self.id), callback)
        }
    }

    pub struct MockDevice {
        pub address: DeviceAddress,
        pub name: String,
        pub brightness: Mutex<u8>,
        pub calls: CallLog,
        pub registry: SubscriptionRegistry,
    }

    impl MockDevice {
        pub fn new(
            address: DeviceAddress,
            name: &str,
            calls: CallLog,
            registry: SubscriptionRegistry,
        ) -> Self {
            Self {
                address,
                name: name.to_string(),
                brightness: Mutex::new(0),
                calls,
                registry,
            }
        }

        /// Simulate the router reporting a new load level.
        pub fn report_brightness(&self, brightness: u8) {
            *self.brightness.lock().unwrap() = brightness;
            self.registry.notify(SubscriptionKey::Device(self.address));
        }
    }

    #[async_trait]
    impl Dimmable for MockDevice {
        fn address(&self) -> DeviceAddress {
            self.address
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn brightness(&self) -> u8 {
            *self.brightness.lock().unwrap()
        }

        async fn set_brightness(&self, brightness: u8) -> Result<(), RouterError> {
            self.calls
                .lock()
                .unwrap()
                .push(MockCall::SetBrightness(self.address, brightness));
            Ok(())
        }

        fn subscribe(&self, callback: Callback) -> Subscription {
            self.registry
                .register(SubscriptionKey::Device(self.address), callback)
        }
    }

    #[derive(Default)]
    pub struct MockRouter {
        pub groups: Vec<Arc<MockGroup>>,
        pub devices: Vec<Arc<MockDevice>>,
        pub calls: CallLog,
        pub registry: SubscriptionRegistry,
        /// Errors returned by successive connect attempts before succeeding.
        pub connect_failures: Mutex<VecDeque<RouterError>>,
        pub initialize_failure: Mutex<Option<RouterError>>,
        pub connect_attempts: AtomicUsize,
        pub disconnects: AtomicUsize,
        pub connected: AtomicBool,
    }

    impl MockRouter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_group(mut self, id: u16, name: &str) -> Self {
            self.groups.push(Arc::new(MockGroup::new(
                id,
                name,
                self.calls.clone(),
                self.registry.clone(),
            )));
            self
        }

        pub fn with_device(mut self, address: DeviceAddress, name: &str) -> Self {
            self.devices.push(Arc::new(MockDevice::new(
                address,
                name,
                self.calls.clone(),
                self.registry.clone(),
            )));
            self
        }

        pub fn fail_connect(self, error: RouterError) -> Self {
            self.connect_failures.lock().unwrap().push_back(error);
            self
        }

        pub fn fail_initialize(self, error: RouterError) -> Self {
            *self.initialize_failure.lock().unwrap() = Some(error);
            self
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub fn refused() -> RouterError {
        RouterError::Connection {
            host: "10.254.1.1".to_string(),
            port: 50000,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        }
    }

    #[async_trait]
    impl Router for MockRouter {
        async fn connect(&self) -> Result<(), RouterError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.connect_failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn initialize(&self) -> Result<(), RouterError> {
            match self.initialize_failure.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn groups(&self) -> Vec<Arc<dyn Scened>> {
            self.groups
                .iter()
                .map(|g| g.clone() as Arc<dyn Scened>)
                .collect()
        }

        fn light_devices(&self) -> Vec<Arc<dyn Dimmable>> {
            self.devices
                .iter()
                .map(|d| d.clone() as Arc<dyn Dimmable>)
                .collect()
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}
