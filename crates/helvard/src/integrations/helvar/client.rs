use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::address::DeviceAddress;
use super::address::SceneAddress;
use super::protocol::Address;
use super::protocol::COMMAND_FADE_TIME;
use super::protocol::Command;
use super::protocol::FrameBuffer;
use super::protocol::Kind;
use super::protocol::Message;
use super::protocol::ProtocolError;
use super::protocol::brightness_to_level;
use super::protocol::error_description;
use super::protocol::is_light_type;
use super::protocol::level_to_brightness;
use super::protocol::parse_device_types;
use super::protocol::parse_id_list;
use super::router::Dimmable;
use super::router::Router;
use super::router::RouterError;
use super::router::Scened;
use super::subscription::Callback;
use super::subscription::Subscription;
use super::subscription::SubscriptionKey;
use super::subscription::SubscriptionRegistry;

/// TCP port HelvarNet routers listen on.
pub const DEFAULT_PORT: u16 = 50000;

/// How long to wait for the reply to a query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How often device load levels are re-read when nothing else triggers it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Subnets queried for devices: two DALI buses, S-DIM and DMX.
const SUBNETS: [u8; 4] = [1, 2, 3, 4];

#[derive(Debug, Clone)]
struct GroupRecord {
    name: String,
    last_scene: Option<SceneAddress>,
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    name: String,
    type_code: u32,
    brightness: u8,
}

/// What the client currently knows about the router.
#[derive(Debug, Default)]
struct Model {
    groups: BTreeMap<u16, GroupRecord>,
    devices: BTreeMap<DeviceAddress, DeviceRecord>,
}

type PendingReplies = HashMap<String, VecDeque<oneshot::Sender<Result<Message, RouterError>>>>;

/// State shared between the client, its group/device handles and the reader task.
struct Shared {
    host: String,
    port: u16,
    model: RwLock<Model>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<PendingReplies>,
    registry: SubscriptionRegistry,
    /// Cluster and router numbers, taken from the router's IPv4 address.
    router_address: Mutex<Option<(u8, u8)>>,
    /// Wakes the poll task to re-read device levels early.
    refresh: Notify,
}

impl Shared {
    async fn send(&self, msg: &Message) -> Result<(), RouterError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(RouterError::NotConnected)?;
        debug!("Sending {}", msg);
        writer.write_all(msg.to_string().as_bytes()).await?;
        Ok(())
    }

    /// Send a query and wait for the matching reply.
    async fn query(&self, msg: Message) -> Result<Message, RouterError> {
        let key = msg.correlation_key();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .push_back(tx);

        if let Err(e) = self.send(&msg).await {
            drop(rx);
            self.prune(&key);
            return Err(e);
        }

        match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::Closed),
            Err(_) => {
                self.prune(&key);
                Err(RouterError::Timeout(msg.to_string()))
            }
        }
    }

    /// Forget waiters for `key` that are no longer listening.
    fn prune(&self, key: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waiters) = pending.get_mut(key) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(key);
            }
        }
    }

    /// Query and return the reply's value.
    async fn query_value(&self, msg: Message) -> Result<String, RouterError> {
        let reply = self.query(msg).await?;
        Ok(reply.require_value()?.to_string())
    }

    fn handle_frame(&self, frame: &str) {
        let msg: Message = match frame.parse() {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring malformed frame from {}: {}", self.host, e);
                return;
            }
        };

        match msg.kind {
            Kind::Reply => {
                let key = msg.correlation_key();
                self.complete(&key, Ok(msg));
            }
            Kind::Error => {
                let key = msg.correlation_key();
                let reason = error_description(msg.value.as_deref().unwrap_or_default());
                self.complete(
                    &key,
                    Err(RouterError::Rejected {
                        request: key.clone(),
                        reason: reason.to_string(),
                    }),
                );
            }
            Kind::Request => self.apply(&msg),
        }
    }

    /// Hand a reply to the oldest waiter for `key` that is still listening.
    fn complete(&self, key: &str, result: Result<Message, RouterError>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(waiters) = pending.get_mut(key) else {
            debug!("Unsolicited reply for {}", key);
            return;
        };

        let mut result = result;
        while let Some(tx) = waiters.pop_front() {
            match tx.send(result) {
                Ok(()) => break,
                // That waiter timed out; try the next one.
                Err(returned) => result = returned,
            }
        }
        if waiters.is_empty() {
            pending.remove(key);
        }
    }

    fn fail_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, waiters) in pending.drain() {
            for tx in waiters {
                let _ = tx.send(Err(RouterError::Closed));
            }
        }
    }

    /// Apply a command seen on the wire, from us or another controller, to the model.
    fn apply(&self, msg: &Message) {
        match msg.known_command() {
            Some(Command::RecallSceneGroup) => {
                if let (Some(group), Some(block), Some(scene)) = (msg.group, msg.block, msg.scene) {
                    self.record_scene(SceneAddress::new(group, block, scene));
                }
            }
            Some(Command::DirectLevelDevice) => {
                if let (Some(Address::Device(address)), Some(level)) = (msg.address, msg.level) {
                    self.record_brightness(address, level_to_brightness(level));
                }
            }
            _ => debug!("Ignoring command {}", msg),
        }
    }

    fn record_scene(&self, scene: SceneAddress) {
        {
            let mut model = self.model.write().unwrap_or_else(|e| e.into_inner());
            let Some(group) = model.groups.get_mut(&scene.group_id) else {
                debug!("Scene recalled on unknown group {}", scene.group_id);
                return;
            };
            group.last_scene = Some(scene);
        }
        self.registry.notify(SubscriptionKey::Group(scene.group_id));
        // A scene changes the level of every device in the group.
        self.refresh.notify_one();
    }

    fn record_brightness(&self, address: DeviceAddress, brightness: u8) {
        {
            let mut model = self.model.write().unwrap_or_else(|e| e.into_inner());
            let Some(device) = model.devices.get_mut(&address) else {
                debug!("Level set on unknown device {}", address);
                return;
            };
            device.brightness = brightness;
        }
        self.registry.notify(SubscriptionKey::Device(address));
    }

    /// Read a device's load level as 0..=255 brightness.
    async fn query_load_level(&self, address: DeviceAddress) -> Result<u8, RouterError> {
        let level = self
            .query_value(
                Message::query(Command::QueryLoadLevel).with_address(Address::Device(address)),
            )
            .await?;
        let level: u8 = level
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidValue {
                param: "L".to_string(),
                value: level.clone(),
            })?;
        Ok(level_to_brightness(level))
    }

    /// Re-read the level of every light device, notifying those that changed.
    async fn refresh_levels(&self) -> Result<(), RouterError> {
        let addresses: Vec<DeviceAddress> = {
            let model = self.model.read().unwrap_or_else(|e| e.into_inner());
            model
                .devices
                .iter()
                .filter(|(_, record)| is_light_type(record.type_code))
                .map(|(&address, _)| address)
                .collect()
        };

        for address in addresses {
            let brightness = self.query_load_level(address).await?;
            let changed = {
                let mut model = self.model.write().unwrap_or_else(|e| e.into_inner());
                match model.devices.get_mut(&address) {
                    Some(device) if device.brightness != brightness => {
                        device.brightness = brightness;
                        true
                    }
                    _ => false,
                }
            };
            if changed {
                debug!("Device {} level changed to {}", address, brightness);
                self.registry.notify(SubscriptionKey::Device(address));
            }
        }

        Ok(())
    }

    async fn discover_groups(&self) -> Result<BTreeMap<u16, GroupRecord>, RouterError> {
        let ids = parse_id_list(&self.query_value(Message::query(Command::QueryGroups)).await?)?;
        let mut groups = BTreeMap::new();

        for id in ids {
            let name = self
                .query_value(Message::query(Command::QueryDescriptionGroup).with_group(id))
                .await?;

            let last_scene = match self
                .query_value(Message::query(Command::QueryLastSceneInGroup).with_group(id))
                .await
            {
                Ok(value) => value
                    .trim()
                    .parse::<u8>()
                    .ok()
                    .and_then(|n| SceneAddress::from_scene_number(id, n)),
                // Groups that never had a scene recalled have no last scene.
                Err(RouterError::Rejected { .. }) => None,
                Err(e) => return Err(e),
            };

            debug!("Group {} '{}', last scene {:?}", id, name, last_scene);
            groups.insert(id, GroupRecord { name, last_scene });
        }

        Ok(groups)
    }

    async fn discover_devices(
        &self,
        cluster: u8,
        router: u8,
    ) -> Result<BTreeMap<DeviceAddress, DeviceRecord>, RouterError> {
        let mut devices = BTreeMap::new();

        for subnet in SUBNETS {
            let query = Message::query(Command::QueryDeviceTypesAndAddresses).with_address(
                Address::Subnet {
                    cluster,
                    router,
                    subnet,
                },
            );
            let listing = match self.query_value(query).await {
                Ok(listing) => listing,
                Err(RouterError::Rejected { reason, .. }) => {
                    debug!("No devices on subnet {}: {}", subnet, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (type_code, device) in parse_device_types(&listing)? {
                let address = DeviceAddress::new(cluster, router, subnet, device);
                let name = self
                    .query_value(
                        Message::query(Command::QueryDescriptionDevice)
                            .with_address(Address::Device(address)),
                    )
                    .await?;

                let brightness = if is_light_type(type_code) {
                    self.query_load_level(address).await?
                } else {
                    0
                };

                debug!("Device {} '{}' type {:#x}", address, name, type_code);
                devices.insert(
                    address,
                    DeviceRecord {
                        name,
                        type_code,
                        brightness,
                    },
                );
            }
        }

        Ok(devices)
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let mut buf = [0u8; 4096];
    let mut frames = FrameBuffer::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("Helvar router at {} closed the connection", shared.host);
                break;
            }
            Ok(n) => {
                for frame in frames.push(&buf[..n]) {
                    shared.handle_frame(&frame);
                }
            }
            Err(e) => {
                warn!("Error reading from Helvar router at {}: {}", shared.host, e);
                break;
            }
        }
    }

    shared.writer.lock().await.take();
    shared.fail_pending();
}

/// Re-read device levels every `interval`, and whenever a scene is recalled.
async fn poll_loop(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Levels were just read by discovery.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.refresh.notified() => {}
        }

        match shared.refresh_levels().await {
            Ok(()) => {}
            Err(e) if e.is_connection_error() => {
                warn!("Stopped polling Helvar router at {}: {}", shared.host, e);
                break;
            }
            Err(e) => warn!("Failed to poll device levels on {}: {}", shared.host, e),
        }
    }
}

/// HelvarNet client over TCP.
///
/// Keeps a live model of the router's groups and devices. The model is
/// updated from replies during [`Router::initialize`], from commands this
/// client sends, and from commands other controllers send that the router
/// relays to us. Device levels are also polled, since scene recalls, fades
/// and wall panels change them without a per-device message. Every update
/// notifies the matching subscriptions.
pub struct HelvarNetRouter {
    shared: Arc<Shared>,
    poll_interval: Duration,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl HelvarNetRouter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                host: host.into(),
                port,
                model: RwLock::new(Model::default()),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                registry: SubscriptionRegistry::new(),
                router_address: Mutex::new(None),
                refresh: Notify::new(),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reader_task: Mutex::new(None),
            poll_task: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn abort_tasks(&self) {
        for task in [&self.reader_task, &self.poll_task] {
            if let Some(task) = task.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Router for HelvarNetRouter {
    async fn connect(&self) -> Result<(), RouterError> {
        let shared = &self.shared;
        let stream = TcpStream::connect((shared.host.as_str(), shared.port))
            .await
            .map_err(|source| RouterError::Connection {
                host: shared.host.clone(),
                port: shared.port,
                source,
            })?;

        let (cluster, router) = match stream.peer_addr()?.ip() {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                (octets[2], octets[3])
            }
            IpAddr::V6(ip) => {
                return Err(RouterError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("router address must be IPv4, got {}", ip),
                )));
            }
        };
        *shared
            .router_address
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((cluster, router));

        let (reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);

        self.abort_tasks();
        let task = tokio::spawn(read_loop(shared.clone(), reader));
        *self.reader_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        info!(
            "Connected to Helvar router {}:{} (cluster {}, router {})",
            shared.host, shared.port, cluster, router
        );
        Ok(())
    }

    async fn initialize(&self) -> Result<(), RouterError> {
        let shared = &self.shared;
        let (cluster, router) = shared
            .router_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or(RouterError::NotConnected)?;

        let groups = shared.discover_groups().await?;
        let devices = shared.discover_devices(cluster, router).await?;

        info!(
            "Discovered {} groups and {} devices on {}",
            groups.len(),
            devices.len(),
            shared.host
        );

        {
            let mut model = shared.model.write().unwrap_or_else(|e| e.into_inner());
            model.groups = groups;
            model.devices = devices;
        }

        let task = tokio::spawn(poll_loop(shared.clone(), self.poll_interval));
        if let Some(old) = self
            .poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }
        Ok(())
    }

    fn groups(&self) -> Vec<Arc<dyn Scened>> {
        let model = self.shared.model.read().unwrap_or_else(|e| e.into_inner());
        model
            .groups
            .keys()
            .map(|&id| {
                Arc::new(HelvarGroup {
                    id,
                    shared: self.shared.clone(),
                }) as Arc<dyn Scened>
            })
            .collect()
    }

    fn light_devices(&self) -> Vec<Arc<dyn Dimmable>> {
        let model = self.shared.model.read().unwrap_or_else(|e| e.into_inner());
        model
            .devices
            .iter()
            .filter(|(_, record)| is_light_type(record.type_code))
            .map(|(&address, _)| {
                Arc::new(HelvarDevice {
                    address,
                    shared: self.shared.clone(),
                }) as Arc<dyn Dimmable>
            })
            .collect()
    }

    async fn disconnect(&self) {
        self.abort_tasks();
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.fail_pending();
    }
}

impl Drop for HelvarNetRouter {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Handle to one group in a [`HelvarNetRouter`]'s model.
struct HelvarGroup {
    id: u16,
    shared: Arc<Shared>,
}

#[async_trait]
impl Scened for HelvarGroup {
    fn group_id(&self) -> u16 {
        self.id
    }

    fn name(&self) -> String {
        let model = self.shared.model.read().unwrap_or_else(|e| e.into_inner());
        model
            .groups
            .get(&self.id)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| format!("Group {}", self.id))
    }

    fn last_scene(&self) -> Option<SceneAddress> {
        let model = self.shared.model.read().unwrap_or_else(|e| e.into_inner());
        model.groups.get(&self.id).and_then(|g| g.last_scene)
    }

    async fn set_scene(&self, scene: SceneAddress) -> Result<(), RouterError> {
        if !self
            .shared
            .model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .contains_key(&scene.group_id)
        {
            return Err(RouterError::UnknownGroup(scene.group_id));
        }
        self.shared
            .send(&Message::recall_scene(scene, COMMAND_FADE_TIME))
            .await?;
        self.shared.record_scene(scene);
        Ok(())
    }

    fn subscribe(&self, callback: Callback) -> Subscription {
        self.shared
            .registry
            .register(SubscriptionKey::Group(self.id), callback)
    }
}

/// Handle to one device in a [`HelvarNetRouter`]'s model.
struct HelvarDevice {
    address: DeviceAddress,
    shared: Arc<Shared>,
}

#[async_trait]
impl Dimmable for HelvarDevice {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn name(&self) -> String {
        let model = self.shared.model.read().unwrap_or_else(|e| e.into_inner());
        model
            .devices
            .get(&self.address)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| self.address.to_string())
    }

    fn brightness(&self) -> u8 {
        let model = self.shared.model.read().unwrap_or_else(|e| e.into_inner());
        model
            .devices
            .get(&self.address)
            .map_or(0, |d| d.brightness)
    }

    async fn set_brightness(&self, brightness: u8) -> Result<(), RouterError> {
        if !self
            .shared
            .model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .devices
            .contains_key(&self.address)
        {
            return Err(RouterError::UnknownDevice(self.address));
        }
        let level = brightness_to_level(brightness);
        self.shared
            .send(&Message::direct_level_device(
                self.address,
                level,
                COMMAND_FADE_TIME,
            ))
            .await?;
        self.shared.record_brightness(self.address, brightness);
        Ok(())
    }

    fn subscribe(&self, callback: Callback) -> Subscription {
        self.shared
            .registry
            .register(SubscriptionKey::Device(self.address), callback)
    }
}
