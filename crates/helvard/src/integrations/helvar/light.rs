use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use super::address::DeviceAddress;
use super::address::SceneMapping;
use super::router::Dimmable;
use super::router::RouterError;
use super::router::Scened;
use super::subscription::RepaintSender;
use super::subscription::Subscription;
use super::subscription::repaint_callback;
use crate::engine::state::LightState;

/// Brightness sent to a device when it is turned on.
pub const FULL_BRIGHTNESS: u8 = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LightError {
    #[error("device or group must be set")]
    NoTarget,

    #[error("device and group cannot both be set")]
    BothTargets,
}

/// What a light drives on the router.
#[derive(Clone)]
pub enum LightTarget {
    Group(Arc<dyn Scened>),
    Device(Arc<dyn Dimmable>),
}

/// A Helvar group or device presented as an on/off light.
///
/// Groups are switched by recalling the configured on and off scenes, and
/// read as on unless their last scene is unknown or is the off scene.
/// Devices are switched by setting full or zero brightness.
///
/// Every property reads straight from the router handle; the adapter holds
/// no copy of the state and never applies the result of its own commands.
pub struct HelvarLight {
    entity_id: String,
    target: LightTarget,
    scenes: SceneMapping,
    subscription: Mutex<Option<Subscription>>,
}

impl HelvarLight {
    /// Create a light for exactly one of `group` or `device`.
    pub fn new(
        entry_id: &str,
        group: Option<Arc<dyn Scened>>,
        device: Option<Arc<dyn Dimmable>>,
        scenes: SceneMapping,
    ) -> Result<Self, LightError> {
        let target = match (group, device) {
            (Some(group), None) => LightTarget::Group(group),
            (None, Some(device)) => LightTarget::Device(device),
            (None, None) => return Err(LightError::NoTarget),
            (Some(_), Some(_)) => return Err(LightError::BothTargets),
        };

        Ok(Self::with_target(entry_id, target, scenes))
    }

    #[cfg(test)]
    pub fn group(entry_id: &str, group: Arc<dyn Scened>, scenes: SceneMapping) -> Self {
        Self::with_target(entry_id, LightTarget::Group(group), scenes)
    }

    #[cfg(test)]
    pub fn device(entry_id: &str, device: Arc<dyn Dimmable>) -> Self {
        Self::with_target(entry_id, LightTarget::Device(device), SceneMapping::default())
    }

    fn with_target(entry_id: &str, target: LightTarget, scenes: SceneMapping) -> Self {
        let entity_id = match &target {
            LightTarget::Group(group) => {
                format!("light.{}_group_{}", entry_id, group.group_id())
            }
            LightTarget::Device(device) => {
                let DeviceAddress {
                    cluster,
                    router,
                    subnet,
                    device,
                } = device.address();
                format!(
                    "light.{}_{}_{}_{}_{}",
                    entry_id, cluster, router, subnet, device
                )
            }
        };

        Self {
            entity_id,
            target,
            scenes,
            subscription: Mutex::new(None),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn is_group(&self) -> bool {
        matches!(self.target, LightTarget::Group(_))
    }

    pub fn name(&self) -> String {
        match &self.target {
            LightTarget::Group(group) => format!("Group: {}", group.name()),
            LightTarget::Device(device) => device.name(),
        }
    }

    /// Brightness of a device light. Groups do not support brightness.
    pub fn brightness(&self) -> Option<u8> {
        match &self.target {
            LightTarget::Group(_) => None,
            LightTarget::Device(device) => Some(device.brightness()),
        }
    }

    pub fn is_on(&self) -> bool {
        match &self.target {
            LightTarget::Group(group) => match group.last_scene() {
                None => false,
                Some(scene) => scene != self.scenes.off_address(group.group_id()),
            },
            LightTarget::Device(_) => self.brightness().is_some_and(|b| b > 0),
        }
    }

    pub async fn turn_on(&self) -> Result<(), RouterError> {
        match &self.target {
            LightTarget::Group(group) => {
                let scene = self.scenes.on_address(group.group_id());
                debug!("{}: recalling on scene {}", self.entity_id, scene);
                group.set_scene(scene).await
            }
            LightTarget::Device(device) => {
                debug!("{}: setting full brightness", self.entity_id);
                device.set_brightness(FULL_BRIGHTNESS).await
            }
        }
    }

    pub async fn turn_off(&self) -> Result<(), RouterError> {
        match &self.target {
            LightTarget::Group(group) => {
                let scene = self.scenes.off_address(group.group_id());
                debug!("{}: recalling off scene {}", self.entity_id, scene);
                group.set_scene(scene).await
            }
            LightTarget::Device(device) => {
                debug!("{}: setting zero brightness", self.entity_id);
                device.set_brightness(0).await
            }
        }
    }

    /// Nothing to fetch: the router handle is kept current by the client.
    pub async fn update(&self) -> Result<(), RouterError> {
        Ok(())
    }

    /// Current state as reported to the engine.
    pub fn state(&self) -> LightState {
        LightState {
            name: self.name(),
            on: self.is_on(),
            brightness: self.brightness(),
        }
    }

    /// Ask to be repainted whenever the router reports a change for this
    /// light's group or device. Replaces any earlier registration.
    pub fn register_subscription(&self, repaint: RepaintSender) {
        let callback = repaint_callback(self.entity_id.clone(), repaint);
        let subscription = match &self.target {
            LightTarget::Group(group) => group.subscribe(callback),
            LightTarget::Device(device) => device.subscribe(callback),
        };
        *self.subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
    }

    /// Drop the change registration, if any.
    pub fn release_subscription(&self) {
        if let Some(subscription) = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            subscription.release();
        }
    }
}

impl std::fmt::Debug for HelvarLight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelvarLight")
            .field("entity_id", &self.entity_id)
            .field("is_group", &self.is_group())
            .field("scenes", &self.scenes)
            .finish()
    }
}
