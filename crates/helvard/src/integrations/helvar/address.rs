use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::protocol::ProtocolError;

/// Scene position recalled when a group light is turned on.
pub const DEFAULT_ON_GROUP_BLOCK: u8 = 1;
pub const DEFAULT_ON_GROUP_SCENE: u8 = 1;

/// Scene position recalled when a group light is turned off.
pub const DEFAULT_OFF_GROUP_BLOCK: u8 = 1;
pub const DEFAULT_OFF_GROUP_SCENE: u8 = 16;

/// Number of scenes in one block of a group.
pub const SCENES_PER_BLOCK: u8 = 16;

/// Number of blocks a group's scene table is split into.
pub const BLOCKS_PER_GROUP: u8 = 8;

/// Identifies one scene on the router: a scene within a block of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneAddress {
    pub group_id: u16,
    pub block: u8,
    pub scene: u8,
}

impl SceneAddress {
    pub fn new(group_id: u16, block: u8, scene: u8) -> Self {
        Self {
            group_id,
            block,
            scene,
        }
    }

    /// Build an address from the flat scene number (1..=128) the router
    /// reports for a group's last recalled scene.
    pub fn from_scene_number(group_id: u16, number: u8) -> Option<Self> {
        if number == 0 || number > SCENES_PER_BLOCK * BLOCKS_PER_GROUP {
            return None;
        }
        let index = number - 1;
        Some(Self {
            group_id,
            block: index / SCENES_PER_BLOCK + 1,
            scene: index % SCENES_PER_BLOCK + 1,
        })
    }
}

impl fmt::Display for SceneAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}.B{}.S{}", self.group_id, self.block, self.scene)
    }
}

/// A block/scene pair, independent of any group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BlockScene {
    pub block: u8,
    pub scene: u8,
}

impl BlockScene {
    pub fn in_group(&self, group_id: u16) -> SceneAddress {
        SceneAddress::new(group_id, self.block, self.scene)
    }
}

fn default_on() -> BlockScene {
    BlockScene {
        block: DEFAULT_ON_GROUP_BLOCK,
        scene: DEFAULT_ON_GROUP_SCENE,
    }
}

fn default_off() -> BlockScene {
    BlockScene {
        block: DEFAULT_OFF_GROUP_BLOCK,
        scene: DEFAULT_OFF_GROUP_SCENE,
    }
}

/// Which scenes stand for "on" and "off" when a group is driven as a light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SceneMapping {
    #[serde(default = "default_on")]
    pub on: BlockScene,

    #[serde(default = "default_off")]
    pub off: BlockScene,
}

impl SceneMapping {
    pub fn on_address(&self, group_id: u16) -> SceneAddress {
        self.on.in_group(group_id)
    }

    pub fn off_address(&self, group_id: u16) -> SceneAddress {
        self.off.in_group(group_id)
    }
}

impl Default for SceneMapping {
    fn default() -> Self {
        Self {
            on: default_on(),
            off: default_off(),
        }
    }
}

/// Address of a single device: cluster, router, subnet and device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub cluster: u8,
    pub router: u8,
    pub subnet: u8,
    pub device: u16,
}

impl DeviceAddress {
    pub fn new(cluster: u8, router: u8, subnet: u8, device: u16) -> Self {
        Self {
            cluster,
            router,
            subnet,
            device,
        }
    }

    /// Dotted form without the `@` prefix, e.g. `1.2.1.5`.
    pub fn dotted(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.cluster, self.router, self.subnet, self.device
        )
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.dotted())
    }
}

impl FromStr for DeviceAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidValue {
            param: "@".to_string(),
            value: s.to_string(),
        };
        let raw = s.strip_prefix('@').unwrap_or(s);
        let parts: Vec<&str> = raw.split('.').collect();
        let [cluster, router, subnet, device] = parts[..] else {
            return Err(invalid());
        };
        Ok(Self {
            cluster: cluster.parse().map_err(|_| invalid())?,
            router: router.parse().map_err(|_| invalid())?,
            subnet: subnet.parse().map_err(|_| invalid())?,
            device: device.parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_address_equality() {
        assert_eq!(SceneAddress::new(3, 1, 1), SceneAddress::new(3, 1, 1));
        assert_ne!(SceneAddress::new(3, 1, 1), SceneAddress::new(4, 1, 1));
        assert_ne!(SceneAddress::new(3, 1, 1), SceneAddress::new(3, 2, 1));
        assert_ne!(SceneAddress::new(3, 1, 1), SceneAddress::new(3, 1, 2));
    }

    #[test]
    fn test_scene_number_conversion() {
        assert_eq!(
            SceneAddress::from_scene_number(7, 1),
            Some(SceneAddress::new(7, 1, 1))
        );
        assert_eq!(
            SceneAddress::from_scene_number(7, 16),
            Some(SceneAddress::new(7, 1, 16))
        );
        assert_eq!(
            SceneAddress::from_scene_number(7, 17),
            Some(SceneAddress::new(7, 2, 1))
        );
        assert_eq!(
            SceneAddress::from_scene_number(7, 128),
            Some(SceneAddress::new(7, 8, 16))
        );
        assert_eq!(SceneAddress::from_scene_number(7, 0), None);
        assert_eq!(SceneAddress::from_scene_number(7, 129), None);
    }

    #[test]
    fn test_default_mapping() {
        let mapping = SceneMapping::default();
        assert_eq!(mapping.on_address(4), SceneAddress::new(4, 1, 1));
        assert_eq!(mapping.off_address(4), SceneAddress::new(4, 1, 16));
    }

    #[test]
    fn test_device_address_parse() {
        let addr: DeviceAddress = "@1.2.3.45".parse().unwrap();
        assert_eq!(addr, DeviceAddress::new(1, 2, 3, 45));
        assert_eq!(addr.to_string(), "@1.2.3.45");
        assert_eq!("1.2.3.45".parse::<DeviceAddress>().unwrap(), addr);

        assert_eq!(
            "1.2.3".parse::<DeviceAddress>(),
            Err(ProtocolError::InvalidValue {
                param: "@".to_string(),
                value: "1.2.3".to_string(),
            })
        );
        assert!(matches!(
            "@1.2.x.4".parse::<DeviceAddress>(),
            Err(ProtocolError::InvalidValue { value, .. }) if value == "@1.2.x.4"
        ));
    }
}
