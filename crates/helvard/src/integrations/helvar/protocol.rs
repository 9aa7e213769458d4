//! HelvarNet ASCII message codec.
//!
//! Every frame is a kind marker followed by comma separated parameters and an
//! optional `=value`, terminated by `#`:
//!
//! - `>V:2,C:11,G:3,B:1,S:1,F:100#` request (command or query)
//! - `?V:2,C:105,G:3=Office#` reply to a query
//! - `!V:2,C:105,G:99=1#` error reply carrying an error code

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use super::address::DeviceAddress;
use super::address::SceneAddress;

/// Protocol version sent with every request.
pub const PROTOCOL_VERSION: u8 = 2;

/// Fade time used for commands, in hundredths of a second.
pub const COMMAND_FADE_TIME: u32 = 100;

/// Highest load level a device accepts, in percent.
pub const MAX_LEVEL: u8 = 100;

/// DALI protocol identifier in the low byte of a device type code.
const PROTOCOL_DALI: u32 = 0x01;

/// Highest DALI device type that drives a lamp (0 fluorescent .. 8 colour control).
const DALI_MAX_LOAD_TYPE: u32 = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message marker '{0}'")]
    UnknownMarker(char),

    #[error("missing terminator in frame: {0}")]
    MissingTerminator(String),

    #[error("missing {0} parameter in frame: {1}")]
    MissingParameter(&'static str, String),

    #[error("invalid {param} value '{value}'")]
    InvalidValue { param: String, value: String },
}

impl ProtocolError {
    fn invalid(param: &str, value: &str) -> Self {
        ProtocolError::InvalidValue {
            param: param.to_string(),
            value: value.to_string(),
        }
    }
}

/// Command codes this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u16)]
pub enum Command {
    RecallSceneGroup = 11,
    DirectLevelDevice = 14,
    QueryDeviceTypesAndAddresses = 100,
    QueryDescriptionGroup = 105,
    QueryDescriptionDevice = 106,
    QueryLastSceneInGroup = 109,
    QueryLoadLevel = 152,
    QueryGroups = 165,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `>`: a command or a query sent to the router
    Request,
    /// `?`: a successful answer to a query
    Reply,
    /// `!`: the router rejected a request
    Error,
}

impl Kind {
    fn marker(self) -> char {
        match self {
            Kind::Request => '>',
            Kind::Reply => '?',
            Kind::Error => '!',
        }
    }
}

/// The `@` target of a message: either a whole subnet or a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Subnet { cluster: u8, router: u8, subnet: u8 },
    Device(DeviceAddress),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Subnet {
                cluster,
                router,
                subnet,
            } => write!(f, "@{}.{}.{}", cluster, router, subnet),
            Address::Device(device) => write!(f, "{}", device),
        }
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix('@').unwrap_or(s);
        match raw.split('.').count() {
            3 => {
                let mut parts = raw.split('.').map(|p| p.parse::<u8>());
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(cluster)), Some(Ok(router)), Some(Ok(subnet))) => {
                        Ok(Address::Subnet {
                            cluster,
                            router,
                            subnet,
                        })
                    }
                    _ => Err(ProtocolError::invalid("@", s)),
                }
            }
            4 => s.parse().map(Address::Device),
            _ => Err(ProtocolError::invalid("@", s)),
        }
    }
}

/// One HelvarNet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: Kind,
    pub version: u8,
    pub command: u16,
    pub group: Option<u16>,
    pub block: Option<u8>,
    pub scene: Option<u8>,
    pub level: Option<u8>,
    pub fade: Option<u32>,
    pub address: Option<Address>,
    pub value: Option<String>,
}

impl Message {
    fn request(command: Command) -> Self {
        Self {
            kind: Kind::Request,
            version: PROTOCOL_VERSION,
            command: command.code(),
            group: None,
            block: None,
            scene: None,
            level: None,
            fade: None,
            address: None,
            value: None,
        }
    }

    /// A query with no target; add one with [`Message::with_group`] or
    /// [`Message::with_address`].
    pub fn query(command: Command) -> Self {
        Self::request(command)
    }

    pub fn with_group(mut self, group: u16) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Recall a scene on every device of a group.
    pub fn recall_scene(scene: SceneAddress, fade: u32) -> Self {
        let mut msg = Self::request(Command::RecallSceneGroup).with_group(scene.group_id);
        msg.block = Some(scene.block);
        msg.scene = Some(scene.scene);
        msg.fade = Some(fade);
        msg
    }

    /// Set a single device to a load level in percent.
    pub fn direct_level_device(address: DeviceAddress, level: u8, fade: u32) -> Self {
        let mut msg = Self::request(Command::DirectLevelDevice);
        msg.level = Some(level.min(MAX_LEVEL));
        msg.fade = Some(fade);
        msg.address = Some(Address::Device(address));
        msg
    }

    /// The known command this message carries, if any.
    pub fn known_command(&self) -> Option<Command> {
        Command::from_repr(self.command)
    }

    /// Key shared by a query and its reply: command plus target parameters.
    pub fn correlation_key(&self) -> String {
        let mut key = format!("C:{}", self.command);
        if let Some(group) = self.group {
            key.push_str(&format!(",G:{}", group));
        }
        if let Some(block) = self.block {
            key.push_str(&format!(",B:{}", block));
        }
        if let Some(address) = &self.address {
            key.push_str(&format!(",{}", address));
        }
        key
    }

    /// The value part of a reply, or an error if there is none.
    pub fn require_value(&self) -> Result<&str, ProtocolError> {
        self.value
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingParameter("value", self.to_string()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}V:{},C:{}", self.kind.marker(), self.version, self.command)?;
        if let Some(group) = self.group {
            write!(f, ",G:{}", group)?;
        }
        if let Some(block) = self.block {
            write!(f, ",B:{}", block)?;
        }
        if let Some(scene) = self.scene {
            write!(f, ",S:{}", scene)?;
        }
        if let Some(level) = self.level {
            write!(f, ",L:{}", level)?;
        }
        if let Some(fade) = self.fade {
            write!(f, ",F:{}", fade)?;
        }
        if let Some(address) = &self.address {
            write!(f, ",{}", address)?;
        }
        if let Some(value) = &self.value {
            write!(f, "={}", value)?;
        }
        write!(f, "#")
    }
}

fn parse_num<T: FromStr>(param: &str, value: &str) -> Result<T, ProtocolError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::invalid(param, value))
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let frame = s.trim();
        let mut chars = frame.chars();
        let kind = match chars.next() {
            None => return Err(ProtocolError::Empty),
            Some('>') => Kind::Request,
            Some('?') => Kind::Reply,
            Some('!') => Kind::Error,
            Some(other) => return Err(ProtocolError::UnknownMarker(other)),
        };
        let body = chars
            .as_str()
            .strip_suffix('#')
            .ok_or_else(|| ProtocolError::MissingTerminator(frame.to_string()))?;

        let (head, value) = match body.split_once('=') {
            Some((head, value)) => (head, Some(value.to_string())),
            None => (body, None),
        };

        let mut version = None;
        let mut command = None;
        let mut msg = Self::request(Command::QueryGroups);
        msg.kind = kind;
        msg.value = value;

        for token in head.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.starts_with('@') {
                msg.address = Some(token.parse()?);
                continue;
            }
            let (param, raw) = token
                .split_once(':')
                .ok_or_else(|| ProtocolError::invalid("parameter", token))?;
            match param {
                "V" => version = Some(parse_num(param, raw)?),
                "C" => command = Some(parse_num(param, raw)?),
                "G" => msg.group = Some(parse_num(param, raw)?),
                "B" => msg.block = Some(parse_num(param, raw)?),
                "S" => msg.scene = Some(parse_num(param, raw)?),
                "L" => msg.level = Some(parse_num(param, raw)?),
                "F" => msg.fade = Some(parse_num(param, raw)?),
                // Sequence numbers, acks, proportions and the like are not used here.
                _ => {}
            }
        }

        msg.version = version.ok_or_else(|| ProtocolError::MissingParameter("V", frame.to_string()))?;
        msg.command = command.ok_or_else(|| ProtocolError::MissingParameter("C", frame.to_string()))?;
        Ok(msg)
    }
}

/// Longest run of bytes without a terminator kept while waiting for `#`.
pub const MAX_PENDING_FRAME: usize = 64 * 1024;

/// Accumulates bytes from the socket and yields complete `#`-terminated frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'#') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let frame = String::from_utf8_lossy(&raw);
            let frame = frame.trim();
            if !frame.is_empty() {
                frames.push(frame.to_string());
            }
        }
        if self.pending.len() > MAX_PENDING_FRAME {
            warn!(
                "Dropping {} bytes received without a frame terminator",
                self.pending.len()
            );
            self.pending.clear();
        }
        frames
    }
}

/// Parse a comma separated id list such as the reply to a groups query.
pub fn parse_id_list(value: &str) -> Result<Vec<u16>, ProtocolError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| parse_num("id", v))
        .collect()
}

/// Parse `type@device` pairs from a device types and addresses reply.
pub fn parse_device_types(value: &str) -> Result<Vec<(u32, u16)>, ProtocolError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|pair| -> Result<(u32, u16), ProtocolError> {
            let (type_code, device) = pair
                .split_once('@')
                .ok_or_else(|| ProtocolError::invalid("device type", pair))?;
            Ok((parse_num("device type", type_code)?, parse_num("device", device)?))
        })
        .collect()
}

/// Whether a device type code describes a DALI lamp load.
pub fn is_light_type(type_code: u32) -> bool {
    type_code & 0xff == PROTOCOL_DALI && (type_code >> 8) & 0xff <= DALI_MAX_LOAD_TYPE
}

/// Convert 0..=255 brightness into the router's 0..=100 percent level.
pub fn brightness_to_level(brightness: u8) -> u8 {
    ((brightness as u32 * MAX_LEVEL as u32 + 127) / 255) as u8
}

/// Convert a 0..=100 percent level into 0..=255 brightness.
pub fn level_to_brightness(level: u8) -> u8 {
    let level = level.min(MAX_LEVEL) as u32;
    ((level * 255 + MAX_LEVEL as u32 / 2) / MAX_LEVEL as u32) as u8
}

/// Human readable text for a router error code.
pub fn error_description(code: &str) -> &'static str {
    match code.trim() {
        "0" => "success",
        "1" => "invalid group index",
        "2" => "invalid cluster",
        "3" => "invalid router",
        "4" => "invalid subnet",
        "5" => "invalid device",
        "6" => "invalid sub device",
        "7" => "invalid block",
        "8" => "invalid scene",
        "9" => "cluster does not exist",
        "10" => "router does not exist",
        "11" => "device does not exist",
        "12" => "property does not exist",
        "13" => "invalid raw message size",
        "14" => "invalid message type",
        "15" => "invalid message command",
        "16" => "missing terminator",
        "17" => "missing parameter",
        "18" => "incompatible version",
        _ => "unknown error",
    }
}
