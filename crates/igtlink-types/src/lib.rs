//! Shared types for igtlink components.
//!
//! This crate provides the plain types used across igtlink-wire,
//! igtlink-connector and the `igtlink` binary: connector roles and states,
//! command status, metadata maps and decoded device payloads. All types are
//! serializable so collaborators can persist or forward them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Network role of a connector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorRole {
    /// Listen for a single peer on `port`.
    Server { port: u16 },
    /// Connect to `host:port`.
    Client { host: String, port: u16 },
    #[default]
    Unspecified,
}

impl ConnectorRole {
    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self, ConnectorRole::Server { .. })
    }

    #[must_use]
    pub fn is_client(&self) -> bool {
        matches!(self, ConnectorRole::Client { .. })
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            ConnectorRole::Server { port } | ConnectorRole::Client { port, .. } => Some(*port),
            ConnectorRole::Unspecified => None,
        }
    }
}

impl fmt::Display for ConnectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorRole::Server { port } => write!(f, "server:{port}"),
            ConnectorRole::Client { host, port } => write!(f, "client:{host}:{port}"),
            ConnectorRole::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Connection state of a connector session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    /// No socket; initial state and the target of `stop()`.
    #[default]
    Off,
    /// Server is listening for a peer.
    WaitConnection,
    /// Client connect attempt in flight or scheduled.
    Connecting,
    Connected,
}

impl ConnectorState {
    pub const ALL: [ConnectorState; 4] = [
        ConnectorState::Off,
        ConnectorState::WaitConnection,
        ConnectorState::Connecting,
        ConnectorState::Connected,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectorState::Off => "Off",
            ConnectorState::WaitConnection => "WaitConnection",
            ConnectorState::Connecting => "Connecting",
            ConnectorState::Connected => "Connected",
        }
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        self != ConnectorState::Off
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a command.
///
/// `Unknown → Waiting → {Success, Fail, Expired, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandStatus {
    #[default]
    Unknown,
    Waiting,
    Success,
    Fail,
    Expired,
    Cancelled,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Unknown => "Unknown",
            CommandStatus::Waiting => "Waiting",
            CommandStatus::Success => "Success",
            CommandStatus::Fail => "Fail",
            CommandStatus::Expired => "Expired",
            CommandStatus::Cancelled => "Cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Success
                | CommandStatus::Fail
                | CommandStatus::Expired
                | CommandStatus::Cancelled
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a command originated locally or from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandDirection {
    #[default]
    Out,
    In,
}

/// IANA character set identifier (MIBenum) used for string payloads and metadata values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    UsAscii,
    Utf8,
    Other(u16),
}

impl Encoding {
    #[must_use]
    pub fn mib(self) -> u16 {
        match self {
            Encoding::UsAscii => 3,
            Encoding::Utf8 => 106,
            Encoding::Other(mib) => mib,
        }
    }

    #[must_use]
    pub fn from_mib(mib: u16) -> Self {
        match mib {
            3 => Encoding::UsAscii,
            106 => Encoding::Utf8,
            other => Encoding::Other(other),
        }
    }

    /// Pick the narrowest encoding able to carry `text`.
    #[must_use]
    pub fn for_text(text: &str) -> Self {
        if text.is_ascii() {
            Encoding::UsAscii
        } else {
            Encoding::Utf8
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataValue {
    pub encoding: Encoding,
    pub value: String,
}

/// Ordered key → (encoding, value) map carried next to a message body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaData(BTreeMap<String, MetaDataValue>);

impl MetaData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, encoding: Encoding, value: impl Into<String>) {
        self.0.insert(
            key.into(),
            MetaDataValue {
                encoding,
                value: value.into(),
            },
        );
    }

    /// Insert a US-ASCII value.
    pub fn insert_ascii(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, Encoding::UsAscii, value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetaDataValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaDataValue> {
        self.0.remove(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaDataValue)> {
        self.0.iter()
    }
}

/// Device kind, identified on the wire by its type tag.
///
/// The built-in kinds have converters; `Other` carries any other tag and its
/// payload is kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Status,
    Transform,
    String,
    Image,
    Command,
    CommandResponse,
    Other(std::string::String),
}

impl DeviceKind {
    /// Kinds with a built-in converter, in registry order.
    pub const BUILTIN: [DeviceKind; 6] = [
        DeviceKind::Status,
        DeviceKind::Transform,
        DeviceKind::String,
        DeviceKind::Image,
        DeviceKind::Command,
        DeviceKind::CommandResponse,
    ];

    #[must_use]
    pub fn type_tag(&self) -> &str {
        match self {
            DeviceKind::Status => "STATUS",
            DeviceKind::Transform => "TRANSFORM",
            DeviceKind::String => "STRING",
            DeviceKind::Image => "IMAGE",
            DeviceKind::Command => "COMMAND",
            DeviceKind::CommandResponse => "RTS_COMMAND",
            DeviceKind::Other(tag) => tag,
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "STATUS" => DeviceKind::Status,
            "TRANSFORM" => DeviceKind::Transform,
            "STRING" => DeviceKind::String,
            "IMAGE" => DeviceKind::Image,
            "COMMAND" => DeviceKind::Command,
            "RTS_COMMAND" => DeviceKind::CommandResponse,
            other => DeviceKind::Other(other.to_string()),
        }
    }

    /// Command traffic is routed to the command layer instead of a device.
    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(self, DeviceKind::Command | DeviceKind::CommandResponse)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}

/// Identity of a device within one connector: (type, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub kind: DeviceKind,
    pub name: String,
}

impl DeviceKey {
    #[must_use]
    pub fn new(kind: DeviceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// STATUS payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusContent {
    pub code: u16,
    pub subcode: i64,
    pub error_name: String,
    pub message: String,
}

impl StatusContent {
    pub const CODE_OK: u16 = 1;
}

/// TRANSFORM payload: upper 3x4 of a homogeneous matrix, column-major
/// (R11 R21 R31 R12 R22 R32 R13 R23 R33 TX TY TZ).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformContent {
    pub values: [f32; 12],
}

impl TransformContent {
    #[must_use]
    pub fn identity() -> Self {
        Self {
            values: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
        }
    }

    #[must_use]
    pub fn translation(&self) -> [f32; 3] {
        [self.values[9], self.values[10], self.values[11]]
    }

    /// Row-major 4x4 view.
    #[must_use]
    pub fn matrix(&self) -> [[f32; 4]; 4] {
        let v = &self.values;
        [
            [v[0], v[3], v[6], v[9]],
            [v[1], v[4], v[7], v[10]],
            [v[2], v[5], v[8], v[11]],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }
}

impl Default for TransformContent {
    fn default() -> Self {
        Self::identity()
    }
}

/// STRING payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StringContent {
    pub encoding: Encoding,
    pub text: String,
}

/// IMAGE payload. Pixel data is kept as received; no conversion is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub components: u8,
    pub scalar_type: u8,
    pub endian: u8,
    pub coordinate: u8,
    pub size: [u16; 3],
    pub matrix: [f32; 12],
    pub subvolume_offset: [u16; 3],
    pub subvolume_size: [u16; 3],
    pub pixels: Vec<u8>,
}

/// Decoded content of a device, by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceContent {
    Status(StatusContent),
    Transform(TransformContent),
    String(StringContent),
    Image(ImageContent),
    Raw { bytes: Vec<u8> },
}

impl DeviceContent {
    /// The device kind able to carry this content, when it is fixed.
    #[must_use]
    pub fn kind(&self) -> Option<DeviceKind> {
        match self {
            DeviceContent::Status(_) => Some(DeviceKind::Status),
            DeviceContent::Transform(_) => Some(DeviceKind::Transform),
            DeviceContent::String(_) => Some(DeviceKind::String),
            DeviceContent::Image(_) => Some(DeviceKind::Image),
            DeviceContent::Raw { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_status_display() {
        let expected = [
            (CommandStatus::Unknown, "Unknown"),
            (CommandStatus::Waiting, "Waiting"),
            (CommandStatus::Success, "Success"),
            (CommandStatus::Fail, "Fail"),
            (CommandStatus::Expired, "Expired"),
            (CommandStatus::Cancelled, "Cancelled"),
        ];
        for (status, text) in expected {
            assert_eq!(status.to_string(), text);
        }
    }

    #[test]
    fn test_command_status_terminal() {
        assert!(!CommandStatus::Unknown.is_terminal());
        assert!(!CommandStatus::Waiting.is_terminal());
        assert!(CommandStatus::Success.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_device_kind_tags() {
        for kind in DeviceKind::BUILTIN {
            assert_eq!(DeviceKind::from_tag(kind.type_tag()), kind);
        }
        assert_eq!(
            DeviceKind::from_tag("POLYDATA"),
            DeviceKind::Other("POLYDATA".to_string())
        );
        assert!(DeviceKind::CommandResponse.is_command());
        assert!(!DeviceKind::Transform.is_command());
    }

    #[test]
    fn test_encoding_mib() {
        assert_eq!(Encoding::UsAscii.mib(), 3);
        assert_eq!(Encoding::from_mib(106), Encoding::Utf8);
        assert_eq!(Encoding::from_mib(4), Encoding::Other(4));
        assert_eq!(Encoding::for_text("depth"), Encoding::UsAscii);
        assert_eq!(Encoding::for_text("tiefe µm"), Encoding::Utf8);
    }

    #[test]
    fn test_metadata_is_ordered_by_key() {
        let mut meta = MetaData::new();
        meta.insert_ascii("zeta", "1");
        meta.insert("alpha", Encoding::Utf8, "2");
        let keys: Vec<_> = meta.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["alpha", "zeta"]);

        meta.insert_ascii("alpha", "3");
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get("alpha").map(|v| v.value.as_str()), Some("3"));
    }

    #[test]
    fn test_connector_role_serde() {
        let role = ConnectorRole::Client {
            host: "localhost".to_string(),
            port: 18944,
        };
        let json = serde_json::to_value(&role).unwrap();
        assert_eq!(json["type"], "client");
        assert_eq!(json["port"], 18944);

        let back: ConnectorRole = serde_json::from_value(json).unwrap();
        assert_eq!(back, role);
        assert_eq!(role.to_string(), "client:localhost:18944");
    }

    #[test]
    #[allow(clippy::float_cmp)] // Values are assigned exactly, not computed
    fn test_transform_matrix_view() {
        let mut t = TransformContent::identity();
        t.values[9] = 5.0;
        t.values[11] = -2.0;
        let m = t.matrix();
        assert_eq!(m[0][3], 5.0);
        assert_eq!(m[2][3], -2.0);
        assert_eq!(m[3], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(t.translation(), [5.0, 0.0, -2.0]);
    }
}
