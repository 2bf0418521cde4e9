//! Device registry shared by every connector.
//!
//! The registry knows which device kinds can be created (one creator per
//! type tag) and holds the device prototypes registered with the hub. It is
//! constructed once and shared as `Arc<DeviceRegistry>`; all methods take
//! `&self` and serialize through an internal lock.

use igtlink_types::{DeviceKey, DeviceKind};
use parking_lot::RwLock;
use tracing::debug;

use crate::device::Device;

/// Factory for devices of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCreator {
    kind: DeviceKind,
}

impl DeviceCreator {
    #[must_use]
    pub fn new(kind: DeviceKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    #[must_use]
    pub fn type_tag(&self) -> &str {
        self.kind.type_tag()
    }

    #[must_use]
    pub fn create(&self, name: impl Into<String>) -> Device {
        Device::new(self.kind.clone(), name)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    creators: Vec<DeviceCreator>,
    devices: Vec<Device>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    /// An empty registry with no creators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with creators for STATUS, TRANSFORM, STRING, IMAGE,
    /// COMMAND and RTS_COMMAND.
    #[must_use]
    pub fn with_builtin_devices() -> Self {
        let registry = Self::new();
        for kind in DeviceKind::BUILTIN {
            registry.register_creator(DeviceCreator::new(kind));
        }
        registry
    }

    /// Add a creator. Returns false if one exists for the same type tag.
    pub fn register_creator(&self, creator: DeviceCreator) -> bool {
        let mut inner = self.inner.write();
        if inner
            .creators
            .iter()
            .any(|c| c.type_tag() == creator.type_tag())
        {
            return false;
        }
        debug!("Registering device creator: {}", creator.type_tag());
        inner.creators.push(creator);
        true
    }

    /// Type tags with a creator, in registration order.
    #[must_use]
    pub fn available_device_types(&self) -> Vec<String> {
        self.inner
            .read()
            .creators
            .iter()
            .map(|c| c.type_tag().to_string())
            .collect()
    }

    #[must_use]
    pub fn creator(&self, type_tag: &str) -> Option<DeviceCreator> {
        self.inner
            .read()
            .creators
            .iter()
            .find(|c| c.type_tag() == type_tag)
            .cloned()
    }

    /// Register a device prototype.
    ///
    /// Returns false if the type tag is empty or a device of the same type
    /// is already registered.
    pub fn register_device(&self, device: Device) -> bool {
        if device.kind().type_tag().is_empty() {
            return false;
        }
        let mut inner = self.inner.write();
        if inner.devices.iter().any(|d| d.kind() == device.kind()) {
            debug!("Device type already registered: {}", device.kind());
            return false;
        }
        debug!("Registering device: {}", device.key());
        inner.devices.push(device);
        true
    }

    /// Remove a registered device. Returns the removed device, if any.
    pub fn unregister_device(&self, key: &DeviceKey) -> Option<Device> {
        let mut inner = self.inner.write();
        let index = inner.devices.iter().position(|d| d.key() == key)?;
        debug!("Unregistering device: {key}");
        Some(inner.devices.remove(index))
    }

    /// Snapshot of the registered devices.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.inner.read().devices.clone()
    }
}
