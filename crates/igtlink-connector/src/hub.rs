//! Connector hub: the set of connectors sharing one device registry.
//!
//! The hub creates sessions from configuration, propagates registry changes
//! to every connector, and is the timer target that drives all sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use igtlink_types::DeviceKey;
use tracing::{debug, info, warn};

use crate::config::{ConnectorConfig, HubConfig};
use crate::device::Device;
use crate::error::{ConnectorError, Result};
use crate::events::ConnectorEvent;
use crate::registry::DeviceRegistry;
use crate::session::{ConnectorSession, SessionId};

#[derive(Debug)]
pub struct ConnectorHub {
    registry: Arc<DeviceRegistry>,
    connectors: BTreeMap<SessionId, ConnectorSession>,
    restrict_device_names: bool,
}

impl Default for ConnectorHub {
    fn default() -> Self {
        Self::new(Arc::new(DeviceRegistry::with_builtin_devices()))
    }
}

impl ConnectorHub {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            connectors: BTreeMap::new(),
            restrict_device_names: false,
        }
    }

    /// Build a hub with one connector per configured entry.
    ///
    /// Connectors marked persistent are started immediately; a persistent
    /// connector that fails to start is logged and left `Off`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Config` if an entry fails validation.
    pub async fn from_config(config: &HubConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        let mut hub = Self::new(registry);
        for connector in &config.connectors {
            let id = hub.add_connector(connector.clone())?;
            if connector.persistent
                && let Some(session) = hub.connectors.get_mut(&id)
                && let Err(e) = session.start().await
            {
                warn!("Failed to start persistent connector {}: {e}", connector.name);
            }
        }
        Ok(hub)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Create a connector holding a copy of every registered device.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Config` if the configuration is invalid.
    pub fn add_connector(&mut self, mut config: ConnectorConfig) -> Result<SessionId> {
        config.validate()?;
        if self.restrict_device_names {
            config.restrict_device_names = true;
        }

        let mut session = ConnectorSession::new(config, Arc::clone(&self.registry));
        for device in self.registry.devices() {
            session.add_device(device);
        }
        let id = session.id().clone();
        info!("Added connector {} ({id})", session.name());
        self.connectors.insert(id.clone(), session);
        Ok(id)
    }

    /// Stop and remove a connector.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConnectorNotFound` for an unknown ID.
    pub fn remove_connector(&mut self, id: &SessionId) -> Result<()> {
        let mut session = self
            .connectors
            .remove(id)
            .ok_or_else(|| ConnectorError::ConnectorNotFound(id.to_string()))?;
        session.stop();
        info!("Removed connector {} ({id})", session.name());
        Ok(())
    }

    #[must_use]
    pub fn connector(&self, id: &SessionId) -> Option<&ConnectorSession> {
        self.connectors.get(id)
    }

    pub fn connector_mut(&mut self, id: &SessionId) -> Option<&mut ConnectorSession> {
        self.connectors.get_mut(id)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &ConnectorSession> {
        self.connectors.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Register a device with the registry and add it to every connector.
    ///
    /// Returns false when the registry already holds a device of this type.
    pub fn register_device(&mut self, device: Device) -> bool {
        if !self.registry.register_device(device.clone()) {
            return false;
        }
        for session in self.connectors.values_mut() {
            session.add_device(device.clone());
        }
        true
    }

    /// Unregister a device and remove it from every connector holding it.
    pub fn unregister_device(&mut self, key: &DeviceKey) {
        if self.registry.unregister_device(key).is_none() {
            debug!("Device {key} was not registered");
        }
        for session in self.connectors.values_mut() {
            session.remove_device(key);
        }
    }

    /// Apply the device-name restriction to every current and future connector.
    pub fn set_restrict_device_names(&mut self, restrict: bool) {
        self.restrict_device_names = restrict;
        for session in self.connectors.values_mut() {
            session.set_restrict_device_names(restrict);
        }
    }

    #[must_use]
    pub fn restrict_device_names(&self) -> bool {
        self.restrict_device_names
    }

    /// Start every connector that has a role; failures are logged.
    pub async fn start_all(&mut self) {
        for session in self.connectors.values_mut() {
            if let Err(e) = session.start().await {
                warn!("Failed to start connector {}: {e}", session.name());
            }
        }
    }

    pub fn stop_all(&mut self) {
        for session in self.connectors.values_mut() {
            session.stop();
        }
    }

    /// One cycle of every active connector.
    pub async fn periodic_process_all(&mut self) {
        for session in self.connectors.values_mut() {
            session.periodic_process().await;
        }
    }

    /// Events from every connector, tagged with the connector ID.
    pub fn drain_events(&mut self) -> Vec<(SessionId, ConnectorEvent)> {
        let mut events = Vec::new();
        for (id, session) in &mut self.connectors {
            events.extend(session.drain_events().into_iter().map(|e| (id.clone(), e)));
        }
        events
    }

    /// Current connector settings, suitable for [`HubConfig::save`].
    #[must_use]
    pub fn config(&self) -> HubConfig {
        HubConfig {
            connectors: self.connectors.values().map(|s| s.config().clone()).collect(),
        }
    }
}
