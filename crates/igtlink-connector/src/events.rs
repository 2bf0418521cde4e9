//! Notifications emitted by a connector session.

use igtlink_types::{CommandStatus, DeviceKey};

use crate::command::Command;

/// Everything a collaborator can observe about a session.
///
/// Events are queued on the session's channel during `start`, `stop` and
/// `periodic_process`, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// `start()` succeeded
    Activated,
    /// `stop()` completed, or a failed non-persistent connect shut the session down
    Deactivated,
    Connected,
    Disconnected,
    /// A device was added to the connector
    DeviceAdded(DeviceKey),
    /// A visible device received new content
    DeviceModified(DeviceKey),
    /// Peer sent a command; answer with `send_command_response`
    CommandReceived(Command),
    /// Peer answered one of our commands
    CommandResponseReceived(Command),
    /// One of our commands reached a terminal status
    CommandCompleted(Command),
}

impl ConnectorEvent {
    /// Short event name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ConnectorEvent::Activated => "activated",
            ConnectorEvent::Deactivated => "deactivated",
            ConnectorEvent::Connected => "connected",
            ConnectorEvent::Disconnected => "disconnected",
            ConnectorEvent::DeviceAdded(_) => "device_added",
            ConnectorEvent::DeviceModified(_) => "device_modified",
            ConnectorEvent::CommandReceived(_) => "command_received",
            ConnectorEvent::CommandResponseReceived(_) => "command_response_received",
            ConnectorEvent::CommandCompleted(_) => "command_completed",
        }
    }

    /// Terminal status carried by a `CommandCompleted` event.
    #[must_use]
    pub fn completed_status(&self) -> Option<CommandStatus> {
        match self {
            ConnectorEvent::CommandCompleted(command) => Some(command.status()),
            _ => None,
        }
    }
}
