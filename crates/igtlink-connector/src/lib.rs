//! OpenIGTLink connector sessions.
//!
//! A connector owns one TCP connection, as server or client, and carries
//! typed device messages and XML commands over it. Everything runs inside
//! [`ConnectorSession::periodic_process`], which a driver calls on a timer;
//! nothing is spawned behind the caller's back.
//!
//! # Architecture
//!
//! - [`registry`]: device kinds that can be created, shared as `Arc<DeviceRegistry>`
//! - [`device`]: named endpoints and their latest content
//! - [`transport`]: listen/connect, read and decode frames, write bytes
//! - [`state`]: the connector state machine
//! - [`session`]: one connector: queue, devices, commands, events
//! - [`command`]: command documents and response interpretation
//! - [`hub`]: all connectors of a process, driven together
//! - [`config`]: JSON configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use igtlink_connector::{
//!     Command, ConnectorConfig, ConnectorSession, ConnectorState, DeviceRegistry,
//! };
//!
//! # async fn example() -> igtlink_connector::Result<()> {
//! let registry = Arc::new(DeviceRegistry::with_builtin_devices());
//! let mut session = ConnectorSession::new(
//!     ConnectorConfig::client("Scanner", "localhost", 18944),
//!     registry,
//! );
//! session.start().await?;
//! while session.state() == ConnectorState::Connecting {
//!     session.periodic_process().await;
//! }
//! if session.state() != ConnectorState::Connected {
//!     return Ok(());
//! }
//! let done = session.send_command_and_wait(Command::new("Get")).await?;
//! println!("{}: {}", done.name(), done.status());
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod hub;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;

pub use command::{Command, DEFAULT_COMMAND_TIMEOUT};
pub use config::{ConnectorConfig, DEFAULT_PORT, HubConfig};
pub use device::Device;
pub use error::{ConnectorError, Result};
pub use events::ConnectorEvent;
pub use hub::ConnectorHub;
pub use registry::{DeviceCreator, DeviceRegistry};
pub use session::{ConnectorSession, SessionId};
pub use state::{StateEvent, next_state};
pub use transport::{MessageTransport, TransportPoll, TransportSignal};

// Re-export commonly used types from igtlink-types
pub use igtlink_types::{
    CommandDirection, CommandStatus, ConnectorRole, ConnectorState, DeviceContent, DeviceKey,
    DeviceKind, Encoding, MetaData, StatusContent, StringContent, TransformContent,
};
