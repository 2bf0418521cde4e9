//! Connector session: one OpenIGTLink connection and everything on it.
//!
//! A session owns its transport, outgoing queue, devices and commands. All
//! work happens inside [`ConnectorSession::periodic_process`], which an
//! external driver calls repeatedly:
//!
//! 1. drive transport I/O for the current state;
//! 2. dispatch each complete inbound message to the command layer or a device;
//! 3. apply the connection signal to the state machine;
//! 4. flush the outgoing queue in FIFO order;
//! 5. expire commands past their timeout.
//!
//! Observers read [`ConnectorEvent`]s from the session's channel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use igtlink_types::{
    CommandDirection, CommandStatus, ConnectorRole, ConnectorState, DeviceContent, DeviceKey,
    DeviceKind, MetaData,
};
use igtlink_wire::{CommandBody, RawMessage, UnpackedBody, encode_frame, pack_body, unpack_body, version_for};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::backoff::reconnect_delay;
use crate::command::Command;
use crate::config::ConnectorConfig;
use crate::device::Device;
use crate::error::{ConnectorError, Result};
use crate::events::ConnectorEvent;
use crate::registry::DeviceRegistry;
use crate::state::{StateEvent, next_state};
use crate::transport::{MessageTransport, TransportSignal};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug)]
pub struct ConnectorSession {
    id: SessionId,
    config: ConnectorConfig,
    state: ConnectorState,
    registry: Arc<DeviceRegistry>,
    transport: MessageTransport,
    outgoing: VecDeque<Bytes>,
    devices: BTreeMap<DeviceKey, Device>,
    active_commands: BTreeMap<u32, Command>,
    /// Peer commands awaiting our response, by query ID, with their deadline
    pending_inbound: HashMap<u32, Instant>,
    /// Finished blocking commands, collected by `send_command_and_wait`
    completed_blocking: HashMap<u32, Command>,
    next_query_id: u32,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<ConnectorEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ConnectorEvent>>,
}

impl ConnectorSession {
    #[must_use]
    pub fn new(config: ConnectorConfig, registry: Arc<DeviceRegistry>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: SessionId::new(),
            transport: MessageTransport::new(config.check_crc),
            config,
            state: ConnectorState::Off,
            registry,
            outgoing: VecDeque::new(),
            devices: BTreeMap::new(),
            active_commands: BTreeMap::new(),
            pending_inbound: HashMap::new(),
            completed_blocking: HashMap::new(),
            next_query_id: 1,
            reconnect_attempt: 0,
            reconnect_at: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectorState {
        self.state
    }

    #[must_use]
    pub fn role(&self) -> &ConnectorRole {
        &self.config.role
    }

    /// Listen on `port` from the next `start`.
    pub fn set_type_server(&mut self, port: u16) {
        self.config.role = ConnectorRole::Server { port };
    }

    /// Connect to `host:port` from the next `start`.
    pub fn set_type_client(&mut self, host: impl Into<String>, port: u16) {
        self.config.role = ConnectorRole::Client {
            host: host.into(),
            port,
        };
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.config.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.config.persistent = persistent;
    }

    #[must_use]
    pub fn restrict_device_names(&self) -> bool {
        self.config.restrict_device_names
    }

    pub fn set_restrict_device_names(&mut self, restrict: bool) {
        self.config.restrict_device_names = restrict;
    }

    /// Listening address for servers, local stream address for clients.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    #[must_use]
    pub fn active_command_count(&self) -> usize {
        self.active_commands.len()
    }

    #[must_use]
    pub fn active_command(&self, query_id: u32) -> Option<&Command> {
        self.active_commands.get(&query_id)
    }

    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.pending_inbound.len()
    }

    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.outgoing.len()
    }

    /// Take the event receiver for use in an async consumer. Afterwards
    /// [`drain_events`](Self::drain_events) returns nothing.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectorEvent>> {
        self.events_rx.take()
    }

    /// Events queued since the last call.
    pub fn drain_events(&mut self) -> Vec<ConnectorEvent> {
        let mut events = Vec::new();
        if let Some(rx) = self.events_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        events
    }

    fn emit(&self, event: ConnectorEvent) {
        trace!(connector = %self.config.name, event = event.name(), "Event");
        // Receiver dropped means nobody is listening
        let _ = self.events_tx.send(event);
    }

    fn transition(&mut self, event: StateEvent) -> ConnectorState {
        let next = next_state(self.state, &self.config.role, self.config.persistent, event);
        if next != self.state {
            debug!(
                connector = %self.config.name,
                "State {} -> {} on {event:?}",
                self.state,
                next
            );
            self.state = next;
        }
        next
    }

    /// Start listening or connecting according to the role. A no-op when
    /// the session is already active.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::NoRole` for an unspecified role and
    /// `ConnectorError::Io` if a server cannot bind its port. The session
    /// stays `Off` on error.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.is_active() {
            return Ok(());
        }

        match self.config.role.clone() {
            ConnectorRole::Unspecified => return Err(ConnectorError::NoRole),
            ConnectorRole::Server { port } => self.transport.start_as_server(port).await?,
            ConnectorRole::Client { host, port } => self.transport.start_as_client(&host, port),
        }

        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        self.transition(StateEvent::Start);
        info!(connector = %self.config.name, role = %self.config.role, "Connector started");
        self.emit(ConnectorEvent::Activated);
        Ok(())
    }

    /// Close every socket and return to `Off`.
    ///
    /// Queued output and unanswered peer requests are discarded; active
    /// commands complete as `Cancelled`. Stopping an `Off` session does
    /// nothing.
    pub fn stop(&mut self) {
        if self.state == ConnectorState::Off {
            return;
        }
        let was_connected = self.state == ConnectorState::Connected;
        self.shut_down(was_connected);
    }

    /// Release every socket and finish the session, whatever state the
    /// state machine has already reached.
    fn shut_down(&mut self, was_connected: bool) {
        self.transport.stop();
        self.outgoing.clear();
        self.pending_inbound.clear();
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        self.transition(StateEvent::Stop);

        for (_, mut command) in std::mem::take(&mut self.active_commands) {
            command.set_status(CommandStatus::Cancelled);
            self.complete(command);
        }

        if was_connected {
            self.emit(ConnectorEvent::Disconnected);
        }
        info!(connector = %self.config.name, "Connector stopped");
        self.emit(ConnectorEvent::Deactivated);
    }

    /// Run one cooperative cycle. The only suspension point is transport
    /// I/O, bounded by the configured I/O timeout.
    pub async fn periodic_process(&mut self) {
        if self.state == ConnectorState::Off {
            return;
        }

        self.maybe_reconnect(Instant::now());

        let poll = self.transport.periodic_process(self.config.io_timeout()).await;
        if poll.dropped > 0 {
            debug!(connector = %self.config.name, dropped = poll.dropped, "Dropped corrupted messages");
        }
        for message in poll.messages {
            self.dispatch(message);
        }
        if let Some(signal) = poll.signal {
            self.handle_signal(signal);
        }

        if self.state == ConnectorState::Connected {
            self.flush();
        }
        self.sweep(Instant::now());
    }

    fn maybe_reconnect(&mut self, now: Instant) {
        if self.state != ConnectorState::Connecting
            || self.transport.is_connecting()
            || self.transport.has_stream()
        {
            return;
        }
        if self.reconnect_at.is_some_and(|at| now < at) {
            return;
        }
        if let ConnectorRole::Client { host, port } = &self.config.role {
            debug!(
                connector = %self.config.name,
                attempt = self.reconnect_attempt,
                "Reconnecting to {host}:{port}"
            );
            self.transport.start_as_client(host, *port);
            self.reconnect_at = None;
        }
    }

    fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Accepted(peer) => {
                if self.transition(StateEvent::PeerAccepted) == ConnectorState::Connected {
                    info!(connector = %self.config.name, %peer, "Client connected");
                    self.emit(ConnectorEvent::Connected);
                }
            }
            TransportSignal::Connected(peer) => {
                if self.transition(StateEvent::ConnectSucceeded) == ConnectorState::Connected {
                    self.reconnect_attempt = 0;
                    info!(connector = %self.config.name, %peer, "Connected to server");
                    self.emit(ConnectorEvent::Connected);
                }
            }
            TransportSignal::ConnectFailed(e) => {
                if self.transition(StateEvent::ConnectFailed) == ConnectorState::Off {
                    warn!(connector = %self.config.name, "Connect failed: {e}");
                    self.shut_down(false);
                } else {
                    self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                    let delay = reconnect_delay(
                        self.reconnect_attempt,
                        self.config.reconnect_base_ms,
                        self.config.reconnect_max_ms,
                    );
                    debug!(
                        connector = %self.config.name,
                        attempt = self.reconnect_attempt,
                        "Connect failed: {e}; retrying in {delay:?}"
                    );
                    self.reconnect_at = Some(Instant::now() + delay);
                }
            }
            TransportSignal::Disconnected(reason) => self.connection_lost(&reason),
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        warn!(connector = %self.config.name, "Connection lost: {reason}");
        self.transport.close_stream();
        // A partial frame must not reach the next peer
        self.outgoing.clear();
        self.pending_inbound.clear();

        let next = self.transition(StateEvent::ConnectionLost);
        self.emit(ConnectorEvent::Disconnected);

        match next {
            ConnectorState::Connecting => {
                self.reconnect_attempt = 0;
                self.reconnect_at = None;
                self.maybe_reconnect(Instant::now());
            }
            ConnectorState::Off | ConnectorState::WaitConnection | ConnectorState::Connected => {}
        }
    }

    fn flush(&mut self) {
        loop {
            let Some(front) = self.outgoing.front_mut() else {
                break;
            };
            match self.transport.try_write(front) {
                Ok(n) if n == front.len() => {
                    self.outgoing.pop_front();
                }
                Ok(n) => {
                    front.advance(n);
                    break;
                }
                Err(e) => {
                    self.connection_lost(&e.to_string());
                    break;
                }
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .active_commands
            .iter()
            .filter(|(_, command)| command.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(mut command) = self.active_commands.remove(&id) {
                warn!(
                    connector = %self.config.name,
                    query_id = id,
                    "Command {} expired after {:?}",
                    command.name(),
                    command.timeout()
                );
                command.set_status(CommandStatus::Expired);
                self.complete(command);
            }
        }

        let name = &self.config.name;
        self.pending_inbound.retain(|id, deadline| {
            let keep = now < *deadline;
            if !keep {
                debug!(connector = %name, query_id = *id, "Peer command expired without response");
            }
            keep
        });
    }

    fn complete(&mut self, command: Command) {
        if command.is_blocking()
            && let Some(id) = command.query_id()
        {
            self.completed_blocking.insert(id, command.clone());
        }
        self.emit(ConnectorEvent::CommandCompleted(command));
    }

    fn dispatch(&mut self, message: RawMessage) {
        let RawMessage { header, body } = message;
        let kind = DeviceKind::from_tag(&header.type_name);
        let unpacked = match unpack_body(header.version, body) {
            Ok(unpacked) => unpacked,
            Err(e) => {
                warn!(connector = %self.config.name, "Dropping {}:{}: {e}", header.type_name, header.device_name);
                return;
            }
        };

        match kind {
            DeviceKind::Command => self.receive_request(&header.device_name, unpacked),
            DeviceKind::CommandResponse => self.receive_response(unpacked),
            kind => self.receive_device_message(DeviceKey::new(kind, header.device_name), unpacked),
        }
    }

    fn receive_device_message(&mut self, key: DeviceKey, body: UnpackedBody) {
        if !self.devices.contains_key(&key) {
            if self.config.restrict_device_names {
                debug!(connector = %self.config.name, "Ignoring {key}: not in device list");
                return;
            }
            let Some(creator) = self.registry.creator(key.kind.type_tag()) else {
                debug!(connector = %self.config.name, "Ignoring {key}: no device type registered");
                return;
            };
            debug!(connector = %self.config.name, "New incoming device {key}");
            self.devices.insert(key.clone(), creator.create(key.name.clone()));
            self.emit(ConnectorEvent::DeviceAdded(key.clone()));
        }

        let Some(device) = self.devices.get_mut(&key) else {
            return;
        };
        if let Err(e) = device.decode(&body.content, body.metadata) {
            warn!(connector = %self.config.name, "Dropping {key}: {e}");
            return;
        }
        if device.is_visible() {
            self.emit(ConnectorEvent::DeviceModified(key));
        }
    }

    fn receive_request(&mut self, device_name: &str, body: UnpackedBody) {
        let request = match CommandBody::decode(&body.content) {
            Ok(request) => request,
            Err(e) => {
                warn!(connector = %self.config.name, "Dropping command: {e}");
                return;
            }
        };
        let query_id = request.command_id;
        let command = match Command::from_request(
            request,
            device_name,
            body.metadata,
            self.config.command_timeout(),
        ) {
            Ok(command) => command,
            Err(e) => {
                warn!(connector = %self.config.name, query_id, "Dropping command: {e}");
                return;
            }
        };

        debug!(connector = %self.config.name, query_id, "Received command {}", command.name());
        if let Some(deadline) = command.deadline() {
            self.pending_inbound.insert(query_id, deadline);
        }
        self.emit(ConnectorEvent::CommandReceived(command));
    }

    fn receive_response(&mut self, body: UnpackedBody) {
        let response = match CommandBody::decode(&body.content) {
            Ok(response) => response,
            Err(e) => {
                warn!(connector = %self.config.name, "Dropping command response: {e}");
                return;
            }
        };
        let query_id = response.command_id;
        let Some(mut command) = self.active_commands.remove(&query_id) else {
            debug!(connector = %self.config.name, query_id, "Response for unknown command dropped");
            return;
        };

        command.set_response_text(response.text);
        command.set_response_metadata(body.metadata);
        let status = if command.response_indicates_success() {
            CommandStatus::Success
        } else {
            CommandStatus::Fail
        };
        command.set_status(status);
        debug!(connector = %self.config.name, query_id, "Command {} finished: {status}", command.name());

        self.emit(ConnectorEvent::CommandResponseReceived(command.clone()));
        self.complete(command);
    }

    fn allocate_query_id(&mut self) -> u32 {
        loop {
            let id = self.next_query_id;
            self.next_query_id = self.next_query_id.checked_add(1).unwrap_or(1);
            if !self.active_commands.contains_key(&id) {
                return id;
            }
        }
    }

    fn build_frame(
        type_tag: &str,
        device_name: &str,
        content: &[u8],
        metadata: &MetaData,
        message_id: u32,
    ) -> Result<Bytes> {
        let version = version_for(metadata);
        let body = pack_body(version, content, metadata, message_id)?;
        Ok(encode_frame(RawMessage::new(type_tag, device_name, body).with_version(version))?)
    }

    /// Queue a command and track it until it completes.
    ///
    /// Returns the query ID, allocated when the command has none. The
    /// outcome arrives later as `CommandCompleted`. This never blocks; use
    /// [`send_command_and_wait`](Self::send_command_and_wait) for that.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless connected, `InvalidCommand` for a peer
    /// command, `DuplicateQueryId` if the ID is already active, or an
    /// encoding error.
    pub fn send_command(&mut self, mut command: Command) -> Result<u32> {
        command.set_blocking(false);
        self.queue_command(command)
    }

    fn queue_command(&mut self, mut command: Command) -> Result<u32> {
        if self.state != ConnectorState::Connected {
            return Err(ConnectorError::NotConnected);
        }
        if command.direction() == CommandDirection::In {
            return Err(ConnectorError::InvalidCommand(
                "peer commands are answered with send_command_response".into(),
            ));
        }

        let query_id = match command.query_id() {
            Some(id) if self.active_commands.contains_key(&id) => {
                return Err(ConnectorError::DuplicateQueryId(id));
            }
            Some(id) => id,
            None => self.allocate_query_id(),
        };
        command.set_query_id(query_id);

        let body = CommandBody::new(query_id, command.name(), command.command_text()).encode()?;
        let frame = Self::build_frame(
            DeviceKind::Command.type_tag(),
            command.device_id(),
            &body,
            command.metadata(),
            query_id,
        )?;

        command.mark_sent(Instant::now());
        debug!(connector = %self.config.name, query_id, "Sending command {}", command.name());
        self.outgoing.push_back(frame);
        self.active_commands.insert(query_id, command);
        Ok(query_id)
    }

    /// Send a command and keep servicing the session until it completes.
    ///
    /// Nothing is spawned: this loops over `periodic_process`, so the
    /// caller's task does the I/O. Returns the command in its terminal state
    /// (`Success`, `Fail`, `Expired` or `Cancelled`).
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn send_command_and_wait(&mut self, mut command: Command) -> Result<Command> {
        command.set_blocking(true);
        let query_id = self.queue_command(command)?;
        let mut wait = BlockingWait {
            session: self,
            query_id,
        };
        loop {
            if let Some(done) = wait.session.completed_blocking.remove(&query_id) {
                return Ok(done);
            }
            if wait.session.state == ConnectorState::Off {
                return Err(ConnectorError::NotConnected);
            }
            wait.session.periodic_process().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Answer a command received from the peer.
    ///
    /// The response text and response metadata of `command` are sent as an
    /// RTS_COMMAND with the same query ID and name.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless connected, `InvalidCommand` for a
    /// command we sent ourselves, `UnknownCommand` if no such request is
    /// pending, `CommandExpired` once its timeout has passed.
    pub fn send_command_response(&mut self, command: &Command) -> Result<()> {
        if self.state != ConnectorState::Connected {
            return Err(ConnectorError::NotConnected);
        }
        if command.direction() != CommandDirection::In {
            return Err(ConnectorError::InvalidCommand(
                "only peer commands can be answered".into(),
            ));
        }
        let Some(query_id) = command.query_id() else {
            return Err(ConnectorError::InvalidCommand("command has no query ID".into()));
        };
        let Some(deadline) = self.pending_inbound.get(&query_id).copied() else {
            return Err(ConnectorError::UnknownCommand(query_id));
        };
        if Instant::now() >= deadline {
            self.pending_inbound.remove(&query_id);
            return Err(ConnectorError::CommandExpired(query_id));
        }

        let body = CommandBody::new(query_id, command.name(), command.response_text()).encode()?;
        let frame = Self::build_frame(
            DeviceKind::CommandResponse.type_tag(),
            command.device_id(),
            &body,
            command.response_metadata(),
            query_id,
        )?;

        debug!(connector = %self.config.name, query_id, "Responding to command {}", command.name());
        self.pending_inbound.remove(&query_id);
        self.outgoing.push_back(frame);
        Ok(())
    }

    /// Add a device. Returns false if one with the same type and name exists.
    pub fn add_device(&mut self, device: Device) -> bool {
        let key = device.key().clone();
        if self.devices.contains_key(&key) {
            return false;
        }
        debug!(connector = %self.config.name, "Added device {key}");
        self.devices.insert(key.clone(), device);
        self.emit(ConnectorEvent::DeviceAdded(key));
        true
    }

    pub fn remove_device(&mut self, key: &DeviceKey) -> Option<Device> {
        let removed = self.devices.remove(key);
        if removed.is_some() {
            debug!(connector = %self.config.name, "Removed device {key}");
        }
        removed
    }

    #[must_use]
    pub fn device(&self, key: &DeviceKey) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// # Errors
    ///
    /// Returns `DeviceNotFound` for an unknown key or `ContentMismatch` when
    /// the content belongs to another kind.
    pub fn set_device_content(&mut self, key: &DeviceKey, content: DeviceContent) -> Result<()> {
        let device = self
            .devices
            .get_mut(key)
            .ok_or_else(|| ConnectorError::DeviceNotFound(key.to_string()))?;
        device.set_content(content)?;
        if device.is_visible() {
            self.emit(ConnectorEvent::DeviceModified(key.clone()));
        }
        Ok(())
    }

    /// Hidden devices still receive content but emit no `DeviceModified`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for an unknown key.
    pub fn set_device_visibility(&mut self, key: &DeviceKey, visible: bool) -> Result<()> {
        let device = self
            .devices
            .get_mut(key)
            .ok_or_else(|| ConnectorError::DeviceNotFound(key.to_string()))?;
        device.set_visible(visible);
        Ok(())
    }

    /// Queue the device's current content for the peer.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless connected, `DeviceNotFound` for an
    /// unknown key, `NoContent` if nothing was set, or an encoding error.
    pub fn push_device(&mut self, key: &DeviceKey) -> Result<()> {
        if self.state != ConnectorState::Connected {
            return Err(ConnectorError::NotConnected);
        }
        let device = self
            .devices
            .get_mut(key)
            .ok_or_else(|| ConnectorError::DeviceNotFound(key.to_string()))?;
        let content = device.encode()?;
        let frame = Self::build_frame(key.kind.type_tag(), &key.name, &content, device.metadata(), 0)?;
        device.mark_outgoing();
        trace!(connector = %self.config.name, "Pushing {key}");
        self.outgoing.push_back(frame);
        Ok(())
    }
}

/// Clears the collected result when a blocking wait ends, including when its
/// future is dropped before the command completes.
struct BlockingWait<'a> {
    session: &'a mut ConnectorSession,
    query_id: u32,
}

impl Drop for BlockingWait<'_> {
    fn drop(&mut self) {
        self.session.completed_blocking.remove(&self.query_id);
        if let Some(command) = self.session.active_commands.get_mut(&self.query_id) {
            command.set_blocking(false);
        }
    }
}

impl Drop for ConnectorSession {
    fn drop(&mut self) {
        if self.state.is_active() {
            debug!(connector = %self.config.name, "Dropping active connector");
            self.transport.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use igtlink_types::TransformContent;

    fn session(config: ConnectorConfig) -> ConnectorSession {
        ConnectorSession::new(config, Arc::new(DeviceRegistry::with_builtin_devices()))
    }

    fn inbound(body: &[u8]) -> UnpackedBody {
        UnpackedBody {
            content: Bytes::copy_from_slice(body),
            ..UnpackedBody::default()
        }
    }

    #[test]
    fn test_session_id_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_new_session_is_off() {
        let session = session(ConnectorConfig::default());
        assert_eq!(session.state(), ConnectorState::Off);
        assert_eq!(session.active_command_count(), 0);
        assert!(session.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_without_role() {
        let mut session = session(ConnectorConfig::default());
        assert!(matches!(session.start().await, Err(ConnectorError::NoRole)));
        assert_eq!(session.state(), ConnectorState::Off);
        assert!(session.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_server_start_and_idempotent_stop() {
        let mut session = session(ConnectorConfig::server("Tracker", 0));
        session.start().await.unwrap();
        assert_eq!(session.state(), ConnectorState::WaitConnection);
        assert!(session.local_addr().is_some());

        session.stop();
        assert_eq!(session.state(), ConnectorState::Off);
        assert!(session.local_addr().is_none());
        session.stop();

        let events = session.drain_events();
        assert_eq!(events, [ConnectorEvent::Activated, ConnectorEvent::Deactivated]);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let mut session = session(ConnectorConfig::server("Tracker", 0));
        session.start().await.unwrap();
        let addr = session.local_addr();
        session.start().await.unwrap();
        assert_eq!(session.local_addr(), addr);
        assert_eq!(session.drain_events().len(), 1);
    }

    #[test]
    fn test_send_requires_connection() {
        let mut session = session(ConnectorConfig::client("Scanner", "localhost", 1));
        let err = session.send_command(Command::new("Get")).unwrap_err();
        assert!(matches!(err, ConnectorError::NotConnected));
        assert!(matches!(
            session.push_device(&DeviceKey::new(DeviceKind::Status, "S")),
            Err(ConnectorError::NotConnected)
        ));
    }

    #[test]
    fn test_query_id_allocation_skips_active() {
        let mut session = session(ConnectorConfig::default());
        session.active_commands.insert(2, Command::new("Busy"));
        assert_eq!(session.allocate_query_id(), 1);
        assert_eq!(session.allocate_query_id(), 3);

        session.next_query_id = u32::MAX;
        assert_eq!(session.allocate_query_id(), u32::MAX);
        assert_eq!(session.allocate_query_id(), 1);
    }

    #[test]
    fn test_device_uniqueness() {
        let mut session = session(ConnectorConfig::default());
        assert!(session.add_device(Device::new(DeviceKind::Transform, "Probe")));
        assert!(!session.add_device(Device::new(DeviceKind::Transform, "Probe")));
        assert!(session.add_device(Device::new(DeviceKind::Status, "Probe")));
        assert_eq!(session.devices().count(), 2);

        let key = DeviceKey::new(DeviceKind::Transform, "Probe");
        assert!(session.remove_device(&key).is_some());
        assert!(session.remove_device(&key).is_none());
    }

    #[test]
    fn test_unrestricted_creates_devices() {
        let mut session = session(ConnectorConfig::default());
        let key = DeviceKey::new(DeviceKind::Transform, "Probe");
        let body = igtlink_wire::encode_content(&DeviceContent::Transform(TransformContent::identity())).unwrap();

        session.receive_device_message(key.clone(), inbound(&body));
        assert!(session.device(&key).unwrap().is_incoming());
        assert_eq!(
            session.drain_events(),
            [ConnectorEvent::DeviceAdded(key.clone()), ConnectorEvent::DeviceModified(key)]
        );
    }

    #[test]
    fn test_restricted_ignores_unknown_devices() {
        let mut config = ConnectorConfig::default();
        config.restrict_device_names = true;
        let mut session = session(config);
        let known = DeviceKey::new(DeviceKind::String, "Log");
        session.add_device(Device::new(DeviceKind::String, "Log"));
        session.drain_events();

        session.receive_device_message(DeviceKey::new(DeviceKind::String, "Other"), inbound(b"\x00\x03\x00\x01x"));
        session.receive_device_message(known.clone(), inbound(b"\x00\x03\x00\x01y"));

        assert_eq!(session.devices().count(), 1);
        assert_eq!(session.drain_events(), [ConnectorEvent::DeviceModified(known)]);
    }

    #[test]
    fn test_unknown_type_without_creator_dropped() {
        let mut session = session(ConnectorConfig::default());
        session.receive_device_message(
            DeviceKey::new(DeviceKind::Other("POLYDATA".into()), "Mesh"),
            inbound(b"\x01"),
        );
        assert_eq!(session.devices().count(), 0);
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_hidden_device_emits_no_modified() {
        let mut session = session(ConnectorConfig::default());
        let key = DeviceKey::new(DeviceKind::String, "Log");
        session.add_device(Device::new(DeviceKind::String, "Log"));
        session.set_device_visibility(&key, false).unwrap();
        session.drain_events();

        session.receive_device_message(key.clone(), inbound(b"\x00\x03\x00\x01y"));
        assert!(session.drain_events().is_empty());
        assert!(session.device(&key).unwrap().content().is_some());
    }

    #[test]
    fn test_set_device_content_unknown_device() {
        let mut session = session(ConnectorConfig::default());
        let err = session
            .set_device_content(
                &DeviceKey::new(DeviceKind::Transform, "Missing"),
                DeviceContent::Transform(TransformContent::identity()),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectorError::DeviceNotFound(_)));
    }

    #[test]
    fn test_unmatched_response_dropped() {
        let mut session = session(ConnectorConfig::default());
        let body = CommandBody::new(99, "Get", "<Command/>").encode().unwrap();
        session.receive_response(inbound(&body));
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_response_completes_active_command() {
        let mut session = session(ConnectorConfig::default());
        let mut command = Command::new("Get");
        command.set_query_id(5);
        command.mark_sent(Instant::now());
        session.active_commands.insert(5, command);

        let body = CommandBody::new(5, "Get", "<Command><Result Success=\"true\"/></Command>")
            .encode()
            .unwrap();
        session.receive_response(inbound(&body));

        assert_eq!(session.active_command_count(), 0);
        let events = session.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ConnectorEvent::CommandResponseReceived(_)));
        assert_eq!(events[1].completed_status(), Some(CommandStatus::Success));
    }

    fn connected(config: ConnectorConfig) -> ConnectorSession {
        let mut session = session(config);
        session.state = ConnectorState::Connected;
        session
    }

    fn answer(session: &mut ConnectorSession, query_id: u32) {
        let body = CommandBody::new(query_id, "Get", "<Command><Result Success=\"true\"/></Command>")
            .encode()
            .unwrap();
        session.receive_response(inbound(&body));
    }

    #[test]
    fn test_send_command_never_collects_result() {
        let mut session = connected(ConnectorConfig::default());
        for _ in 0..100 {
            let mut command = Command::new("Get");
            command.set_blocking(true);
            let query_id = session.send_command(command).unwrap();
            assert!(!session.active_command(query_id).unwrap().is_blocking());

            answer(&mut session, query_id);
            let events = session.drain_events();
            assert_eq!(events[1].completed_status(), Some(CommandStatus::Success));
        }
        assert_eq!(session.active_command_count(), 0);
        assert!(session.completed_blocking.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_wait_leaves_no_result() {
        // No socket: the first flush fails and the server falls back to waiting
        let mut session = connected(ConnectorConfig::server("Scanner", 0));
        let wait = session.send_command_and_wait(Command::new("Get"));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), wait)
                .await
                .is_err()
        );

        let query_id = session.active_commands.keys().next().copied().unwrap();
        assert!(!session.active_command(query_id).unwrap().is_blocking());

        answer(&mut session, query_id);
        assert_eq!(session.active_command_count(), 0);
        assert!(session.completed_blocking.is_empty());
    }

    #[test]
    fn test_non_persistent_connect_failure_shuts_down() {
        let mut session = session(ConnectorConfig::client("Scanner", "127.0.0.1", 1));
        session.state = ConnectorState::Connecting;
        session.handle_signal(TransportSignal::ConnectFailed(std::io::ErrorKind::ConnectionRefused.into()));

        assert_eq!(session.state(), ConnectorState::Off);
        assert_eq!(session.drain_events(), [ConnectorEvent::Deactivated]);
    }

    #[test]
    fn test_persistent_connect_failure_backs_off() {
        let mut config = ConnectorConfig::client("Scanner", "127.0.0.1", 1).with_persistent(true);
        config.reconnect_base_ms = 50;
        let mut session = session(config);
        session.state = ConnectorState::Connecting;
        session.handle_signal(TransportSignal::ConnectFailed(std::io::ErrorKind::ConnectionRefused.into()));

        assert_eq!(session.state(), ConnectorState::Connecting);
        assert_eq!(session.reconnect_attempt, 1);
        assert!(session.reconnect_at.is_some());
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_sweep_expires_commands() {
        let mut session = session(ConnectorConfig::default());
        let mut command = Command::new("Get").with_timeout(Duration::from_millis(10));
        command.set_query_id(1);
        let sent = Instant::now();
        command.mark_sent(sent);
        session.active_commands.insert(1, command);
        session.pending_inbound.insert(7, sent + Duration::from_millis(10));

        session.sweep(sent + Duration::from_millis(5));
        assert_eq!(session.active_command_count(), 1);
        assert_eq!(session.pending_request_count(), 1);

        session.sweep(sent + Duration::from_millis(10));
        assert_eq!(session.active_command_count(), 0);
        assert_eq!(session.pending_request_count(), 0);
        let events = session.drain_events();
        assert_eq!(events[0].completed_status(), Some(CommandStatus::Expired));
    }

    #[test]
    fn test_inbound_request_tracked() {
        let mut session = session(ConnectorConfig::default());
        let body = CommandBody::new(3, "Get", "<Command Name=\"Get\"/>").encode().unwrap();
        session.receive_request("Scanner", inbound(&body));
        assert_eq!(session.pending_request_count(), 1);

        let events = session.drain_events();
        let ConnectorEvent::CommandReceived(command) = &events[0] else {
            panic!("expected CommandReceived, got {events:?}");
        };
        assert_eq!(command.query_id(), Some(3));
        assert_eq!(command.device_id(), "Scanner");
    }

    #[test]
    fn test_inbound_request_invalid_xml_dropped() {
        let mut session = session(ConnectorConfig::default());
        let body = CommandBody::new(3, "Get", "garbage").encode().unwrap();
        session.receive_request("Scanner", inbound(&body));
        assert_eq!(session.pending_request_count(), 0);
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_response_requires_connection() {
        let mut session = session(ConnectorConfig::default());
        let body = CommandBody::new(3, "Get", "<Command/>");
        let command = Command::from_request(body, "", MetaData::new(), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            session.send_command_response(&command),
            Err(ConnectorError::NotConnected)
        ));
    }

    #[test]
    fn test_stop_when_off_emits_nothing() {
        let mut session = session(ConnectorConfig::default());
        session.stop();
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_take_event_receiver() {
        let mut session = session(ConnectorConfig::default());
        let mut rx = session.take_event_receiver().unwrap();
        session.add_device(Device::new(DeviceKind::Status, "S"));
        assert!(session.drain_events().is_empty());
        assert!(matches!(rx.try_recv(), Ok(ConnectorEvent::DeviceAdded(_))));
    }
}
