//! Commands: XML requests sent to or received from a peer.
//!
//! A command carries a request document rooted at `<Command>`, and once the
//! peer answers, the response document. The session owns the lifecycle; this
//! type only holds the data and interprets responses.

use std::time::{Duration, Instant};

use igtlink_types::{CommandDirection, CommandStatus, Encoding, MetaData, MetaDataValue};
use igtlink_wire::{CommandBody, XmlElement};
use tracing::warn;

use crate::error::{ConnectorError, Result};

/// Timeout applied when none is set explicitly
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const ROOT_ELEMENT: &str = "Command";

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    query_id: Option<u32>,
    device_id: String,
    name: String,
    direction: CommandDirection,
    document: XmlElement,
    response_text: String,
    response: Option<XmlElement>,
    timeout: Duration,
    created_at: Instant,
    sent_at: Option<Instant>,
    status: CommandStatus,
    blocking: bool,
    metadata: MetaData,
    response_metadata: MetaData,
}

impl Command {
    /// A new outgoing command. The request document starts as
    /// `<Command Name="{name}"/>`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            query_id: None,
            device_id: String::new(),
            document: XmlElement::new(ROOT_ELEMENT).with_attribute("Name", name.clone()),
            name,
            direction: CommandDirection::Out,
            response_text: String::new(),
            response: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            created_at: Instant::now(),
            sent_at: None,
            status: CommandStatus::Unknown,
            blocking: false,
            metadata: MetaData::new(),
            response_metadata: MetaData::new(),
        }
    }

    /// Build an inbound command from a received COMMAND body.
    pub(crate) fn from_request(
        body: CommandBody,
        device_id: &str,
        metadata: MetaData,
        timeout: Duration,
    ) -> Result<Self> {
        let mut command = Self::new(body.name);
        command.set_command_text(&body.text)?;
        command.query_id = Some(body.command_id);
        command.device_id = device_id.to_string();
        command.direction = CommandDirection::In;
        command.metadata = metadata;
        command.timeout = timeout;
        command.status = CommandStatus::Waiting;
        command.sent_at = Some(Instant::now());
        Ok(command)
    }

    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_parameter(name, value);
        self
    }

    /// Append `<Parameter Name=.. Value=../>` to the request document.
    pub fn add_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.document.add_child(
            XmlElement::new("Parameter")
                .with_attribute("Name", name)
                .with_attribute("Value", value),
        );
    }

    /// Query ID, assigned by the session on send when unset.
    #[must_use]
    pub fn query_id(&self) -> Option<u32> {
        self.query_id
    }

    pub fn set_query_id(&mut self, id: u32) {
        self.query_id = Some(id);
    }

    /// Name of the device the command is addressed to.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.device_id = device_id.into();
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub fn direction(&self) -> CommandDirection {
        self.direction
    }

    #[must_use]
    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: CommandStatus) {
        self.status = status;
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Set only by `send_command_and_wait`, which collects the result.
    pub(crate) fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
        self.status = CommandStatus::Waiting;
    }

    /// Instant after which a waiting command expires.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.sent_at.map(|sent| sent + self.timeout)
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Request document as text.
    #[must_use]
    pub fn command_text(&self) -> String {
        self.document.to_string()
    }

    #[must_use]
    pub fn command_element(&self) -> &XmlElement {
        &self.document
    }

    /// Replace the request document.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidCommand` for empty text and
    /// `ConnectorError::Wire` for text that is not XML. The previous
    /// document is kept on error.
    pub fn set_command_text(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(ConnectorError::InvalidCommand("empty command text".into()));
        }
        self.document = XmlElement::parse(text)?;
        Ok(())
    }

    #[must_use]
    pub fn command_attribute(&self, name: &str) -> Option<&str> {
        self.document.attribute(name)
    }

    pub fn set_command_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.document.set_attribute(name, value);
    }

    #[must_use]
    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    /// Store the response text and parse it.
    ///
    /// Empty or non-XML text marks the command `Fail`; otherwise the status
    /// is left alone.
    pub fn set_response_text(&mut self, text: impl Into<String>) {
        self.response_text = text.into();
        self.response = None;

        if self.response_text.trim().is_empty() {
            self.status = CommandStatus::Fail;
            return;
        }

        match XmlElement::parse(&self.response_text) {
            Ok(element) => self.response = Some(element),
            Err(e) => {
                warn!("Command response is not XML: {e}");
                self.status = CommandStatus::Fail;
            }
        }
    }

    #[must_use]
    pub fn response_element(&self) -> Option<&XmlElement> {
        self.response.as_ref()
    }

    #[must_use]
    pub fn response_attribute(&self, name: &str) -> Option<&str> {
        self.response.as_ref()?.attribute(name)
    }

    /// Number of elements nested in the response root.
    #[must_use]
    pub fn number_of_responses(&self) -> usize {
        self.response.as_ref().map_or(0, |r| r.children.len())
    }

    /// Message of response `index`.
    ///
    /// Index 0 prefers a `Message` attribute on the root. Otherwise the
    /// nested element at `index` is used: its text, or failing that its
    /// `Message` attribute.
    #[must_use]
    pub fn response_message(&self, index: usize) -> Option<&str> {
        let response = self.response.as_ref()?;
        if index == 0
            && let Some(message) = response.attribute("Message").filter(|m| !m.is_empty())
        {
            return Some(message);
        }

        let nested = response.children.get(index)?;
        if !nested.text.is_empty() {
            return Some(nested.text.as_str());
        }
        nested.attribute("Message")
    }

    /// Whether the parsed response reports success.
    ///
    /// Accepted forms, attribute names compared without case:
    /// `<Command Status="SUCCESS">`, `<Command Success="true">`,
    /// `<Command><Result Success="true"/></Command>`,
    /// `<Command><Result>true</Result></Command>`.
    #[must_use]
    pub fn response_indicates_success(&self) -> bool {
        let Some(root) = &self.response else {
            return false;
        };

        for attribute in ["Status", "Success"] {
            if let Some(value) = root.attribute_ignore_case(attribute) {
                return is_truthy(value);
            }
        }

        let Some(result) = root
            .children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case("Result") || c.name.eq_ignore_ascii_case("Response"))
        else {
            return false;
        };

        match result.attribute_ignore_case("Success") {
            Some(value) => is_truthy(value),
            None => is_truthy(&result.text),
        }
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.status == CommandStatus::Waiting
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// Failed, expired and cancelled commands count as failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::Fail | CommandStatus::Expired | CommandStatus::Cancelled
        )
    }

    #[must_use]
    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    #[must_use]
    pub fn metadata_element(&self, key: &str) -> Option<&MetaDataValue> {
        self.metadata.get(key)
    }

    /// Attach a request metadata entry. Commands with metadata are sent
    /// with header version 2.
    pub fn set_metadata_element(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        encoding: Encoding,
    ) {
        self.metadata.insert(key, encoding, value);
    }

    pub fn remove_metadata_element(&mut self, key: &str) -> Option<MetaDataValue> {
        self.metadata.remove(key)
    }

    pub fn clear_metadata(&mut self) {
        self.metadata.clear();
    }

    #[must_use]
    pub fn response_metadata(&self) -> &MetaData {
        &self.response_metadata
    }

    #[must_use]
    pub fn response_metadata_element(&self, key: &str) -> Option<&MetaDataValue> {
        self.response_metadata.get(key)
    }

    /// Attach a response metadata entry. Responses with metadata are sent
    /// with header version 2.
    pub fn set_response_metadata_element(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        encoding: Encoding,
    ) {
        self.response_metadata.insert(key, encoding, value);
    }

    pub fn remove_response_metadata_element(&mut self, key: &str) -> Option<MetaDataValue> {
        self.response_metadata.remove(key)
    }

    pub fn clear_response_metadata(&mut self) {
        self.response_metadata.clear();
    }

    pub(crate) fn set_response_metadata(&mut self, metadata: MetaData) {
        self.response_metadata = metadata;
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("success") || value == "1"
}
