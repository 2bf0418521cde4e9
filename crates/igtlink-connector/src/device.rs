//! Devices: the named endpoints messages are addressed to.

use std::time::Instant;

use bytes::Bytes;
use igtlink_types::{DeviceContent, DeviceKey, DeviceKind, MetaData};
use igtlink_wire::{decode_content, encode_content};

use crate::error::{ConnectorError, Result};

/// A typed, named device and its latest content.
///
/// An empty name marks a prototype standing for every device of its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    key: DeviceKey,
    visible: bool,
    incoming: bool,
    outgoing: bool,
    content: Option<DeviceContent>,
    metadata: MetaData,
    modified_at: Option<Instant>,
}

impl Device {
    #[must_use]
    pub fn new(kind: DeviceKind, name: impl Into<String>) -> Self {
        Self {
            key: DeviceKey::new(kind, name),
            visible: true,
            incoming: false,
            outgoing: false,
            content: None,
            metadata: MetaData::new(),
            modified_at: None,
        }
    }

    /// Create a device holding `content`, typed after it.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ContentMismatch` for raw content, which has no
    /// fixed kind; use [`Device::new`] with an explicit kind instead.
    pub fn with_content(name: impl Into<String>, content: DeviceContent) -> Result<Self> {
        let Some(kind) = content.kind() else {
            return Err(ConnectorError::ContentMismatch {
                device: "untyped device".to_string(),
                content: "raw bytes".to_string(),
            });
        };
        let mut device = Self::new(kind, name);
        device.set_content(content)?;
        Ok(device)
    }

    #[must_use]
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    #[must_use]
    pub fn kind(&self) -> &DeviceKind {
        &self.key.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.key.name
    }

    #[must_use]
    pub fn is_prototype(&self) -> bool {
        self.key.name.is_empty()
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Received at least one message from the peer.
    #[must_use]
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Pushed to the peer at least once.
    #[must_use]
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub(crate) fn mark_outgoing(&mut self) {
        self.outgoing = true;
    }

    #[must_use]
    pub fn content(&self) -> Option<&DeviceContent> {
        self.content.as_ref()
    }

    #[must_use]
    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetaData {
        &mut self.metadata
    }

    #[must_use]
    pub fn modified_at(&self) -> Option<Instant> {
        self.modified_at
    }

    /// Replace the content. Raw content fits every kind.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ContentMismatch` when the content belongs to
    /// another kind.
    pub fn set_content(&mut self, content: DeviceContent) -> Result<()> {
        if let Some(kind) = content.kind()
            && kind != self.key.kind
        {
            return Err(ConnectorError::ContentMismatch {
                device: self.key.to_string(),
                content: kind.to_string(),
            });
        }
        self.content = Some(content);
        self.modified_at = Some(Instant::now());
        Ok(())
    }

    /// Store a received body.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Wire` if the body does not decode as this
    /// device's kind; the previous content is kept.
    pub fn decode(&mut self, body: &[u8], metadata: MetaData) -> Result<()> {
        let content = decode_content(&self.key.kind, body)?;
        self.content = Some(content);
        self.metadata = metadata;
        self.incoming = true;
        self.modified_at = Some(Instant::now());
        Ok(())
    }

    /// Encode the current content as a message body.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::NoContent` before any content is set, or a
    /// wire error if a field does not fit.
    pub fn encode(&self) -> Result<Bytes> {
        let Some(content) = &self.content else {
            return Err(ConnectorError::NoContent(self.key.to_string()));
        };
        Ok(encode_content(content)?)
    }
}
