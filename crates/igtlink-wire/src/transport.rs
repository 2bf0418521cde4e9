//! OpenIGTLink transport codec.
//!
//! This module provides a codec that frames OpenIGTLink messages over stream
//! sockets: a fixed 58-byte header announcing the body size, then the body.
//!
//! Frame format:
//! ```text
//! +----------------------+------------------+
//! |  58 bytes            |  N bytes         |
//! |  (header, N, CRC-64) |  (body)          |
//! +----------------------+------------------+
//! ```
//!
//! Partial frames stay buffered until the whole body has arrived. A frame
//! whose body fails the CRC check is consumed before the error is returned,
//! so decoding can resume with the next frame.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::WireError;
use crate::header::{HEADER_SIZE, HEADER_VERSION_1, MessageHeader, crc64};

/// Maximum body size (256 MB)
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// A complete framed message: header plus raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl RawMessage {
    #[must_use]
    pub fn new(type_name: impl Into<String>, device_name: impl Into<String>, body: Bytes) -> Self {
        Self {
            header: MessageHeader::new(type_name, device_name),
            body,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u16) -> Self {
        self.header.version = version;
        self
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.header.type_name
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.header.device_name
    }
}

/// Codec for OpenIGTLink frames
#[derive(Debug)]
pub struct IgtlCodec {
    current_header: Option<MessageHeader>,
    check_crc: bool,
}

impl IgtlCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_header: None,
            check_crc: true,
        }
    }

    /// Accept frames without verifying the body CRC.
    #[must_use]
    pub fn without_crc_check() -> Self {
        Self {
            current_header: None,
            check_crc: false,
        }
    }
}

impl Default for IgtlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IgtlCodec {
    type Item = RawMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_header.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = MessageHeader::decode(&src[..HEADER_SIZE])?;
            src.advance(HEADER_SIZE);

            let size = usize::try_from(header.body_size).unwrap_or(usize::MAX);
            if size > MAX_BODY_SIZE {
                return Err(CodecError::MessageTooLarge(size));
            }

            self.current_header = Some(header);
        }

        let Some(header) = self.current_header.as_ref() else {
            return Ok(None);
        };

        // Bounded by MAX_BODY_SIZE above
        #[allow(clippy::cast_possible_truncation)]
        let length = header.body_size as usize;

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length).freeze();
        let Some(header) = self.current_header.take() else {
            return Ok(None);
        };

        if self.check_crc {
            let actual = crc64(&body);
            if actual != header.crc {
                return Err(CodecError::ChecksumMismatch {
                    type_name: header.type_name,
                    device_name: header.device_name,
                    expected: header.crc,
                    actual,
                });
            }
        }

        trace!(
            type_name = %header.type_name,
            device = %header.device_name,
            size = body.len(),
            "Decoded frame"
        );
        Ok(Some(RawMessage { header, body }))
    }
}

impl Encoder<RawMessage> for IgtlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body.len() > MAX_BODY_SIZE {
            return Err(CodecError::MessageTooLarge(item.body.len()));
        }

        let mut header = item.header;
        header.body_size = item.body.len() as u64;
        header.crc = crc64(&item.body);

        dst.reserve(HEADER_SIZE + item.body.len());
        header.encode(dst)?;
        dst.extend_from_slice(&item.body);

        Ok(())
    }
}

/// Encode a single message into a standalone frame.
///
/// # Errors
///
/// Returns `CodecError::Wire` if a header field does not fit, or
/// `CodecError::MessageTooLarge` for an oversize body.
pub fn encode_frame(message: RawMessage) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    IgtlCodec::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Build a version 1 frame from parts.
///
/// # Errors
///
/// See [`encode_frame`].
pub fn frame(type_name: &str, device_name: &str, body: Bytes) -> Result<Bytes, CodecError> {
    encode_frame(RawMessage::new(type_name, device_name, body).with_version(HEADER_VERSION_1))
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Message too large: {0} bytes (max: {MAX_BODY_SIZE})")]
    MessageTooLarge(usize),

    #[error(
        "Checksum mismatch for {type_name}:{device_name}: expected {expected:#018x}, got {actual:#018x}"
    )]
    ChecksumMismatch {
        type_name: String,
        device_name: String,
        expected: u64,
        actual: u64,
    },
}

impl CodecError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::ChecksumMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::cast_possible_truncation)] // Test constants bounded to u64

    use super::*;
    use bytes::BufMut;

    fn status_frame() -> RawMessage {
        RawMessage::new("STRING", "Console", Bytes::from_static(b"\x00\x03\x00\x05hello"))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();

        let msg = status_frame();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.type_name(), "STRING");
        assert_eq!(decoded.device_name(), "Console");
        assert_eq!(decoded.body, msg.body);
        assert_eq!(decoded.header.body_size, msg.body.len() as u64);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(status_frame(), &mut buf).unwrap();
        let full_buf = buf.clone();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full_buf[..20]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete, body still short
        partial.extend_from_slice(&full_buf[20..HEADER_SIZE + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf[HEADER_SIZE + 3..]);
        let decoded = codec.decode(&mut partial).unwrap();
        assert!(decoded.is_some());
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_empty_body() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(RawMessage::new("GET_STATUS", "", Bytes::new()), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.type_name(), "GET_STATUS");
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_multiple_messages_in_buffer() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(RawMessage::new("STRING", "first", Bytes::from_static(b"a")), &mut buf)
            .unwrap();
        codec
            .encode(RawMessage::new("STRING", "second", Bytes::from_static(b"bc")), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.device_name(), "first");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.device_name(), "second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupted_body_is_consumed_and_rejected() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(status_frame(), &mut buf).unwrap();
        codec
            .encode(RawMessage::new("STRING", "next", Bytes::from_static(b"ok")), &mut buf)
            .unwrap();
        buf[HEADER_SIZE + 4] ^= 0x01;

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, CodecError::ChecksumMismatch { .. }));

        // The following frame still decodes
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.device_name(), "next");
    }

    #[test]
    fn test_crc_check_can_be_disabled() {
        let mut codec = IgtlCodec::without_crc_check();
        let mut buf = BytesMut::new();
        codec.encode(status_frame(), &mut buf).unwrap();
        buf[HEADER_SIZE] ^= 0xFF;
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_message_too_large() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();

        let mut header = MessageHeader::new("IMAGE", "Huge");
        header.body_size = (MAX_BODY_SIZE + 1) as u64;
        header.encode(&mut buf).unwrap();

        let result = codec.decode(&mut buf);
        let err = result.unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_encode_rejects_long_device_name() {
        let mut codec = IgtlCodec::new();
        let mut buf = BytesMut::new();
        let msg = RawMessage::new("STRING", "x".repeat(21), Bytes::new());
        let err = codec.encode(msg, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Wire(WireError::FieldTooLong { .. })));
    }

    #[test]
    fn test_frame_helper_sets_size_and_crc() {
        let bytes = frame("STRING", "Dev", Bytes::from_static(b"payload")).unwrap();
        let header = MessageHeader::decode(&bytes).unwrap();
        assert_eq!(header.version, HEADER_VERSION_1);
        assert_eq!(header.body_size, 7);
        assert_eq!(header.crc, crc64(b"payload"));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::MessageTooLarge(300_000_000);
        let msg = err.to_string();
        assert!(msg.contains("300000000"));
        assert!(msg.contains("too large"));

        let err = CodecError::ChecksumMismatch {
            type_name: "STATUS".to_string(),
            device_name: "Dev".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(err.to_string().contains("STATUS:Dev"));
    }

    #[test]
    fn test_codec_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err: CodecError = io_err.into();
        assert!(matches!(err, CodecError::Io(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_length_field_matches_body() {
        let mut buf = BytesMut::new();
        buf.put_slice(&frame("STRING", "Dev", Bytes::from_static(b"12345")).unwrap());
        let size = u64::from_be_bytes(buf[42..50].try_into().unwrap());
        assert_eq!(size as usize, buf.len() - HEADER_SIZE);
    }
}
