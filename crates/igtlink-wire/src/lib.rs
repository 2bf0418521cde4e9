//! OpenIGTLink wire format for igtlink.
//!
//! This crate turns byte streams into typed messages and back. It knows
//! nothing about sockets or sessions.
//!
//! # Architecture
//!
//! - [`header`]: the fixed 58-byte message header, timestamps and CRC-64
//! - [`transport`]: `tokio_util` codec framing header + body over a stream
//! - [`metadata`]: version 2 bodies (extended header and metadata trailer)
//! - [`content`]: STATUS, TRANSFORM, STRING, IMAGE and COMMAND bodies
//! - [`xml`]: element tree for command and response documents
//! - [`error`]: error types and result alias
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use igtlink_wire::{CommandBody, IgtlCodec, RawMessage};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let body = CommandBody::new(1, "Get", "<Command Name=\"Get\"/>").encode().unwrap();
//! let mut codec = IgtlCodec::new();
//! let mut buf = BytesMut::new();
//! codec.encode(RawMessage::new("COMMAND", "Scanner", body), &mut buf).unwrap();
//!
//! let frame = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.type_name(), "COMMAND");
//! ```

pub mod content;
pub mod error;
pub mod header;
pub mod metadata;
pub mod transport;
pub mod xml;

pub use content::{CommandBody, decode_content, encode_content};
pub use error::{Result, WireError};
pub use header::{
    DEVICE_NAME_SIZE, HEADER_SIZE, HEADER_VERSION_1, HEADER_VERSION_2, MessageHeader,
    TYPE_NAME_SIZE, Timestamp, crc64,
};
pub use metadata::{UnpackedBody, pack_body, unpack_body, version_for};
pub use transport::{CodecError, IgtlCodec, MAX_BODY_SIZE, RawMessage, encode_frame, frame};
pub use xml::XmlElement;
