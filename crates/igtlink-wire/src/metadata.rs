//! Version 2 message bodies: extended header and metadata.
//!
//! ```text
//! +-----------------+---------+-----------------+---------------+
//! | extended header | content | metadata header | metadata body |
//! | 12 bytes        |         | 2 + 8n bytes    |               |
//! +-----------------+---------+-----------------+---------------+
//! ```
//! The extended header is `(ext_header_size u16, metadata_header_size u16,
//! metadata_size u32, message_id u32)`. Each metadata header entry is
//! `(key_size u16, encoding u16, value_size u32)`; the body holds the keys
//! and values back to back in the same order.
//!
//! Version 1 bodies are the content alone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use igtlink_types::{Encoding, MetaData};

use crate::error::{Result, WireError};
use crate::header::{HEADER_VERSION_1, HEADER_VERSION_2};

pub const EXTENDED_HEADER_SIZE: usize = 12;
const METADATA_ENTRY_SIZE: usize = 8;

/// A body split into its content and the version 2 trailer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnpackedBody {
    pub content: Bytes,
    pub metadata: MetaData,
    pub message_id: u32,
}

/// Header version to use for a body carrying `metadata`.
#[must_use]
pub fn version_for(metadata: &MetaData) -> u16 {
    if metadata.is_empty() {
        HEADER_VERSION_1
    } else {
        HEADER_VERSION_2
    }
}

/// Assemble a body for the given header version.
///
/// # Errors
///
/// Returns `WireError::FieldTooLong` when a key, a value or the entry count
/// does not fit its length field.
pub fn pack_body(version: u16, content: &[u8], metadata: &MetaData, message_id: u32) -> Result<Bytes> {
    if version < HEADER_VERSION_2 {
        return Ok(Bytes::copy_from_slice(content));
    }

    let count = u16::try_from(metadata.len()).map_err(|_| WireError::FieldTooLong {
        field: "metadata count",
        len: metadata.len(),
        max: usize::from(u16::MAX),
    })?;

    let mut meta_header = BytesMut::with_capacity(2 + METADATA_ENTRY_SIZE * metadata.len());
    let mut meta_body = BytesMut::new();
    meta_header.put_u16(count);
    for (key, value) in metadata.iter() {
        let key_size = u16::try_from(key.len()).map_err(|_| WireError::FieldTooLong {
            field: "metadata key",
            len: key.len(),
            max: usize::from(u16::MAX),
        })?;
        let value_size = u32::try_from(value.value.len()).map_err(|_| WireError::FieldTooLong {
            field: "metadata value",
            len: value.value.len(),
            max: u32::MAX as usize,
        })?;
        meta_header.put_u16(key_size);
        meta_header.put_u16(value.encoding.mib());
        meta_header.put_u32(value_size);
        meta_body.put_slice(key.as_bytes());
        meta_body.put_slice(value.value.as_bytes());
    }

    let meta_header_size = u16::try_from(meta_header.len()).map_err(|_| WireError::FieldTooLong {
        field: "metadata header",
        len: meta_header.len(),
        max: usize::from(u16::MAX),
    })?;
    let meta_size = u32::try_from(meta_body.len()).map_err(|_| WireError::FieldTooLong {
        field: "metadata body",
        len: meta_body.len(),
        max: u32::MAX as usize,
    })?;

    let mut out = BytesMut::with_capacity(
        EXTENDED_HEADER_SIZE + content.len() + meta_header.len() + meta_body.len(),
    );
    #[allow(clippy::cast_possible_truncation)] // Constant 12
    out.put_u16(EXTENDED_HEADER_SIZE as u16);
    out.put_u16(meta_header_size);
    out.put_u32(meta_size);
    out.put_u32(message_id);
    out.put_slice(content);
    out.put_slice(&meta_header);
    out.put_slice(&meta_body);
    Ok(out.freeze())
}

/// Split a received body according to its header version.
///
/// # Errors
///
/// Returns `WireError::Truncated` or `WireError::Invalid` when the extended
/// header or metadata sections disagree with the body length.
pub fn unpack_body(version: u16, body: Bytes) -> Result<UnpackedBody> {
    if version < HEADER_VERSION_2 {
        return Ok(UnpackedBody {
            content: body,
            ..UnpackedBody::default()
        });
    }

    WireError::ensure_len("extended header", &body, EXTENDED_HEADER_SIZE)?;
    let mut ext = &body[..EXTENDED_HEADER_SIZE];
    let ext_size = usize::from(ext.get_u16());
    let meta_header_size = usize::from(ext.get_u16());
    let meta_size = ext.get_u32() as usize;
    let message_id = ext.get_u32();

    if ext_size < EXTENDED_HEADER_SIZE {
        return Err(WireError::invalid(
            "extended header",
            format!("size {ext_size} below {EXTENDED_HEADER_SIZE}"),
        ));
    }

    let trailer = meta_header_size + meta_size;
    WireError::ensure_len("v2 body", &body, ext_size + trailer)?;
    let content_end = body.len() - trailer;
    let content = body.slice(ext_size..content_end);

    let metadata = if meta_header_size == 0 {
        MetaData::new()
    } else {
        decode_metadata(
            &body[content_end..content_end + meta_header_size],
            &body[content_end + meta_header_size..],
        )?
    };

    Ok(UnpackedBody {
        content,
        metadata,
        message_id,
    })
}

fn decode_metadata(mut header: &[u8], mut data: &[u8]) -> Result<MetaData> {
    WireError::ensure_len("metadata header", header, 2)?;
    let count = usize::from(header.get_u16());
    WireError::ensure_len("metadata header", header, count * METADATA_ENTRY_SIZE)?;

    let mut metadata = MetaData::new();
    for _ in 0..count {
        let key_size = usize::from(header.get_u16());
        let encoding = Encoding::from_mib(header.get_u16());
        let value_size = header.get_u32() as usize;

        WireError::ensure_len("metadata body", data, key_size + value_size)?;
        let key = String::from_utf8_lossy(&data[..key_size]).into_owned();
        let value = String::from_utf8_lossy(&data[key_size..key_size + value_size]).into_owned();
        data.advance(key_size + value_size);

        metadata.insert(key, encoding, value);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> MetaData {
        let mut meta = MetaData::new();
        meta.insert_ascii("Depth", "45");
        meta.insert("Operator", Encoding::Utf8, "Zoë");
        meta
    }

    #[test]
    fn test_version_selection() {
        assert_eq!(version_for(&MetaData::new()), HEADER_VERSION_1);
        assert_eq!(version_for(&sample_metadata()), HEADER_VERSION_2);
    }

    #[test]
    fn test_v1_body_is_content_only() {
        let body = pack_body(HEADER_VERSION_1, b"abc", &sample_metadata(), 7).unwrap();
        assert_eq!(body.as_ref(), b"abc");

        let unpacked = unpack_body(HEADER_VERSION_1, body).unwrap();
        assert_eq!(unpacked.content.as_ref(), b"abc");
        assert!(unpacked.metadata.is_empty());
    }

    #[test]
    fn test_v2_layout() {
        let mut meta = MetaData::new();
        meta.insert_ascii("k", "vv");
        let body = pack_body(HEADER_VERSION_2, b"xyz", &meta, 9).unwrap();

        // ext header
        assert_eq!(&body[0..2], &[0, 12]);
        assert_eq!(&body[2..4], &[0, 10]);
        assert_eq!(&body[4..8], &[0, 0, 0, 3]);
        assert_eq!(&body[8..12], &[0, 0, 0, 9]);
        assert_eq!(&body[12..15], b"xyz");
        // metadata header: count, key size, encoding, value size
        assert_eq!(&body[15..17], &[0, 1]);
        assert_eq!(&body[17..19], &[0, 1]);
        assert_eq!(&body[19..21], &[0, 3]);
        assert_eq!(&body[21..25], &[0, 0, 0, 2]);
        assert_eq!(&body[25..], b"kvv");
    }

    #[test]
    fn test_v2_unpack_restores_metadata() {
        let meta = sample_metadata();
        let body = pack_body(HEADER_VERSION_2, b"<Command/>", &meta, 42).unwrap();
        let unpacked = unpack_body(HEADER_VERSION_2, body).unwrap();

        assert_eq!(unpacked.content.as_ref(), b"<Command/>");
        assert_eq!(unpacked.metadata, meta);
        assert_eq!(unpacked.message_id, 42);
    }

    #[test]
    fn test_v2_without_metadata() {
        let body = pack_body(HEADER_VERSION_2, b"abc", &MetaData::new(), 0).unwrap();
        let unpacked = unpack_body(HEADER_VERSION_2, body).unwrap();
        assert_eq!(unpacked.content.as_ref(), b"abc");
        assert!(unpacked.metadata.is_empty());
    }

    #[test]
    fn test_v2_truncated_extended_header() {
        let err = unpack_body(HEADER_VERSION_2, Bytes::from_static(&[0, 12, 0])).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_v2_metadata_size_exceeds_body() {
        let mut raw = BytesMut::new();
        raw.put_u16(12);
        raw.put_u16(10);
        raw.put_u32(500);
        raw.put_u32(0);
        let err = unpack_body(HEADER_VERSION_2, raw.freeze()).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }
}
