//! OpenIGTLink message header.
//!
//! Every message starts with a fixed 58-byte big-endian header:
//! ```text
//! +---------+-----------+-------------+-----------+-----------+---------+
//! | version | type      | device name | timestamp | body size | CRC-64  |
//! | u16     | char[12]  | char[20]    | u64       | u64       | u64     |
//! +---------+-----------+-------------+-----------+-----------+---------+
//! ```
//! Fixed-width strings are NUL padded. The CRC covers the body only.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use crc::{CRC_64_ECMA_182, Crc};

use crate::error::{Result, WireError};

pub const HEADER_SIZE: usize = 58;
pub const TYPE_NAME_SIZE: usize = 12;
pub const DEVICE_NAME_SIZE: usize = 20;

pub const HEADER_VERSION_1: u16 = 1;
/// Version 2 bodies carry an extended header and metadata.
pub const HEADER_VERSION_2: u16 = 2;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// CRC-64 (ECMA-182) as used by OpenIGTLink.
#[must_use]
pub fn crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// 32.32 fixed point seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return Self(0);
        };
        let fraction = (u64::from(elapsed.subsec_nanos()) << 32) / 1_000_000_000;
        Self((elapsed.as_secs() << 32) | fraction)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Upper half of a u64
    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub fn nanoseconds(self) -> u32 {
        // Fraction < 2^32, so the result is < 1e9
        #[allow(clippy::cast_possible_truncation)]
        let nanos = (((self.0 & 0xFFFF_FFFF) * 1_000_000_000) >> 32) as u32;
        nanos
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    pub type_name: String,
    pub device_name: String,
    pub timestamp: Timestamp,
    pub body_size: u64,
    pub crc: u64,
}

impl MessageHeader {
    #[must_use]
    pub fn new(type_name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            version: HEADER_VERSION_1,
            type_name: type_name.into(),
            device_name: device_name.into(),
            timestamp: Timestamp::now(),
            body_size: 0,
            crc: 0,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Check that the fixed-width fields fit before any bytes are written.
    ///
    /// # Errors
    ///
    /// Returns `WireError::FieldTooLong` for an oversize type or device name
    /// and `WireError::Invalid` for an empty type.
    pub fn validate(&self) -> Result<()> {
        if self.type_name.is_empty() {
            return Err(WireError::invalid("header", "empty type name"));
        }
        check_fixed("type name", &self.type_name, TYPE_NAME_SIZE)?;
        check_fixed("device name", &self.device_name, DEVICE_NAME_SIZE)
    }

    /// # Errors
    ///
    /// See [`MessageHeader::validate`].
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        self.validate()?;
        dst.reserve(HEADER_SIZE);
        dst.put_u16(self.version);
        put_fixed(dst, &self.type_name, TYPE_NAME_SIZE);
        put_fixed(dst, &self.device_name, DEVICE_NAME_SIZE);
        dst.put_u64(self.timestamp.0);
        dst.put_u64(self.body_size);
        dst.put_u64(self.crc);
        Ok(())
    }

    /// Decode from the first `HEADER_SIZE` bytes of `src`.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Truncated` if `src` is shorter than a header.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        WireError::ensure_len("header", src, HEADER_SIZE)?;
        let version = src.get_u16();
        let type_name = get_fixed(&mut src, TYPE_NAME_SIZE);
        let device_name = get_fixed(&mut src, DEVICE_NAME_SIZE);
        Ok(Self {
            version,
            type_name,
            device_name,
            timestamp: Timestamp(src.get_u64()),
            body_size: src.get_u64(),
            crc: src.get_u64(),
        })
    }
}

pub(crate) fn check_fixed(field: &'static str, value: &str, size: usize) -> Result<()> {
    if value.len() > size {
        return Err(WireError::FieldTooLong {
            field,
            len: value.len(),
            max: size,
        });
    }
    Ok(())
}

/// Write `value` NUL padded to `size`. Callers check the length first.
pub(crate) fn put_fixed(dst: &mut BytesMut, value: &str, size: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(size);
    dst.put_slice(&bytes[..len]);
    dst.put_bytes(0, size - len);
}

/// Read a NUL padded field of `size` bytes. Callers check the length first.
pub(crate) fn get_fixed(src: &mut &[u8], size: usize) -> String {
    let field = &src[..size];
    let end = field.iter().position(|&b| b == 0).unwrap_or(size);
    let value = String::from_utf8_lossy(&field[..end]).into_owned();
    src.advance(size);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = MessageHeader::new("TRANSFORM", "Tracker");
        header.body_size = 48;
        header.crc = 0xDEAD_BEEF;

        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new("STATUS", "Dev").with_version(HEADER_VERSION_2);
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();

        assert_eq!(&buf[0..2], &[0, 2]);
        assert_eq!(&buf[2..8], b"STATUS");
        assert!(buf[8..14].iter().all(|&b| b == 0));
        assert_eq!(&buf[14..17], b"Dev");
    }

    #[test]
    fn test_full_width_names_have_no_terminator() {
        let header = MessageHeader::new("ABCDEFGHIJKL", "01234567890123456789");
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded.type_name, "ABCDEFGHIJKL");
        assert_eq!(decoded.device_name, "01234567890123456789");
    }

    #[test]
    fn test_oversize_device_name_rejected() {
        let header = MessageHeader::new("STRING", "a-device-name-that-is-too-long");
        let mut buf = BytesMut::new();
        let err = header.encode(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::FieldTooLong { max: 20, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_type_rejected() {
        let header = MessageHeader::new("", "Dev");
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let err = MessageHeader::decode(&[0u8; 57]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { needed: 58, .. }));
    }

    #[test]
    fn test_crc64_check_value() {
        // Standard check value for CRC-64/ECMA-182 over "123456789"
        assert_eq!(crc64(b"123456789"), 0x6C40_DF5F_0B49_7347);
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn test_timestamp_parts() {
        let ts = Timestamp((1_700_000_000u64 << 32) | 0x8000_0000);
        assert_eq!(ts.seconds(), 1_700_000_000);
        assert_eq!(ts.nanoseconds(), 500_000_000);
        assert!(Timestamp::now().seconds() > 1_600_000_000);
    }
}
