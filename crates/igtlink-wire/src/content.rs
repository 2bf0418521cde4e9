//! Content codecs for the built-in message types.
//!
//! All fields are big-endian. Fixed-width names are NUL padded like the
//! header fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use igtlink_types::{
    DeviceContent, DeviceKind, Encoding, ImageContent, StatusContent, StringContent,
    TransformContent,
};

use crate::error::{Result, WireError};
use crate::header::{check_fixed, get_fixed, put_fixed};

const STATUS_FIXED_SIZE: usize = 30;
const STATUS_ERROR_NAME_SIZE: usize = 20;
const TRANSFORM_SIZE: usize = 48;
const STRING_FIXED_SIZE: usize = 4;
pub const IMAGE_HEADER_SIZE: usize = 72;
const IMAGE_HEADER_VERSION: u16 = 1;

pub const COMMAND_FIXED_SIZE: usize = 30;
pub const COMMAND_NAME_SIZE: usize = 20;

/// Decode a body of the given kind.
///
/// Kinds without a dedicated codec (including the command kinds, which are
/// handled by [`CommandBody`]) decode to [`DeviceContent::Raw`].
///
/// # Errors
///
/// Returns `WireError::Truncated` when the body is shorter than its layout
/// requires.
pub fn decode_content(kind: &DeviceKind, data: &[u8]) -> Result<DeviceContent> {
    match kind {
        DeviceKind::Status => decode_status(data).map(DeviceContent::Status),
        DeviceKind::Transform => decode_transform(data).map(DeviceContent::Transform),
        DeviceKind::String => decode_string(data).map(DeviceContent::String),
        DeviceKind::Image => decode_image(data).map(DeviceContent::Image),
        DeviceKind::Command | DeviceKind::CommandResponse | DeviceKind::Other(_) => {
            Ok(DeviceContent::Raw {
                bytes: data.to_vec(),
            })
        }
    }
}

/// Encode content into a message body.
///
/// # Errors
///
/// Returns `WireError::FieldTooLong` when a fixed-width or length-prefixed
/// field cannot hold its value.
pub fn encode_content(content: &DeviceContent) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match content {
        DeviceContent::Status(status) => encode_status(status, &mut buf)?,
        DeviceContent::Transform(transform) => {
            for value in transform.values {
                buf.put_f32(value);
            }
        }
        DeviceContent::String(string) => encode_string(string, &mut buf)?,
        DeviceContent::Image(image) => encode_image(image, &mut buf),
        DeviceContent::Raw { bytes } => buf.put_slice(bytes),
    }
    Ok(buf.freeze())
}

fn decode_status(mut data: &[u8]) -> Result<StatusContent> {
    WireError::ensure_len("STATUS body", data, STATUS_FIXED_SIZE)?;
    let code = data.get_u16();
    let subcode = data.get_i64();
    let error_name = get_fixed(&mut data, STATUS_ERROR_NAME_SIZE);
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let message = String::from_utf8_lossy(&data[..end]).into_owned();
    Ok(StatusContent {
        code,
        subcode,
        error_name,
        message,
    })
}

fn encode_status(status: &StatusContent, buf: &mut BytesMut) -> Result<()> {
    check_fixed("error name", &status.error_name, STATUS_ERROR_NAME_SIZE)?;
    buf.put_u16(status.code);
    buf.put_i64(status.subcode);
    put_fixed(buf, &status.error_name, STATUS_ERROR_NAME_SIZE);
    buf.put_slice(status.message.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn decode_transform(mut data: &[u8]) -> Result<TransformContent> {
    WireError::ensure_len("TRANSFORM body", data, TRANSFORM_SIZE)?;
    let mut values = [0.0f32; 12];
    for value in &mut values {
        *value = data.get_f32();
    }
    Ok(TransformContent { values })
}

fn decode_string(mut data: &[u8]) -> Result<StringContent> {
    WireError::ensure_len("STRING body", data, STRING_FIXED_SIZE)?;
    let encoding = Encoding::from_mib(data.get_u16());
    let length = usize::from(data.get_u16());
    WireError::ensure_len("STRING text", data, length)?;
    let text = String::from_utf8_lossy(&data[..length]).into_owned();
    Ok(StringContent { encoding, text })
}

fn encode_string(string: &StringContent, buf: &mut BytesMut) -> Result<()> {
    let length = u16::try_from(string.text.len()).map_err(|_| WireError::FieldTooLong {
        field: "string",
        len: string.text.len(),
        max: usize::from(u16::MAX),
    })?;
    buf.put_u16(string.encoding.mib());
    buf.put_u16(length);
    buf.put_slice(string.text.as_bytes());
    Ok(())
}

fn get_u16x3(data: &mut &[u8]) -> [u16; 3] {
    [data.get_u16(), data.get_u16(), data.get_u16()]
}

fn decode_image(mut data: &[u8]) -> Result<ImageContent> {
    WireError::ensure_len("IMAGE header", data, IMAGE_HEADER_SIZE)?;
    let _version = data.get_u16();
    let components = data.get_u8();
    let scalar_type = data.get_u8();
    let endian = data.get_u8();
    let coordinate = data.get_u8();
    let size = get_u16x3(&mut data);
    let mut matrix = [0.0f32; 12];
    for value in &mut matrix {
        *value = data.get_f32();
    }
    let subvolume_offset = get_u16x3(&mut data);
    let subvolume_size = get_u16x3(&mut data);

    Ok(ImageContent {
        components,
        scalar_type,
        endian,
        coordinate,
        size,
        matrix,
        subvolume_offset,
        subvolume_size,
        pixels: data.to_vec(),
    })
}

fn encode_image(image: &ImageContent, buf: &mut BytesMut) {
    buf.reserve(IMAGE_HEADER_SIZE + image.pixels.len());
    buf.put_u16(IMAGE_HEADER_VERSION);
    buf.put_u8(image.components);
    buf.put_u8(image.scalar_type);
    buf.put_u8(image.endian);
    buf.put_u8(image.coordinate);
    for v in image.size {
        buf.put_u16(v);
    }
    for v in image.matrix {
        buf.put_f32(v);
    }
    for v in image.subvolume_offset.iter().chain(&image.subvolume_size) {
        buf.put_u16(*v);
    }
    buf.put_slice(&image.pixels);
}

/// COMMAND / RTS_COMMAND content: an identified, named text document.
///
/// ```text
/// +------------+----------+----------+--------+------+
/// | command id | name     | encoding | length | text |
/// | u32        | char[20] | u16      | u32    |      |
/// +------------+----------+----------+--------+------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBody {
    pub command_id: u32,
    pub name: String,
    pub encoding: Encoding,
    pub text: String,
}

impl CommandBody {
    #[must_use]
    pub fn new(command_id: u32, name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            command_id,
            name: name.into(),
            encoding: Encoding::for_text(&text),
            text,
        }
    }

    /// # Errors
    ///
    /// Returns `WireError::FieldTooLong` for a name over 20 bytes or a text
    /// that does not fit the u32 length field.
    pub fn encode(&self) -> Result<Bytes> {
        check_fixed("command name", &self.name, COMMAND_NAME_SIZE)?;
        let length = u32::try_from(self.text.len()).map_err(|_| WireError::FieldTooLong {
            field: "command text",
            len: self.text.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = BytesMut::with_capacity(COMMAND_FIXED_SIZE + self.text.len());
        buf.put_u32(self.command_id);
        put_fixed(&mut buf, &self.name, COMMAND_NAME_SIZE);
        buf.put_u16(self.encoding.mib());
        buf.put_u32(length);
        buf.put_slice(self.text.as_bytes());
        Ok(buf.freeze())
    }

    /// # Errors
    ///
    /// Returns `WireError::Truncated` when the body is shorter than the
    /// fixed part or the announced text length.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        WireError::ensure_len("COMMAND body", data, COMMAND_FIXED_SIZE)?;
        let command_id = data.get_u32();
        let name = get_fixed(&mut data, COMMAND_NAME_SIZE);
        let encoding = Encoding::from_mib(data.get_u16());
        let length = data.get_u32() as usize;
        WireError::ensure_len("COMMAND text", data, length)?;

        // Senders often NUL terminate inside the announced length
        let text = &data[..length];
        let end = text.iter().position(|&b| b == 0).unwrap_or(length);
        let text = String::from_utf8_lossy(&text[..end]).into_owned();

        Ok(Self {
            command_id,
            name,
            encoding,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        let status = StatusContent {
            code: StatusContent::CODE_OK,
            subcode: -3,
            error_name: "none".to_string(),
            message: "all good".to_string(),
        };
        let body = encode_content(&DeviceContent::Status(status.clone())).unwrap();
        assert_eq!(body.len(), STATUS_FIXED_SIZE + "all good".len() + 1);
        assert_eq!(body.last(), Some(&0));

        let decoded = decode_content(&DeviceKind::Status, &body).unwrap();
        assert_eq!(decoded, DeviceContent::Status(status));
    }

    #[test]
    fn test_status_error_name_too_long() {
        let status = StatusContent {
            error_name: "e".repeat(21),
            ..StatusContent::default()
        };
        assert!(encode_content(&DeviceContent::Status(status)).is_err());
    }

    #[test]
    fn test_transform_roundtrip() {
        let mut transform = TransformContent::identity();
        transform.values[9] = 12.5;
        let body = encode_content(&DeviceContent::Transform(transform)).unwrap();
        assert_eq!(body.len(), TRANSFORM_SIZE);

        let decoded = decode_content(&DeviceKind::Transform, &body).unwrap();
        assert_eq!(decoded, DeviceContent::Transform(transform));
    }

    #[test]
    fn test_transform_truncated() {
        let err = decode_content(&DeviceKind::Transform, &[0u8; 47]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { needed: 48, got: 47, .. }));
    }

    #[test]
    fn test_string_layout() {
        let content = DeviceContent::String(StringContent {
            encoding: Encoding::UsAscii,
            text: "hello".to_string(),
        });
        let body = encode_content(&content).unwrap();
        assert_eq!(&body[..4], &[0, 3, 0, 5]);
        assert_eq!(&body[4..], b"hello");
        assert_eq!(decode_content(&DeviceKind::String, &body).unwrap(), content);
    }

    #[test]
    fn test_string_length_beyond_body() {
        let err = decode_content(&DeviceKind::String, &[0, 3, 0, 9, b'a']).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_image_roundtrip() {
        let image = ImageContent {
            components: 1,
            scalar_type: 3,
            endian: 1,
            coordinate: 1,
            size: [2, 2, 1],
            matrix: TransformContent::identity().values,
            subvolume_offset: [0, 0, 0],
            subvolume_size: [2, 2, 1],
            pixels: vec![1, 2, 3, 4],
        };
        let body = encode_content(&DeviceContent::Image(image.clone())).unwrap();
        assert_eq!(body.len(), IMAGE_HEADER_SIZE + 4);
        assert_eq!(&body[..2], &[0, 1]);

        let decoded = decode_content(&DeviceKind::Image, &body).unwrap();
        assert_eq!(decoded, DeviceContent::Image(image));
    }

    #[test]
    fn test_unknown_kind_is_raw() {
        let decoded = decode_content(&DeviceKind::Other("POLYDATA".into()), b"\x01\x02").unwrap();
        assert_eq!(decoded, DeviceContent::Raw { bytes: vec![1, 2] });
    }

    #[test]
    fn test_command_body_layout() {
        let body = CommandBody::new(7, "Get", "<Command/>").encode().unwrap();
        assert_eq!(&body[0..4], &[0, 0, 0, 7]);
        assert_eq!(&body[4..7], b"Get");
        assert!(body[7..24].iter().all(|&b| b == 0));
        assert_eq!(&body[24..26], &[0, 3]);
        assert_eq!(&body[26..30], &[0, 0, 0, 10]);
        assert_eq!(&body[30..], b"<Command/>");

        let decoded = CommandBody::decode(&body).unwrap();
        assert_eq!(decoded.command_id, 7);
        assert_eq!(decoded.name, "Get");
        assert_eq!(decoded.text, "<Command/>");
    }

    #[test]
    fn test_command_body_trailing_nul() {
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        put_fixed(&mut raw, "Start", COMMAND_NAME_SIZE);
        raw.put_u16(3);
        raw.put_u32(4);
        raw.put_slice(b"abc\0");
        let decoded = CommandBody::decode(&raw).unwrap();
        assert_eq!(decoded.text, "abc");
    }

    #[test]
    fn test_command_utf8_encoding() {
        let body = CommandBody::new(1, "Set", "<Command Name=\"µ\"/>");
        assert_eq!(body.encoding, Encoding::Utf8);
    }

    #[test]
    fn test_command_name_too_long() {
        let err = CommandBody::new(1, "SetUltrasoundParameterValue", "").encode().unwrap_err();
        assert!(matches!(err, WireError::FieldTooLong { max: 20, .. }));
    }
}
