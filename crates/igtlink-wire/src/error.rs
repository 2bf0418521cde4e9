//! Error types for the igtlink-wire crate.
//!
//! `WireError` covers body-level problems (truncated payloads, oversize
//! fixed-width fields, malformed command documents). Stream-level framing
//! errors live in [`crate::transport::CodecError`].

/// Errors raised while encoding or decoding message contents
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Truncated {what}: need {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("Field {field} too long: {len} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid XML: {0}")]
    InvalidXml(String),

    #[error("Invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
}

impl WireError {
    pub(crate) fn truncated(what: &'static str, needed: usize, got: usize) -> Self {
        Self::Truncated { what, needed, got }
    }

    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            reason: reason.into(),
        }
    }

    /// Fail with `Truncated` unless `data` holds at least `needed` bytes.
    pub(crate) fn ensure_len(what: &'static str, data: &[u8], needed: usize) -> Result<()> {
        if data.len() < needed {
            return Err(Self::truncated(what, needed, data.len()));
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
