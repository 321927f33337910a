//! The handshake's Export Descriptor: a single-line JSON object naming a
//! back end and its block size, plus whatever back-end-specific keys that
//! back end's factory wants.

use serde::Deserialize;
use thiserror::Error;

/// Handshake reads are bounded at this many bytes (spec.md §4.6, §9).
pub const MAX_HANDSHAKE_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("handshake exceeded {MAX_HANDSHAKE_BYTES} bytes")]
    TooLarge,

    #[error("handshake was not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("handshake was not a valid export descriptor: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("blocksize must be a positive power of two")]
    InvalidBlockSize,
}

/// A parsed Export Descriptor.
#[derive(Debug, Clone)]
pub struct ExportDescriptor {
    /// Selects a handler factory in the [`crate::Registry`].
    pub name: String,
    /// Negotiated block size in bytes; validated to be a positive power of two.
    pub block_size: u32,
    /// The full decoded JSON object, so back-end factories can read their
    /// own config keys out of it.
    pub raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    blocksize: u32,
}

impl ExportDescriptor {
    /// Parse a handshake buffer. `buf` must already be bounded to
    /// [`MAX_HANDSHAKE_BYTES`] by the caller; this is checked again here as
    /// the contract's last line of defense.
    pub fn parse(buf: &[u8]) -> Result<Self, DescriptorError> {
        if buf.len() > MAX_HANDSHAKE_BYTES {
            return Err(DescriptorError::TooLarge);
        }
        let text = std::str::from_utf8(buf)?;
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let header: Header = serde_json::from_value(raw.clone())?;
        if header.blocksize == 0 || !header.blocksize.is_power_of_two() {
            return Err(DescriptorError::InvalidBlockSize);
        }
        Ok(Self {
            name: header.name,
            block_size: header.blocksize,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_blocksize() {
        let d = ExportDescriptor::parse(br#"{"name":"mem","blocksize":512}"#).unwrap();
        assert_eq!(d.name, "mem");
        assert_eq!(d.block_size, 512);
    }

    #[test]
    fn keeps_backend_specific_fields() {
        let d =
            ExportDescriptor::parse(br#"{"name":"rbd","blocksize":512,"pool":"p","image":"i"}"#)
                .unwrap();
        assert_eq!(d.raw["pool"], "p");
        assert_eq!(d.raw["image"], "i");
    }

    #[test]
    fn rejects_non_power_of_two_blocksize() {
        let err = ExportDescriptor::parse(br#"{"name":"mem","blocksize":500}"#).unwrap_err();
        assert!(matches!(err, DescriptorError::InvalidBlockSize));
    }

    #[test]
    fn rejects_oversized_handshake() {
        let huge = vec![b' '; MAX_HANDSHAKE_BYTES + 1];
        assert!(matches!(
            ExportDescriptor::parse(&huge),
            Err(DescriptorError::TooLarge)
        ));
    }
}
