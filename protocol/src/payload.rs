//! Base64 payload helpers shared by every role.
//!
//! All binary buffers cross the relay as base64 strings inside JSON
//! frames. The empty buffer encodes to the empty string and decodes back
//! to an empty buffer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

#[derive(Debug, thiserror::Error)]
#[error("invalid base64 payload: {0}")]
pub struct PayloadError(#[from] base64::DecodeError);

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, PayloadError> {
    Ok(BASE64.decode(text)?)
}
