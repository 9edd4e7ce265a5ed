//! Identity Token Payload Decoding
//!
//! Reads the claims segment of a `header.payload.signature` token. The
//! signature is not checked: the token comes straight from the local
//! metadata service.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde_json::Value;

use crate::error::AttachError;

/// Pad a base64url segment with `=` to a multiple of 4
pub fn pad_segment(segment: &str) -> String {
    let trimmed = segment.trim_end_matches('=');
    let padding = (4 - trimmed.len() % 4) % 4;
    format!("{}{}", trimmed, "=".repeat(padding))
}

/// Decode the middle segment of a dot-delimited token as JSON
pub fn decode_payload(token: &str) -> Result<Value, AttachError> {
    let mut segments = token.trim().split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) if !payload.is_empty() => payload,
        _ => {
            return Err(AttachError::InvalidIdentityToken(
                "token has no payload segment".to_string(),
            ))
        }
    };

    let bytes = URL_SAFE
        .decode(pad_segment(payload))
        .map_err(|e| AttachError::InvalidIdentityToken(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AttachError::InvalidIdentityToken(format!("payload is not JSON: {}", e)))
}

#[cfg(test)]
pub(crate) fn encode_token(claims: &Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"signature")
    )
}
