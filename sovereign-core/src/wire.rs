//! Wire format helpers.
//!
//! Uses CBOR (RFC 8949) for every structure that crosses the shell boundary
//! or touches persistent storage. Tokens travel across the bridge as opaque
//! bytes, so the encoding must be compact and the decoder must enforce size
//! caps before parsing anything attacker-supplied.

use crate::error::{Error, Result, TokenError};
use crate::token::CapabilityToken;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum allowed size for a serialized capability token in bytes.
///
/// Typical tokens are well under 1 KB; the cap protects the verifier from
/// memory exhaustion on attacker-supplied blobs.
pub const MAX_TOKEN_SIZE: usize = 16 * 1024;

/// Maximum allowed size for a single bridge request/response frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Serialize any value to CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a capability token to its binary transport form.
pub fn encode_token(token: &CapabilityToken) -> Result<Vec<u8>> {
    let bytes = to_vec(token)?;
    if bytes.len() > MAX_TOKEN_SIZE {
        return Err(Error::Token(TokenError::TooLarge {
            size: bytes.len(),
            max: MAX_TOKEN_SIZE,
        }));
    }
    Ok(bytes)
}

/// Decode a capability token from binary transport form.
///
/// The size cap is checked before deserialization.
pub fn decode_token(data: &[u8]) -> Result<CapabilityToken> {
    if data.len() > MAX_TOKEN_SIZE {
        return Err(Error::Token(TokenError::TooLarge {
            size: data.len(),
            max: MAX_TOKEN_SIZE,
        }));
    }
    ciborium::de::from_reader(data)
        .map_err(|e| Error::Token(TokenError::Malformed(e.to_string())))
}

/// Encode a token to a base64url string for text transports.
pub fn encode_token_base64(token: &CapabilityToken) -> Result<String> {
    let bytes = encode_token(token)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Decode a token from a base64url string.
pub fn decode_token_base64(s: &str) -> Result<CapabilityToken> {
    // base64 encodes 3 bytes as 4 chars; estimate before decoding.
    let estimated = (s.len() * 3) / 4;
    if estimated > MAX_TOKEN_SIZE {
        return Err(Error::Token(TokenError::TooLarge {
            size: estimated,
            max: MAX_TOKEN_SIZE,
        }));
    }
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Error::Token(TokenError::Malformed(e.to_string())))?;
    decode_token(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_token_bytes_rejected_before_parse() {
        let data = vec![0u8; MAX_TOKEN_SIZE + 1];
        let err = decode_token(&data).unwrap_err();
        assert!(matches!(err, Error::Token(TokenError::TooLarge { .. })));
    }

    #[test]
    fn garbage_is_malformed_not_panic() {
        let err = decode_token(&[0xff, 0x00, 0x13, 0x37]).unwrap_err();
        assert!(matches!(err, Error::Token(TokenError::Malformed(_))));
    }

    #[test]
    fn base64_garbage_is_malformed() {
        let err = decode_token_base64("!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, Error::Token(TokenError::Malformed(_))));
    }
}
