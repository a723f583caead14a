use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::RenderError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Check the request's shared-secret header against `expected`.
///
/// The comparison runs in constant time over the key bytes. An absent,
/// non-ASCII, or empty header never matches.
pub fn verify_api_key(headers: &HeaderMap, expected: &str) -> Result<(), RenderError> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided.is_empty() || expected.is_empty() {
        return Err(RenderError::Unauthorized);
    }

    if provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(RenderError::Unauthorized)
    }
}
