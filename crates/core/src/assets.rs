//! Audio payload decoding and writing.

use std::path::Path;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use tracing::debug;

use crate::error::RenderError;

/// Standard alphabet; trailing `=` padding may be present or omitted.
const AUDIO_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the transport encoding of an audio payload.
///
/// Accepts standard base64 with or without padding, optionally wrapped as a `data:` URL
/// (`data:audio/mpeg;base64,...`). ASCII whitespace, e.g. line wrapping
/// from MIME encoders, is ignored. The audio bytes themselves are not
/// inspected.
pub fn decode_audio(payload: &str) -> Result<Vec<u8>, RenderError> {
    let encoded = strip_data_url_prefix(payload.trim());
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    if compact.is_empty() {
        return Err(RenderError::validation("audio_base64 is empty"));
    }

    AUDIO_ENGINE
        .decode(compact.as_bytes())
        .map_err(|e| RenderError::validation(format!("audio_base64 is not valid base64: {e}")))
}

/// Decode `payload` and write the raw bytes verbatim to `destination`.
pub async fn write_audio(payload: &str, destination: &Path) -> Result<(), RenderError> {
    let bytes = decode_audio(payload)?;

    tokio::fs::write(destination, &bytes).await.map_err(|e| {
        RenderError::resource(format!(
            "failed to write audio to {}: {e}",
            destination.display()
        ))
    })?;

    debug!(
        path = %destination.display(),
        bytes = bytes.len(),
        "Audio payload written"
    );
    Ok(())
}

fn strip_data_url_prefix(payload: &str) -> &str {
    if !payload.starts_with("data:") {
        return payload;
    }

    match payload.split_once(',') {
        Some((header, data)) if header.ends_with(";base64") => data,
        _ => payload,
    }
}
