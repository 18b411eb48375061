//! Wire codec for save payloads: UTF-8 JSON, gzip-compressed, standard base64.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value as JsonValue;

use crate::error::PayloadError;

/// A save that passed decoding: the exact JSON text plus its parsed form.
#[derive(Clone, Debug)]
pub struct DecodedSave {
    json: String,
    value: JsonValue,
}

impl DecodedSave {
    /// Parses already-decompressed JSON text, as stored by the relay.
    pub fn from_json(json: String) -> Result<Self, PayloadError> {
        let value: JsonValue =
            serde_json::from_str(&json).map_err(|err| PayloadError::json(err.to_string()))?;
        if !value.is_object() {
            return Err(PayloadError::json("expected a JSON object at the top level"));
        }
        Ok(Self { json, value })
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn into_json(self) -> String {
        self.json
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    /// Game id embedded in the save itself.
    pub fn game_id(&self) -> Option<&str> {
        self.value.get("gameId").and_then(JsonValue::as_str)
    }

    pub fn turns(&self) -> i64 {
        self.value
            .get("turns")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0)
    }

    /// Saves are public to spectators unless their parameters say otherwise.
    pub fn is_spectatable(&self) -> bool {
        self.value
            .pointer("/gameParameters/anyoneCanSpectate")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true)
    }
}

pub fn encode(raw: &[u8]) -> Result<String, PayloadError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
    encoder.write_all(raw).map_err(PayloadError::Compress)?;
    let compressed = encoder.finish().map_err(PayloadError::Compress)?;
    Ok(STANDARD.encode(compressed))
}

/// Decodes with the default expansion limit.
pub fn decode(token: &str) -> Result<Option<DecodedSave>, PayloadError> {
    decode_with_limit(token, crate::config::PayloadLimits::default().max_decoded_bytes)
}

/// Returns `Ok(None)` for an empty token.
pub fn decode_with_limit(token: &str, limit: usize) -> Result<Option<DecodedSave>, PayloadError> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(None);
    }

    let compressed = STANDARD.decode(token)?;
    let mut decoder = GzDecoder::new(compressed.as_slice()).take(limit as u64 + 1);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(PayloadError::Decompress)?;
    if raw.len() > limit {
        return Err(PayloadError::TooLarge { limit });
    }

    let json = String::from_utf8(raw).map_err(|err| PayloadError::json(err.to_string()))?;
    DecodedSave::from_json(json).map(Some)
}
