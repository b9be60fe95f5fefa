//! Shard payload encoding.
//!
//! A shard is persisted either as a plain JSON object (`id -> entry`) or as
//! an envelope `{"encoding": ..., "data": ...}` whose `data` is base64 of
//! gzip-compressed JSON, or of raw JSON when compression failed. Decoding
//! tells the forms apart by the envelope's string `encoding` field; entries in
//! the plain form are always objects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::warn;

use super::types::TrackingEntry;
use crate::error::{Result, StoreError};

const GZIP_ENCODING: &str = "gzip+base64";
const FALLBACK_ENCODING: &str = "base64";

pub type Shard = BTreeMap<String, TrackingEntry>;

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(bytes)?;
  encoder.finish()
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut decoder = GzDecoder::new(bytes);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}

fn envelope(encoding: &str, bytes: &[u8]) -> Value {
  json!({ "encoding": encoding, "data": STANDARD.encode(bytes) })
}

/// Encode a shard for persistence.
pub fn encode(shard: &Shard, compress: bool) -> Result<Value> {
  if !compress {
    return Ok(serde_json::to_value(shard)?);
  }

  let bytes = serde_json::to_vec(shard)?;
  match gzip(&bytes) {
    Ok(compressed) => Ok(envelope(GZIP_ENCODING, &compressed)),
    Err(e) => {
      warn!(error = %e, "Shard compression failed; using plain base64");
      Ok(envelope(FALLBACK_ENCODING, &bytes))
    }
  }
}

/// Decode a persisted shard, whichever form it was saved in.
pub fn decode(document: Value) -> Result<Shard> {
  let encoding = document
    .get("encoding")
    .and_then(Value::as_str)
    .map(str::to_string);

  let Some(encoding) = encoding else {
    return Ok(serde_json::from_value(document)?);
  };

  let data = document
    .get("data")
    .and_then(Value::as_str)
    .ok_or_else(|| StoreError::Codec("shard envelope has no data".to_string()))?;
  let raw = STANDARD
    .decode(data)
    .map_err(|e| StoreError::Codec(format!("invalid base64: {}", e)))?;

  let bytes = match encoding.as_str() {
    GZIP_ENCODING => gunzip(&raw).map_err(|e| StoreError::Codec(format!("invalid gzip: {}", e)))?,
    FALLBACK_ENCODING => raw,
    other => return Err(StoreError::Codec(format!("unknown encoding {}", other))),
  };

  Ok(serde_json::from_slice(&bytes)?)
}
