use std::collections::BTreeMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use super::errors::{Result, TusError};

/// Keys end up as bare tokens in the header, so they cannot be empty or hold
/// the pair (space) or list (comma) separators.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(' ') || key.contains(',') {
        return Err(TusError::InvalidMetadataKey(key.to_string()));
    }
    Ok(())
}

/// Encodes metadata as `key base64(value)` pairs joined by commas.
pub fn encode(metadata: &BTreeMap<String, String>) -> Result<String> {
    let mut parts = Vec::with_capacity(metadata.len());

    for (key, value) in metadata {
        validate_key(key)?;
        parts.push(format!("{} {}", key, STANDARD.encode(value)));
    }

    Ok(parts.join(","))
}

/// Parses an `Upload-Metadata` header value back into a map.
pub fn decode(header: &str) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();

    for pair in header.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, encoded) = match pair.split_once(' ') {
            Some((key, encoded)) => (key, encoded),
            None => (pair, ""),
        };
        validate_key(key)?;

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| TusError::header_parse("Upload-Metadata", err))?;
        let value = String::from_utf8(bytes)
            .map_err(|err| TusError::header_parse("Upload-Metadata", err))?;
        metadata.insert(key.to_string(), value);
    }

    Ok(metadata)
}
