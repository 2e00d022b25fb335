//! Turns an [`UploadRecord`] into fully specified protocol requests.
//!
//! Everything here is pure: no I/O, no mutation of the record.

use std::str::FromStr;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use url::Url;
use crate::config::ClientConfig;
use super::constants::*;
use super::errors::Result;
use super::metadata;
use super::record::UploadRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestIntent {
    Create,
    Head,
    PatchChunk,
}

/// A request ready to hand to a [`Transport`](super::transport::Transport).
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub intent: RequestIntent,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UploadRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Custom headers first, protocol headers inserted on top so they win on
/// (case-insensitive) name clashes.
fn base_headers(config: &ClientConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        headers.insert(HeaderName::from_str(name)?, HeaderValue::from_str(value)?);
    }
    headers.insert(HEADER_TUS_RESUMABLE, HeaderValue::from_static(TUS_RESUMABLE));

    Ok(headers)
}

fn insert_metadata(headers: &mut HeaderMap, record: &UploadRecord) -> Result<()> {
    let encoded = metadata::encode(&record.metadata)?;
    if encoded.is_empty() {
        headers.remove(HEADER_UPLOAD_METADATA);
    } else {
        headers.insert(HEADER_UPLOAD_METADATA, HeaderValue::from_str(&encoded)?);
    }
    Ok(())
}

fn location(record: &UploadRecord, intent: RequestIntent) -> &Url {
    match &record.upload_url {
        Some(url) => url,
        None => panic!("{:?} request built for upload {} before it was created", intent, record.id),
    }
}

/// `POST` to the configured endpoint allocating the server-side upload.
pub fn create(record: &UploadRecord, config: &ClientConfig) -> Result<UploadRequest> {
    let mut headers = base_headers(config)?;
    headers.insert(HEADER_UPLOAD_LENGTH, HeaderValue::from(record.content_length));
    headers.insert(HEADER_UPLOAD_EXTENSION, HeaderValue::from_static(EXTENSION_CREATION));
    insert_metadata(&mut headers, record)?;

    Ok(UploadRequest {
        intent: RequestIntent::Create,
        method: Method::POST,
        url: config.endpoint.clone(),
        headers,
        body: Bytes::new(),
    })
}

/// `PATCH` carrying one chunk at the record's current offset.
///
/// # Panics
///
/// If the record has no upload location yet.
pub fn patch(record: &UploadRecord, chunk: Bytes, config: &ClientConfig) -> Result<UploadRequest> {
    let url = location(record, RequestIntent::PatchChunk).clone();

    let mut headers = base_headers(config)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(OFFSET_OCTET_STREAM));
    headers.insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(record.upload_offset));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(chunk.len()));
    insert_metadata(&mut headers, record)?;

    Ok(UploadRequest {
        intent: RequestIntent::PatchChunk,
        method: Method::PATCH,
        url,
        headers,
        body: chunk,
    })
}

/// `HEAD` asking the server how many bytes of a resumed upload it holds.
///
/// # Panics
///
/// If the record has no upload location yet.
pub fn head(record: &UploadRecord, config: &ClientConfig) -> Result<UploadRequest> {
    let url = location(record, RequestIntent::Head).clone();

    Ok(UploadRequest {
        intent: RequestIntent::Head,
        method: Method::HEAD,
        url,
        headers: base_headers(config)?,
        body: Bytes::new(),
    })
}
