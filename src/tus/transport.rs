use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use super::errors::{Result, TusError};
use super::request::UploadRequest;

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses a decimal offset header such as `Upload-Offset`.
    pub fn offset_header(&self, name: &'static str) -> Result<u64> {
        let value = self.headers.get(name).ok_or(TusError::MissingHeader(name))?;
        value
            .to_str()
            .map_err(|err| TusError::header_parse(name, err))?
            .trim()
            .parse::<u64>()
            .map_err(|err| TusError::header_parse(name, err))
    }

    pub fn status_error(&self, message: impl Into<String>) -> TusError {
        TusError::server_error(self.status, message)
    }
}

/// Executes one request and yields its single completion. Transports hold no
/// upload state.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: UploadRequest) -> Result<TransportResponse>;
}

/// HTTP transport backed by a shared `reqwest` client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: UploadRequest) -> Result<TransportResponse> {
        let mut headers = request.headers;
        // reqwest derives it from the body
        headers.remove(CONTENT_LENGTH);

        let response = self
            .client
            .request(request.method, request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse { status, headers, body })
    }
}
