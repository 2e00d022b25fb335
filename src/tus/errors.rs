use thiserror::Error;
use super::record::UploadId;

#[derive(Error, Debug)]
pub enum TusError {
    #[error("HTTP Request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Missing '{0}' header in response")]
    MissingHeader(&'static str),

    #[error("Header '{header_name}' parse error: {message}")]
    HeaderParseError {
        header_name: String,
        message: String,
    },

    #[error("Offset mismatch expected: {expected}, actual: {actual}")]
    OffsetMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("Upload incomplete expected: {expected}, actual: {actual}")]
    UploadIncomplete {
        expected: u64,
        actual: u64,
    },

    #[error("Invalid metadata key: {0:?}")]
    InvalidMetadataKey(String),

    #[error("Param error: {0}")]
    ParamError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid config file: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid url: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("State file error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("Upload {0} not found")]
    NotFound(UploadId),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TusError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    pub fn header_parse(header_name: &str, message: impl ToString) -> Self {
        Self::HeaderParseError {
            header_name: header_name.to_string(),
            message: message.to_string(),
        }
    }

    /// HTTP status attached to this error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerError { status_code, .. } => Some(*status_code),
            Self::HttpError(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Server-side (5xx) and transport failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(_) | Self::TransportError(_) => true,
            Self::ServerError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

/// Error alias
pub type Result<T, E = TusError> = std::result::Result<T, E>;
