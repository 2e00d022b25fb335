use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;
use super::errors::{Result, TusError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Waiting in the queue, nothing sent yet
    Idle,
    /// Server resource exists, no chunk dispatched yet
    Created,
    /// Chunks are being sent
    Uploading,
    /// Server acknowledged every byte
    Completed,
    /// Unrecoverable error
    Failed,
    /// Explicitly cancelled
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// One file transfer: identity, protocol state and acknowledged progress.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UploadRecord {
    pub id: UploadId,
    pub file_name: String,
    pub status: UploadStatus,
    pub content_length: u64,
    pub upload_offset: u64,
    pub upload_url: Option<Url>,
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UploadRecord {
    pub fn new(
        file_name: impl Into<String>,
        content_length: u64,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UploadId::new(),
            file_name: file_name.into(),
            status: UploadStatus::Idle,
            content_length,
            upload_offset: 0,
            upload_url: None,
            metadata,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining(&self) -> u64 {
        self.content_length - self.upload_offset
    }

    /// Records the server-assigned location. The location can only be set once.
    pub(crate) fn set_location(&mut self, url: Url) -> Result<()> {
        if let Some(existing) = &self.upload_url {
            return Err(TusError::internal_error(format!(
                "upload {} already has location {}", self.id, existing
            )));
        }
        self.upload_url = Some(url);
        self.status = UploadStatus::Created;
        self.touch();
        Ok(())
    }

    /// Moves the acknowledged offset forward. Offsets never go backwards and never
    /// pass the content length; completed records are frozen.
    pub(crate) fn advance_offset(&mut self, offset: u64) -> Result<()> {
        if self.status == UploadStatus::Completed {
            return Err(TusError::internal_error(format!("upload {} is already completed", self.id)));
        }
        if offset < self.upload_offset || offset > self.content_length {
            return Err(TusError::OffsetMismatch {
                expected: self.upload_offset,
                actual: offset,
            });
        }
        self.upload_offset = offset;
        self.retry_count = 0;
        self.touch();
        Ok(())
    }

    pub(crate) fn set_status(&mut self, status: UploadStatus) {
        self.status = status;
        self.touch();
    }

    pub(crate) fn fail(&mut self, error: &TusError) {
        self.error = Some(error.to_string());
        self.set_status(UploadStatus::Failed);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
