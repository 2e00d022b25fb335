use url::Url;
use super::errors::TusError;
use super::record::{UploadId, UploadRecord, UploadStatus};

/// Application callbacks. Each is invoked exactly once per terminal transition
/// of a record; `record` is `None` for failures not tied to an upload, such as
/// a storage directory that can't be created.
pub trait UploadDelegate: Send + Sync {
    fn on_success(&self, record: &UploadRecord);

    fn on_failure(&self, record: Option<&UploadRecord>, error: &TusError);
}

/// Delegate that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDelegate;

impl UploadDelegate for LoggingDelegate {
    fn on_success(&self, record: &UploadRecord) {
        tracing::info!(
            upload_id = %record.id,
            bytes = record.content_length,
            url = record.upload_url.as_ref().map(Url::as_str).unwrap_or_default(),
            "Upload completed"
        );
    }

    fn on_failure(&self, record: Option<&UploadRecord>, error: &TusError) {
        match record {
            Some(record) => tracing::error!(upload_id = %record.id, error = %error, "Upload failed"),
            None => tracing::error!(error = %error, "Upload client failure"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Record accepted into the queue
    Queued {
        upload_id: UploadId,
    },

    StateChanged {
        upload_id: UploadId,
        old_state: UploadStatus,
        new_state: UploadStatus,
    },

    /// Server acknowledged more bytes
    Progress {
        upload_id: UploadId,
        bytes_uploaded: u64,
        total_bytes: u64,
    },

    Completed {
        upload_id: UploadId,
        upload_url: Option<Url>,
    },

    Failed {
        upload_id: Option<UploadId>,
        error: String,
    },

    Canceled {
        upload_id: UploadId,
    },

    /// Queue became empty after the last upload finished
    Drained,
}
