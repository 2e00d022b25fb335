use tokio::sync::oneshot;
use super::errors::Result;
use super::record::{UploadId, UploadRecord};

/// Commands handled by the queue worker
pub enum ManagerCommand {
    /// Append a record to the queue
    Enqueue {
        record: UploadRecord,
        reply: oneshot::Sender<Result<UploadId>>,
    },

    /// Record at the head of the queue
    Current {
        reply: oneshot::Sender<Option<UploadRecord>>,
    },

    GetUpload {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadRecord>>,
    },

    /// Every queued record, head first
    ListUploads {
        reply: oneshot::Sender<Vec<UploadRecord>>,
    },

    Cancel {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Stop without touching persisted progress
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
