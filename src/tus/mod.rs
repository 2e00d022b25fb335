pub mod chunks;
mod client;
pub mod constants;
mod errors;
pub mod metadata;
mod manager;
mod manager_worker;
mod notify;
mod persistence;
mod queue;
mod record;
pub mod request;
mod storage;
pub mod transfer;
mod transport;
pub mod types;

pub use client::{TusClient, FILENAME_KEY};
pub use errors::{Result, TusError};
pub use manager::{FilteredEventReceiver, UploadManager, UploadManagerHandle};
pub use notify::{LoggingDelegate, UploadDelegate, UploadEvent};
pub use persistence::{JsonRecordStore, MemoryRecordStore, RecordStore};
pub use queue::UploadQueue;
pub use record::{UploadId, UploadRecord, UploadStatus};
pub use request::{RequestIntent, UploadRequest};
pub use storage::{FileStore, LocalFileStore, MemoryFileStore};
pub use transport::{ReqwestTransport, Transport, TransportResponse};
