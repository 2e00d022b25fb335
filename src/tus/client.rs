use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::broadcast;
use crate::config::ClientConfig;
use super::errors::{Result, TusError};
use super::manager::{UploadManager, UploadManagerHandle};
use super::metadata;
use super::notify::{UploadDelegate, UploadEvent};
use super::persistence::{JsonRecordStore, MemoryRecordStore, RecordStore};
use super::record::{UploadId, UploadRecord};
use super::storage::{FileStore, LocalFileStore};
use super::transfer::TransferContext;
use super::transport::{ReqwestTransport, Transport};

/// Metadata key filled from the source path when the caller didn't set one
pub const FILENAME_KEY: &str = "filename";

/// Entry point of the library. Owns the upload queue; files handed to it are
/// copied into the file store and uploaded one after another.
pub struct TusClient {
    config: Arc<ClientConfig>,
    files: Arc<dyn FileStore>,
    handle: UploadManagerHandle,
}

impl TusClient {
    /// Builds a client with the reqwest transport, a local file store under
    /// `storage_dir`, and JSON persistence when `state_file` is configured.
    pub async fn new(config: ClientConfig, delegate: Arc<dyn UploadDelegate>) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(ReqwestTransport::new(config.timeout())?);
        let files = Arc::new(LocalFileStore::open(&config.storage_dir, delegate.clone()).await);
        let records: Arc<dyn RecordStore> = match &config.state_file {
            Some(path) => Arc::new(JsonRecordStore::new(path)),
            None => Arc::new(MemoryRecordStore::new()),
        };

        Self::with_parts(config, transport, files, records, delegate)
    }

    /// Builds a client from explicit collaborators. Persisted records are
    /// restored and resumed as soon as the client starts.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        files: Arc<dyn FileStore>,
        records: Arc<dyn RecordStore>,
        delegate: Arc<dyn UploadDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let ctx = TransferContext {
            config: config.clone(),
            transport,
            files: files.clone(),
            records,
        };
        let handle = UploadManager::spawn(ctx, delegate);

        tracing::debug!(endpoint = %config.endpoint, "Tus client started");
        Ok(Self {
            config,
            files,
            handle,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn manager(&self) -> &UploadManager {
        &self.handle.manager
    }

    /// Copies `path` into the file store and queues it.
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        mut metadata: BTreeMap<String, String>,
    ) -> Result<UploadId> {
        let path = path.as_ref();
        if !metadata.contains_key(FILENAME_KEY) {
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                metadata.insert(FILENAME_KEY.to_string(), name.to_string());
            }
        }
        metadata::encode(&metadata)?;

        let upload_id = UploadId::new();
        let file_name = upload_id.to_string();
        let content_length = self.files.import(path, &file_name).await?;

        let mut record = UploadRecord::new(file_name, content_length, metadata);
        record.id = upload_id;

        tracing::info!(upload_id = %upload_id, path = %path.display(), bytes = content_length, "Uploading file");
        self.enqueue_stored(record).await
    }

    /// Writes `data` into the file store and queues it.
    pub async fn upload_data(&self, data: Bytes, metadata: BTreeMap<String, String>) -> Result<UploadId> {
        metadata::encode(&metadata)?;

        let record = UploadRecord::new(String::new(), data.len() as u64, metadata);
        let file_name = record.id.to_string();
        let record = UploadRecord { file_name, ..record };

        self.files.write(&record.file_name, data).await?;
        self.enqueue_stored(record).await
    }

    /// Queues a record whose bytes are already in the file store.
    pub async fn enqueue(&self, record: UploadRecord) -> Result<UploadId> {
        if !self.files.exists(&record.file_name).await {
            return Err(TusError::ParamError(format!(
                "File {} is not in the file store", record.file_name
            )));
        }
        let size = self.files.size_of(&record.file_name).await?;
        if size != record.content_length {
            return Err(TusError::ParamError(format!(
                "File {} has {} bytes, record expects {}", record.file_name, size, record.content_length
            )));
        }

        self.handle.manager.enqueue(record).await
    }

    async fn enqueue_stored(&self, record: UploadRecord) -> Result<UploadId> {
        let file_name = record.file_name.clone();
        match self.handle.manager.enqueue(record).await {
            Ok(upload_id) => Ok(upload_id),
            Err(err) => {
                self.files.delete(&file_name).await;
                Err(err)
            }
        }
    }

    /// Record currently at the head of the queue
    pub async fn current(&self) -> Result<Option<UploadRecord>> {
        self.handle.manager.current().await
    }

    pub async fn get_upload(&self, upload_id: UploadId) -> Result<Option<UploadRecord>> {
        self.handle.manager.get_upload(upload_id).await
    }

    pub async fn uploads(&self) -> Result<Vec<UploadRecord>> {
        self.handle.manager.list_uploads().await
    }

    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        self.handle.manager.cancel(upload_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.handle.manager.subscribe_events()
    }

    /// Stops the queue. An interrupted upload resumes on the next start when
    /// its record was persisted.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}
