use std::sync::Arc;
use tokio::sync::{oneshot, mpsc, broadcast};
use tokio::task::JoinHandle;
use super::manager_worker::UploadManagerWorker;
use super::notify::{UploadDelegate, UploadEvent};
use super::record::{UploadId, UploadRecord};
use super::transfer::TransferContext;
use super::types::ManagerCommand;
use super::errors::{Result, TusError};

/// Handle to the upload queue. Cheap to clone; every clone talks to the same
/// worker task.
#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// Upload manager plus the worker task driving it
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    pub async fn shutdown(self) -> Result<()> {
        self.manager.shutdown().await?;
        self.worker_handle.await
            .map_err(|err| TusError::InternalError(format!("Worker panic: {}", err)))
    }
}

impl UploadManager {
    /// Starts the worker, which first restores persisted uploads.
    pub fn spawn(ctx: TransferContext, delegate: Arc<dyn UploadDelegate>) -> UploadManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(UploadManagerWorker::run(
            ctx,
            delegate,
            command_rx,
            event_tx.clone(),
        ));

        let manager = Self {
            command_tx,
            event_tx,
        };

        UploadManagerHandle {
            manager,
            worker_handle,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| TusError::internal_error("Manager shut down"))?;

        reply_rx
            .await
            .map_err(|err| TusError::internal_error(err.to_string()))
    }

    /// Appends a record. It starts right away when nothing else is uploading.
    pub async fn enqueue(&self, record: UploadRecord) -> Result<UploadId> {
        self.request(|reply| ManagerCommand::Enqueue { record, reply }).await?
    }

    /// The record at the head of the queue, if any
    pub async fn current(&self) -> Result<Option<UploadRecord>> {
        self.request(|reply| ManagerCommand::Current { reply }).await
    }

    pub async fn get_upload(&self, upload_id: UploadId) -> Result<Option<UploadRecord>> {
        self.request(|reply| ManagerCommand::GetUpload { upload_id, reply }).await
    }

    pub async fn list_uploads(&self) -> Result<Vec<UploadRecord>> {
        self.request(|reply| ManagerCommand::ListUploads { reply }).await
    }

    /// Cancel upload
    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Cancel { upload_id, reply }).await?
    }

    /// Stops the worker. An interrupted transfer keeps its persisted progress.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|reply| ManagerCommand::Shutdown { reply }).await {
            Ok(()) => Ok(()),
            // already stopped
            Err(TusError::InternalError(_)) if self.command_tx.is_closed() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// 订阅事件
    ///
    /// Slow receivers may observe `RecvError::Lagged` and miss events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F> {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter
        }
    }
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
