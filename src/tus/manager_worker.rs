use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use super::errors::{Result, TusError};
use super::metadata;
use super::notify::{UploadDelegate, UploadEvent};
use super::queue::UploadQueue;
use super::record::{UploadId, UploadRecord, UploadStatus};
use super::transfer::{Transfer, TransferContext, TransferOutcome, TransferReport};
use super::types::ManagerCommand;

struct ActiveTransfer {
    upload_id: UploadId,
    run: u64,
    cancel: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Owns the queue. Commands and transfer reports are handled one at a time on
/// this task, so at most one transfer is ever running.
pub struct UploadManagerWorker {
    ctx: TransferContext,
    delegate: Arc<dyn UploadDelegate>,
    queue: UploadQueue,
    active: Option<ActiveTransfer>,
    next_run: u64,

    event_tx: broadcast::Sender<UploadEvent>,
    report_tx: mpsc::UnboundedSender<TransferReport>,
    report_rx: mpsc::UnboundedReceiver<TransferReport>,
}

impl UploadManagerWorker {
    pub(crate) async fn run(
        ctx: TransferContext,
        delegate: Arc<dyn UploadDelegate>,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let mut worker = Self::new(ctx, delegate, event_tx);

        worker.restore().await;
        worker.start_next();

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let running = match command {
                        Some(command) => worker.handle_command(command).await,
                        None => false,
                    };
                    if !running {
                        worker.stop();
                        break;
                    }
                }
                Some(report) = worker.report_rx.recv() => {
                    worker.handle_report(report).await;
                }
            }
        }

        tracing::debug!("Upload manager stopped");
    }

    fn new(ctx: TransferContext, delegate: Arc<dyn UploadDelegate>, event_tx: broadcast::Sender<UploadEvent>) -> Self {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            delegate,
            queue: UploadQueue::new(),
            active: None,
            next_run: 0,
            event_tx,
            report_tx,
            report_rx,
        }
    }

    /// Returns `false` once the worker should exit.
    async fn handle_command(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::Enqueue { record, reply } => {
                let result = self.enqueue(record).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Current { reply } => {
                let _ = reply.send(self.queue.current().cloned());
            }
            ManagerCommand::GetUpload { upload_id, reply } => {
                let _ = reply.send(self.queue.get(upload_id).cloned());
            }
            ManagerCommand::ListUploads { reply } => {
                let _ = reply.send(self.queue.iter().cloned().collect());
            }
            ManagerCommand::Cancel { upload_id, reply } => {
                let result = self.cancel(upload_id).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Shutdown { reply } => {
                self.stop();
                let _ = reply.send(());
                return false;
            }
        }

        true
    }

    /// Re-queues unfinished records left by a previous process.
    async fn restore(&mut self) {
        let records = match self.ctx.records.restore().await {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, "Failed to restore upload queue");
                self.delegate.on_failure(None, &err);
                self.emit(UploadEvent::Failed { upload_id: None, error: err.to_string() });
                return;
            }
        };

        for mut record in records.into_iter().filter(|record| !record.is_terminal()) {
            tracing::info!(
                upload_id = %record.id,
                offset = record.upload_offset,
                bytes = record.content_length,
                "Restored upload"
            );
            record.retry_count = 0;
            let upload_id = record.id;
            self.queue.enqueue(record);
            self.emit(UploadEvent::Queued { upload_id });
        }
    }

    async fn enqueue(&mut self, record: UploadRecord) -> Result<UploadId> {
        if record.is_terminal() {
            return Err(TusError::ParamError(format!("Upload {} is already {:?}", record.id, record.status)));
        }
        if self.queue.contains(record.id) {
            return Err(TusError::ParamError(format!("Upload {} is already queued", record.id)));
        }
        if record.upload_offset > record.content_length {
            return Err(TusError::OffsetMismatch {
                expected: record.content_length,
                actual: record.upload_offset,
            });
        }
        metadata::encode(&record.metadata)?;

        if let Err(err) = self.ctx.records.save(&record).await {
            tracing::warn!(upload_id = %record.id, error = %err, "Failed to persist upload record");
        }

        let upload_id = record.id;
        self.queue.enqueue(record);
        tracing::info!(upload_id = %upload_id, queued = self.queue.len(), "Upload queued");
        self.emit(UploadEvent::Queued { upload_id });
        self.start_next();

        Ok(upload_id)
    }

    async fn cancel(&mut self, upload_id: UploadId) -> Result<()> {
        let active = self.active.as_ref().filter(|active| active.upload_id == upload_id);
        if let Some(active) = active {
            active.cancel.cancel();
            if let Some(record) = self.queue.current_mut() {
                let old_state = record.status;
                record.set_status(UploadStatus::Canceled);
                self.emit_state_change(upload_id, old_state, UploadStatus::Canceled);
            }
            // the head leaves the queue once the transfer reports back
            return Ok(());
        }

        let mut record = self.queue.remove(upload_id).ok_or(TusError::NotFound(upload_id))?;
        let old_state = record.status;
        record.set_status(UploadStatus::Canceled);
        if let Err(err) = self.ctx.records.save(&record).await {
            tracing::warn!(upload_id = %upload_id, error = %err, "Failed to persist upload record");
        }

        tracing::info!(upload_id = %upload_id, "Queued upload canceled");
        self.emit_state_change(upload_id, old_state, UploadStatus::Canceled);
        self.emit(UploadEvent::Canceled { upload_id });
        self.emit_if_drained();

        Ok(())
    }

    fn start_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(record) = self.queue.current().cloned() else {
            return;
        };

        self.next_run += 1;
        let run = self.next_run;
        let upload_id = record.id;
        let cancel = CancellationToken::new();

        let transfer = Transfer::new(run, record, self.ctx.clone(), cancel.clone(), self.report_tx.clone());
        let join_handle = tokio::spawn(transfer.run());

        tracing::debug!(upload_id = %upload_id, run, "Transfer started");
        self.active = Some(ActiveTransfer {
            upload_id,
            run,
            cancel,
            join_handle,
        });
    }

    fn is_active_run(&self, run: u64, upload_id: UploadId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.run == run && active.upload_id == upload_id)
    }

    async fn handle_report(&mut self, report: TransferReport) {
        match report {
            TransferReport::Progress { run, record } => {
                if !self.is_active_run(run, record.id) {
                    tracing::debug!(upload_id = %record.id, run, "Ignoring report from finished run");
                    return;
                }
                let Some(current) = self.queue.current_mut() else {
                    return;
                };
                if current.status == UploadStatus::Canceled {
                    return;
                }

                let old_state = current.status;
                let advanced = record.upload_offset > current.upload_offset;
                *current = record;
                let (upload_id, new_state) = (current.id, current.status);
                let (bytes_uploaded, total_bytes) = (current.upload_offset, current.content_length);

                if old_state != new_state {
                    self.emit_state_change(upload_id, old_state, new_state);
                }
                if advanced {
                    self.emit(UploadEvent::Progress { upload_id, bytes_uploaded, total_bytes });
                }
            }
            TransferReport::Finished { run, record, outcome } => {
                if !self.is_active_run(run, record.id) {
                    tracing::debug!(upload_id = %record.id, run, "Ignoring report from finished run");
                    return;
                }

                self.active = None;
                let (old_state, old_offset) = self
                    .queue
                    .remove(record.id)
                    .map_or((record.status, record.upload_offset), |queued| (queued.status, queued.upload_offset));

                // the last chunk is only reported here
                if old_state != UploadStatus::Canceled && record.upload_offset > old_offset {
                    self.emit(UploadEvent::Progress {
                        upload_id: record.id,
                        bytes_uploaded: record.upload_offset,
                        total_bytes: record.content_length,
                    });
                }
                // a cancel already announced to the caller wins over a late outcome
                let (record, outcome) = if old_state == UploadStatus::Canceled {
                    self.overrule(record, outcome).await
                } else {
                    (record, outcome)
                };
                self.finish(old_state, record, outcome).await;
                self.start_next();
                self.emit_if_drained();
            }
        }
    }

    async fn overrule(&self, mut record: UploadRecord, outcome: TransferOutcome) -> (UploadRecord, TransferOutcome) {
        if record.status != UploadStatus::Canceled {
            tracing::info!(
                upload_id = %record.id,
                outcome = ?outcome,
                "Transfer finished after cancel, keeping it canceled"
            );
            record.set_status(UploadStatus::Canceled);
            if let Err(err) = self.ctx.records.save(&record).await {
                tracing::warn!(upload_id = %record.id, error = %err, "Failed to persist upload record");
            }
        }
        (record, TransferOutcome::Canceled)
    }

    /// Terminal bookkeeping for the record that just left the head.
    async fn finish(&mut self, old_state: UploadStatus, record: UploadRecord, outcome: TransferOutcome) {
        if old_state != record.status {
            self.emit_state_change(record.id, old_state, record.status);
        }

        match outcome {
            TransferOutcome::Completed => {
                self.delegate.on_success(&record);

                if !self.ctx.files.delete(&record.file_name).await {
                    tracing::warn!(upload_id = %record.id, file = %record.file_name, "Failed to delete uploaded file");
                }
                if let Err(err) = self.ctx.records.remove(record.id).await {
                    tracing::warn!(upload_id = %record.id, error = %err, "Failed to remove upload record");
                }

                self.emit(UploadEvent::Completed {
                    upload_id: record.id,
                    upload_url: record.upload_url.clone(),
                });
            }
            TransferOutcome::Failed(err) => {
                self.delegate.on_failure(Some(&record), &err);
                self.emit(UploadEvent::Failed {
                    upload_id: Some(record.id),
                    error: err.to_string(),
                });
            }
            TransferOutcome::Canceled => {
                self.emit(UploadEvent::Canceled { upload_id: record.id });
            }
        }
    }

    /// Abandons the running transfer without marking it, so it resumes on the
    /// next start.
    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::info!(upload_id = %active.upload_id, "Interrupting transfer for shutdown");
            active.join_handle.abort();
        }
    }

    fn emit_if_drained(&self) {
        if self.active.is_none() && self.queue.is_empty() {
            tracing::info!("Upload queue drained");
            self.emit(UploadEvent::Drained);
        }
    }

    fn emit_state_change(&self, upload_id: UploadId, old_state: UploadStatus, new_state: UploadStatus) {
        self.emit(UploadEvent::StateChanged {
            upload_id,
            old_state,
            new_state,
        });
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.event_tx.send(event);
    }
}
