//! The state machine driving a single upload.
//!
//! A [`Transfer`] owns its [`UploadRecord`] for as long as it runs. One driver
//! loop issues a request for the current state, waits for its completion, and
//! feeds it to [`Transfer::handle_completion`], which is the only place state
//! and offset change. Requests never overlap, so a completion can only be
//! stale if it belongs to an earlier state or arrives after cancellation; both
//! are detected through the [`Ticket`] taken when the request was sent.

use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::config::ClientConfig;
use super::chunks;
use super::constants::{HEADER_LOCATION, HEADER_UPLOAD_OFFSET};
use super::errors::{Result, TusError};
use super::persistence::RecordStore;
use super::record::{UploadId, UploadRecord, UploadStatus};
use super::request::{self, UploadRequest};
use super::storage::FileStore;
use super::transport::{Transport, TransportResponse};

/// Collaborators shared by every transfer of one client.
#[derive(Clone)]
pub struct TransferContext {
    pub config: Arc<ClientConfig>,
    pub transport: Arc<dyn Transport>,
    pub files: Arc<dyn FileStore>,
    pub records: Arc<dyn RecordStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Creating,
    /// Asking the server for the offset of a resumed upload
    Resuming,
    /// Reading the source and cutting it into chunks
    Preparing,
    Uploading {
        position: usize,
    },
    Completed,
    Failed,
    Canceled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Identifies the exchange a completion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    upload_id: UploadId,
    state: TransferState,
    offset: u64,
}

#[derive(Debug)]
pub enum Step {
    /// State or record changed
    Advanced,
    /// Transient failure, the same request may be sent again
    Retry(TusError),
    /// Completion did not match the expected exchange
    Ignored,
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    Failed(TusError),
    Canceled,
}

#[derive(Debug)]
pub enum TransferReport {
    /// The record was persisted with new progress or status
    Progress {
        run: u64,
        record: UploadRecord,
    },
    /// Sent exactly once, last
    Finished {
        run: u64,
        record: UploadRecord,
        outcome: TransferOutcome,
    },
}

pub struct Transfer {
    run: u64,
    record: UploadRecord,
    state: TransferState,
    chunks: Vec<Bytes>,
    failure: Option<TusError>,
    ctx: TransferContext,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<TransferReport>,
}

impl Transfer {
    pub fn new(
        run: u64,
        record: UploadRecord,
        ctx: TransferContext,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<TransferReport>,
    ) -> Self {
        Self {
            run,
            record,
            state: TransferState::Idle,
            chunks: Vec::new(),
            failure: None,
            ctx,
            cancel,
            reports,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn record(&self) -> &UploadRecord {
        &self.record
    }

    pub fn ticket(&self) -> Ticket {
        Ticket {
            upload_id: self.record.id,
            state: self.state,
            offset: self.record.upload_offset,
        }
    }

    /// Drives the upload to a terminal state and reports the outcome.
    pub async fn run(mut self) {
        tracing::info!(
            upload_id = %self.record.id,
            bytes = self.record.content_length,
            offset = self.record.upload_offset,
            remaining = self.record.remaining(),
            "Starting transfer"
        );

        while !self.state.is_terminal() {
            if self.cancel.is_cancelled() {
                self.cancel_now();
                break;
            }

            match self.state {
                TransferState::Idle => {
                    self.state = if self.record.upload_url.is_some() {
                        TransferState::Resuming
                    } else {
                        TransferState::Creating
                    };
                }
                TransferState::Preparing => self.prepare().await,
                _ => self.exchange().await,
            }
        }

        self.finish().await;
    }

    fn build_request(&self) -> Result<UploadRequest> {
        let config = &self.ctx.config;
        match self.state {
            TransferState::Creating => request::create(&self.record, config),
            TransferState::Resuming => request::head(&self.record, config),
            TransferState::Uploading { position } => {
                let chunk = self.chunks.get(position).cloned().ok_or_else(|| {
                    TusError::internal_error(format!("chunk {} out of {}", position, self.chunks.len()))
                })?;
                request::patch(&self.record, chunk, config)
            }
            state => Err(TusError::internal_error(format!("no request for state {:?}", state))),
        }
    }

    /// One request/response round trip for the current state.
    async fn exchange(&mut self) {
        let first_chunk = matches!(self.state, TransferState::Uploading { .. })
            && self.record.status != UploadStatus::Uploading;
        if first_chunk {
            self.record.set_status(UploadStatus::Uploading);
            self.persist().await;
        }

        let request = match self.build_request() {
            Ok(request) => request,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        if let TransferState::Uploading { position } = self.state {
            tracing::info!(
                upload_id = %self.record.id,
                chunk = position + 1,
                chunks = self.chunks.len(),
                offset = self.record.upload_offset,
                "Uploading chunk"
            );
        }

        let ticket = self.ticket();
        let completion = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            completion = self.ctx.transport.execute(request) => Some(completion),
        };

        let Some(completion) = completion else {
            self.cancel_now();
            return;
        };

        match self.handle_completion(ticket, completion) {
            Step::Advanced => {
                if !self.state.is_terminal() {
                    self.persist().await;
                }
            }
            Step::Retry(err) => self.backoff(err).await,
            Step::Ignored => {
                if self.cancel.is_cancelled() {
                    self.cancel_now();
                }
            }
        }
    }

    /// Applies one transport completion. Completions for another upload, an
    /// earlier state or offset, or arriving after cancellation change nothing.
    pub fn handle_completion(&mut self, ticket: Ticket, completion: Result<TransportResponse>) -> Step {
        if self.cancel.is_cancelled() || self.state.is_terminal() || ticket != self.ticket() {
            tracing::debug!(upload_id = %self.record.id, ?ticket, state = ?self.state, "Ignoring stale completion");
            return Step::Ignored;
        }

        let response = match completion {
            Ok(response) => response,
            Err(err) if self.state == TransferState::Creating => return self.fail(err),
            Err(err) => return Step::Retry(err),
        };

        match self.state {
            TransferState::Creating => self.on_created(response),
            TransferState::Resuming => self.on_head(response),
            TransferState::Uploading { position } => self.on_patched(position, response),
            _ => Step::Ignored,
        }
    }

    fn on_created(&mut self, response: TransportResponse) -> Step {
        if response.status != 201 {
            return self.fail(response.status_error("Failed to create upload"));
        }

        let url = match response.header(HEADER_LOCATION) {
            Some(location) => self.ctx.config.endpoint.join(location),
            None => return self.fail(TusError::MissingHeader(HEADER_LOCATION)),
        };
        let result = url
            .map_err(TusError::from)
            .and_then(|url| self.record.set_location(url));
        if let Err(err) = result {
            return self.fail(err);
        }

        tracing::info!(
            upload_id = %self.record.id,
            url = %self.record.upload_url.as_ref().map(|url| url.as_str()).unwrap_or_default(),
            "Upload created"
        );
        self.state = TransferState::Preparing;
        Step::Advanced
    }

    fn on_head(&mut self, response: TransportResponse) -> Step {
        match response.status {
            200 | 204 => {}
            500..=599 => return Step::Retry(response.status_error("Failed to get upload offset")),
            _ => return self.fail(response.status_error("Failed to get upload offset")),
        }

        let offset = match response.offset_header(HEADER_UPLOAD_OFFSET) {
            Ok(offset) => offset,
            Err(err) => return self.fail(err),
        };
        if let Err(err) = self.record.advance_offset(offset) {
            return self.fail(err);
        }

        tracing::info!(upload_id = %self.record.id, offset, "Resuming upload");
        self.state = TransferState::Preparing;
        Step::Advanced
    }

    fn on_patched(&mut self, position: usize, response: TransportResponse) -> Step {
        if !response.is_success() {
            if (500..600).contains(&response.status) {
                return Step::Retry(response.status_error(format!("Chunk {} failed", position + 1)));
            }
            return self.fail(response.status_error(format!("Chunk {} rejected", position + 1)));
        }

        let chunk_len = self.chunks.get(position).map_or(0, |chunk| chunk.len() as u64);
        let expected = self.record.upload_offset + chunk_len;
        let last = position + 1 == self.chunks.len();

        let offset = match response.offset_header(HEADER_UPLOAD_OFFSET) {
            Ok(offset) => offset,
            Err(TusError::MissingHeader(_)) if last && response.status == 204 => expected,
            Err(err) => return self.fail(err),
        };

        if last && offset != self.record.content_length {
            return self.fail(TusError::UploadIncomplete {
                expected: self.record.content_length,
                actual: offset,
            });
        }
        if offset != expected {
            return self.fail(TusError::OffsetMismatch { expected, actual: offset });
        }
        if let Err(err) = self.record.advance_offset(offset) {
            return self.fail(err);
        }

        if last {
            self.complete();
        } else {
            self.state = TransferState::Uploading { position: position + 1 };
        }
        Step::Advanced
    }

    /// Reads the source once and fixes the chunk set for the rest of the transfer.
    async fn prepare(&mut self) {
        tracing::info!(upload_id = %self.record.id, file = %self.record.file_name, "Preparing upload data");

        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            data = self.ctx.files.read(&self.record.file_name) => Some(data),
        };

        let data = match read {
            None => return self.cancel_now(),
            Some(Ok(data)) => data,
            Some(Err(err)) => {
                self.fail(err);
                return;
            }
        };

        if data.len() as u64 != self.record.content_length {
            self.fail(TusError::ParamError(format!(
                "{} is {} bytes, expected {}",
                self.record.file_name,
                data.len(),
                self.record.content_length
            )));
            return;
        }

        let chunk_size = match self.ctx.config.chunk_size() {
            Ok(chunk_size) => chunk_size,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        let remaining = data.slice(self.record.upload_offset as usize..);
        self.chunks = chunks::split(remaining, chunk_size).collect();

        if self.chunks.is_empty() {
            self.complete();
        } else {
            self.state = TransferState::Uploading { position: 0 };
        }
    }

    async fn backoff(&mut self, error: TusError) {
        let Some(delay) = self.ctx.config.retry.next_delay(&error, self.record.retry_count) else {
            self.fail(error);
            return;
        };

        self.record.retry_count += 1;
        tracing::warn!(
            upload_id = %self.record.id,
            attempt = self.record.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying request"
        );
        self.persist().await;

        let canceled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if canceled {
            self.cancel_now();
        }
    }

    fn complete(&mut self) {
        self.state = TransferState::Completed;
        self.record.set_status(UploadStatus::Completed);
        tracing::info!(upload_id = %self.record.id, bytes = self.record.content_length, "Upload finished");
    }

    fn fail(&mut self, error: TusError) -> Step {
        tracing::warn!(upload_id = %self.record.id, state = ?self.state, error = %error, "Transfer failed");
        self.state = TransferState::Failed;
        self.record.fail(&error);
        self.failure = Some(error);
        Step::Advanced
    }

    fn cancel_now(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!(upload_id = %self.record.id, "Transfer canceled");
        self.state = TransferState::Canceled;
        self.record.set_status(UploadStatus::Canceled);
    }

    async fn persist(&self) {
        if let Err(err) = self.ctx.records.save(&self.record).await {
            tracing::warn!(upload_id = %self.record.id, error = %err, "Failed to persist upload record");
        }
        let _ = self.reports.send(TransferReport::Progress {
            run: self.run,
            record: self.record.clone(),
        });
    }

    async fn finish(mut self) {
        if let Err(err) = self.ctx.records.save(&self.record).await {
            tracing::warn!(upload_id = %self.record.id, error = %err, "Failed to persist upload record");
        }

        let outcome = match self.state {
            TransferState::Completed => TransferOutcome::Completed,
            TransferState::Canceled => TransferOutcome::Canceled,
            _ => TransferOutcome::Failed(
                self.failure
                    .take()
                    .unwrap_or_else(|| TusError::internal_error("transfer stopped without a result")),
            ),
        };

        let _ = self.reports.send(TransferReport::Finished {
            run: self.run,
            record: self.record,
            outcome,
        });
    }
}
