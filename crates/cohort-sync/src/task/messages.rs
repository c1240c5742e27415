//! Message log tasks: bundling buffered group messages into a log file and
//! replaying received log files into the local application.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cohort_core::Message;
use cohort_store::MessageLogCodec;
use tokio::sync::{mpsc, oneshot};

use super::{blocking, remove_temp, CancelToken, Task, TaskOutput};
use crate::error::{Result, SyncError};

/// Writes a batch of messages into a log file.
pub struct MessagesSaveTask {
    codec: MessageLogCodec,
    messages: Vec<Message>,
    file: PathBuf,
}

impl MessagesSaveTask {
    pub fn new(codec: MessageLogCodec, messages: Vec<Message>, file: PathBuf) -> Self {
        Self {
            codec,
            messages,
            file,
        }
    }
}

#[async_trait]
impl Task for MessagesSaveTask {
    fn name(&self) -> &'static str {
        "messages-save"
    }

    async fn execute(&mut self, _token: &CancelToken) -> Result<TaskOutput> {
        let codec = self.codec.clone();
        let messages = std::mem::take(&mut self.messages);
        let count = messages.len();
        let file = self.file.clone();

        let saved = blocking(move || codec.save(&messages, &file)).await;
        match saved {
            Ok(Ok(())) => Ok(TaskOutput::MessagesSaved {
                file: self.file.clone(),
                count,
            }),
            Ok(Err(e)) => {
                remove_temp(&self.file);
                Err(SyncError::TransportError(format!(
                    "failed to save message log {}: {e}",
                    self.file.display()
                )))
            }
            Err(e) => {
                remove_temp(&self.file);
                Err(e)
            }
        }
    }
}

/// Destination of replayed messages.
///
/// `deliver` resolves once the messages have been applied, so a load task
/// never reads ahead of the application.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, messages: Vec<Message>) -> Result<()>;
}

/// Replays log files, one file at a time, in the given order.
///
/// Each file is handed to the sink as a single batch, so at most one file's
/// messages are in memory at once.
///
/// Every file handed to the task is deleted, whether it was replayed, skipped
/// after cancellation, or failed to load.
pub struct MessagesLoadTask {
    codec: MessageLogCodec,
    files: VecDeque<PathBuf>,
    sink: Arc<dyn MessageSink>,
}

impl MessagesLoadTask {
    pub fn new(
        codec: MessageLogCodec,
        files: impl IntoIterator<Item = PathBuf>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            codec,
            files: files.into_iter().collect(),
            sink,
        }
    }

    async fn replay(&mut self, token: &CancelToken) -> Result<(usize, usize)> {
        let mut files = 0;
        let mut messages = 0;
        while let Some(file) = self.files.pop_front() {
            if token.is_canceled() {
                remove_temp(&file);
                break;
            }

            let codec = self.codec.clone();
            let path = file.clone();
            let loaded = blocking(move || codec.load(&path)).await;
            remove_temp(&file);
            let batch = loaded??;
            let count = batch.len();

            tokio::select! {
                delivered = self.sink.deliver(batch) => delivered?,
                _ = token.cancelled() => break,
            }
            files += 1;
            messages += count;
        }
        Ok((files, messages))
    }
}

#[async_trait]
impl Task for MessagesLoadTask {
    fn name(&self) -> &'static str {
        "messages-load"
    }

    async fn execute(&mut self, token: &CancelToken) -> Result<TaskOutput> {
        let replayed = self.replay(token).await;
        for file in self.files.drain(..) {
            remove_temp(&file);
        }
        let (files, messages) = replayed?;
        Ok(TaskOutput::MessagesLoaded { files, messages })
    }
}

/// A batch of replayed messages posted to the event loop.
///
/// The loop applies the messages and then answers on `ack`.
#[derive(Debug)]
pub struct ReplayBatch {
    pub messages: Vec<Message>,
    pub ack: oneshot::Sender<()>,
}

/// [`MessageSink`] that hands batches to the event loop over a channel.
#[derive(Clone)]
pub struct ReplaySink {
    batches: mpsc::UnboundedSender<ReplayBatch>,
}

impl ReplaySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplayBatch>) {
        let (batches, rx) = mpsc::unbounded_channel();
        (Self { batches }, rx)
    }
}

#[async_trait]
impl MessageSink for ReplaySink {
    async fn deliver(&self, messages: Vec<Message>) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        self.batches
            .send(ReplayBatch { messages, ack })
            .map_err(|_| SyncError::Worker("event loop stopped".into()))?;
        acked
            .await
            .map_err(|_| SyncError::Worker("replay batch dropped".into()))
    }
}
