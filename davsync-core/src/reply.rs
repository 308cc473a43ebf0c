use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::DavError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
}

/// Metadata reported by the server once a transfer has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyMeta {
    pub last_modified: Option<OffsetDateTime>,
    pub size: Option<u64>,
}

#[derive(Debug)]
pub enum ReplyEvent {
    Progress(Progress),
    Finished(Result<ReplyMeta, DavError>),
}

/// Consumer half of an in-flight GET or PUT.
///
/// Progress and completion are delivered through [`Reply::next_event`]. Dropping
/// the reply severs both subscriptions; the producer observes this through
/// [`ReplySender::aborted`] once [`Reply::abort`] has been called.
#[derive(Debug)]
pub struct Reply {
    progress: mpsc::UnboundedReceiver<Progress>,
    done: Option<oneshot::Receiver<Result<ReplyMeta, DavError>>>,
    abort: CancellationToken,
}

/// Producer half handed to the WebDAV client implementation.
#[derive(Debug)]
pub struct ReplySender {
    progress: mpsc::UnboundedSender<Progress>,
    done: oneshot::Sender<Result<ReplyMeta, DavError>>,
    abort: CancellationToken,
}

impl Reply {
    pub fn channel() -> (ReplySender, Reply) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let abort = CancellationToken::new();
        (
            ReplySender {
                progress: progress_tx,
                done: done_tx,
                abort: abort.clone(),
            },
            Reply {
                progress: progress_rx,
                done: Some(done_rx),
                abort,
            },
        )
    }

    /// A reply that has already failed, for clients that cannot even issue the request.
    pub fn failed(err: DavError) -> Reply {
        let (sender, reply) = Reply::channel();
        sender.finish(Err(err));
        reply
    }

    /// Requests an abort. Safe to call repeatedly and after completion.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_none()
    }

    /// Waits for the next progress update or the final outcome.
    ///
    /// Returns `None` once the outcome has been delivered. An aborted reply
    /// finishes with [`DavError::Canceled`] even if the producer never answers.
    pub async fn next_event(&mut self) -> Option<ReplyEvent> {
        let done = self.done.as_mut()?;
        let event = tokio::select! {
            biased;
            Some(progress) = self.progress.recv() => ReplyEvent::Progress(progress),
            result = done => {
                ReplyEvent::Finished(result.unwrap_or(Err(DavError::Disconnected)))
            }
            _ = self.abort.cancelled() => ReplyEvent::Finished(Err(DavError::Canceled)),
        };
        if matches!(event, ReplyEvent::Finished(_)) {
            self.done = None;
        }
        Some(event)
    }

    /// Drains the reply to its outcome, discarding progress.
    pub async fn finished(mut self) -> Result<ReplyMeta, DavError> {
        while let Some(event) = self.next_event().await {
            if let ReplyEvent::Finished(result) = event {
                return result;
            }
        }
        Err(DavError::Disconnected)
    }
}

impl ReplySender {
    pub fn progress(&self, transferred: u64, total: u64) {
        let _ = self.progress.send(Progress { transferred, total });
    }

    pub fn finish(self, result: Result<ReplyMeta, DavError>) {
        let _ = self.done.send(result);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub async fn aborted(&self) {
        self.abort.cancelled().await;
    }
}
