use std::{
    io,
    path::{Path, PathBuf},
};

use davsync_core::{DavClient, DavError, Reply, ReplyMeta};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::materialize::MaterializeError;
use super::paths::file_name;
use crate::open::FileOpener;

pub type TransferId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Canceled
        )
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] DavError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error("transfer was canceled")]
    Canceled,
    #[error("transfer cannot start from state {0:?}")]
    NotPending(TransferState),
}

impl TransferError {
    fn io(path: &Path, source: io::Error) -> Self {
        TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TransferError::Canceled)
    }
}

/// Read-only view of a transfer handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    pub progress: f64,
    pub direction: TransferDirection,
    pub last_modified: Option<OffsetDateTime>,
    pub state: TransferState,
}

/// One upload or download: `Pending -> Running -> {Completed, Failed, Canceled}`.
#[derive(Debug)]
pub struct TransferEntry {
    id: TransferId,
    name: String,
    local_path: PathBuf,
    remote_path: String,
    size: u64,
    progress: f64,
    direction: TransferDirection,
    last_modified: Option<OffsetDateTime>,
    state: TransferState,
    open_on_completion: bool,
    abort: Option<CancellationToken>,
}

impl TransferEntry {
    pub fn upload(id: TransferId, local_path: PathBuf, remote_path: String) -> Self {
        Self::new(
            id,
            local_path,
            remote_path,
            0,
            TransferDirection::Upload,
            false,
        )
    }

    pub fn download(
        id: TransferId,
        remote_path: String,
        local_path: PathBuf,
        size: u64,
        open_on_completion: bool,
    ) -> Self {
        Self::new(
            id,
            local_path,
            remote_path,
            size,
            TransferDirection::Download,
            open_on_completion,
        )
    }

    fn new(
        id: TransferId,
        local_path: PathBuf,
        remote_path: String,
        size: u64,
        direction: TransferDirection,
        open_on_completion: bool,
    ) -> Self {
        let name = file_name(&remote_path).unwrap_or_default().to_string();
        Self {
            id,
            name,
            local_path,
            remote_path,
            size,
            progress: 0.0,
            direction,
            last_modified: None,
            state: TransferState::Pending,
            open_on_completion,
            abort: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn last_modified(&self) -> Option<OffsetDateTime> {
        self.last_modified
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            name: self.name.clone(),
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            size: self.size,
            progress: self.progress,
            direction: self.direction,
            last_modified: self.last_modified,
            state: self.state,
        }
    }

    /// Opens the local file and issues the request.
    ///
    /// Uploads capture the local modification time first so it travels with the
    /// PUT. Downloads open (and truncate) the target for writing.
    pub async fn start_transfer(&mut self, client: &dyn DavClient) -> Result<Reply, TransferError> {
        if self.state != TransferState::Pending {
            return Err(TransferError::NotPending(self.state));
        }

        let reply = match self.open_and_issue(client).await {
            Ok(reply) => reply,
            Err(err) => {
                self.state = TransferState::Failed;
                return Err(err);
            }
        };

        self.abort = Some(reply.abort_handle());
        self.state = TransferState::Running;
        info!(
            id = self.id,
            direction = ?self.direction,
            remote = %self.remote_path,
            local = %self.local_path.display(),
            "transfer started"
        );
        Ok(reply)
    }

    async fn open_and_issue(&mut self, client: &dyn DavClient) -> Result<Reply, TransferError> {
        match self.direction {
            TransferDirection::Upload => {
                let file = tokio::fs::File::open(&self.local_path)
                    .await
                    .map_err(|err| TransferError::io(&self.local_path, err))?;
                let meta = file
                    .metadata()
                    .await
                    .map_err(|err| TransferError::io(&self.local_path, err))?;
                self.size = meta.len();
                self.last_modified = meta.modified().ok().map(OffsetDateTime::from);
                Ok(client.put(&self.remote_path, file, self.last_modified))
            }
            TransferDirection::Download => {
                if let Some(parent) = self.local_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| TransferError::io(parent, err))?;
                }
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.local_path)
                    .await
                    .map_err(|err| TransferError::io(&self.local_path, err))?;
                Ok(client.get(&self.remote_path, file))
            }
        }
    }

    /// Returns the new fraction when it differs from the previous one.
    ///
    /// An unknown total (zero) is ignored entirely.
    pub fn handle_progress_change(&mut self, transferred: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        if self.size == 0 {
            self.size = total;
        }
        let progress = transferred as f64 / total as f64;
        if progress == self.progress {
            return None;
        }
        self.progress = progress;
        debug!(id = self.id, progress, "transfer progress");
        Some(progress)
    }

    /// Aborts the in-flight request, if any. Safe before start and when repeated.
    ///
    /// A pending entry becomes `Canceled` without touching the network or disk.
    /// A running download's partial file is removed by [`TransferEntry::complete`].
    pub fn cancel_transfer(&mut self) {
        if let Some(abort) = &self.abort {
            abort.cancel();
        }
        if !self.state.is_terminal() {
            info!(id = self.id, remote = %self.remote_path, "transfer canceled");
            self.state = TransferState::Canceled;
        }
    }

    /// Applies the reply outcome and moves to a terminal state.
    pub async fn complete(
        &mut self,
        result: Result<ReplyMeta, DavError>,
        opener: &dyn FileOpener,
    ) -> Result<(), TransferError> {
        self.abort = None;

        if self.state == TransferState::Canceled || matches!(result, Err(DavError::Canceled)) {
            self.state = TransferState::Canceled;
            self.discard_partial_download().await;
            return Err(TransferError::Canceled);
        }

        match result {
            Ok(meta) => {
                if self.direction == TransferDirection::Download {
                    if let Some(size) = meta.size {
                        self.size = size;
                    }
                    if let Some(modified) = meta.last_modified {
                        self.last_modified = Some(modified);
                        if let Err(err) = apply_modified(&self.local_path, modified).await {
                            warn!(
                                local = %self.local_path.display(),
                                error = %err,
                                "failed to apply remote modification time"
                            );
                        }
                    }
                }
                self.progress = 1.0;
                self.state = TransferState::Completed;
                info!(id = self.id, remote = %self.remote_path, "transfer completed");

                if self.open_on_completion
                    && let Err(err) = opener.open(&self.local_path)
                {
                    warn!(local = %self.local_path.display(), error = %err, "failed to open file");
                }
                Ok(())
            }
            Err(err) => {
                self.state = TransferState::Failed;
                warn!(id = self.id, remote = %self.remote_path, error = %err, "transfer failed");
                self.discard_partial_download().await;
                Err(err.into())
            }
        }
    }

    /// Marks an entry that turned out to be unnecessary as done.
    pub(crate) fn mark_already_synced(&mut self) {
        self.progress = 1.0;
        self.state = TransferState::Completed;
    }

    /// Marks an entry that never reached the network as failed.
    pub(crate) fn mark_failed(&mut self) {
        self.abort = None;
        self.state = TransferState::Failed;
    }

    async fn discard_partial_download(&self) {
        if self.direction != TransferDirection::Download {
            return;
        }
        match tokio::fs::remove_file(&self.local_path).await {
            Ok(()) => debug!(local = %self.local_path.display(), "removed partial download"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                local = %self.local_path.display(),
                error = %err,
                "failed to remove partial download"
            ),
        }
    }
}

impl Drop for TransferEntry {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.cancel();
        }
    }
}

async fn apply_modified(path: &Path, modified: OffsetDateTime) -> io::Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?;
    let file = file.into_std().await;
    file.set_modified(modified.into())
}
