use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use davsync_core::{DavClient, DavError, RemoteEntry, ReplyEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::gate::NetworkGate;
use super::index::RemoteIndex;
use super::materialize::{materialize, missing_directories};
use super::paths::{PathError, UserDirs, ancestors, download_dir_for, normalize_file, remote_path_for};
use super::transfer::{
    TransferDirection, TransferEntry, TransferError, TransferId, TransferSnapshot, TransferState,
};
use crate::events::{EventSink, SyncEvent};
use crate::open::FileOpener;

/// A remote file the host wants fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub open_on_completion: bool,
}

impl DownloadRequest {
    /// Places the file in the user directory matching its MIME type.
    pub fn for_entry(entry: &RemoteEntry, dirs: &UserDirs, open_on_completion: bool) -> Option<Self> {
        if entry.is_dir {
            return None;
        }
        let name = entry.name();
        let dir = download_dir_for(name, dirs)?;
        Some(Self {
            remote_path: normalize_file(&entry.path),
            local_path: dir.join(name),
            size: entry.size.unwrap_or(0),
            open_on_completion,
        })
    }
}

/// Optional limits layered on top of the one-requeue-per-pass rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Start a new pass this long after a pass ended on a failed item.
    pub retry_interval: Option<Duration>,
    /// Drop an upload after this many failed attempts.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub local_root: PathBuf,
    pub remote_root: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadQueueItem {
    pub id: TransferId,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Directories that must exist before the PUT, shallow to deep.
    pub ancestors: Vec<String>,
    pub attempts: u32,
    not_before_pass: u64,
}

impl UploadQueueItem {
    fn entry(&self) -> TransferEntry {
        TransferEntry::upload(self.id, self.local_path.clone(), self.remote_path.clone())
    }
}

#[derive(Debug)]
struct RunningSlot {
    snapshot: TransferSnapshot,
    abort: CancellationToken,
}

impl RunningSlot {
    fn new(entry: &TransferEntry, abort: CancellationToken) -> Self {
        let mut snapshot = entry.snapshot();
        snapshot.state = TransferState::Running;
        Self { snapshot, abort }
    }
}

#[derive(Debug)]
struct UploadLane {
    local_root: PathBuf,
    remote_root: String,
    pending: VecDeque<UploadQueueItem>,
    remote: Option<RemoteIndex>,
    running: Option<RunningSlot>,
    draining: bool,
    pass: u64,
    generation: u64,
    retry_scheduled: bool,
}

#[derive(Debug, Default)]
struct DownloadLane {
    pending: VecDeque<TransferEntry>,
    running: Option<RunningSlot>,
    draining: bool,
}

struct UploadJob {
    item: UploadQueueItem,
    dirs: Vec<String>,
    entry: TransferEntry,
    abort: CancellationToken,
    generation: u64,
}

struct UploadOutcome {
    item: UploadQueueItem,
    entry: TransferEntry,
    result: Result<(), TransferError>,
    generation: u64,
}

struct Inner {
    client: Arc<dyn DavClient>,
    gate: Arc<NetworkGate>,
    opener: Arc<dyn FileOpener>,
    events: EventSink,
    retry: RetryPolicy,
    next_id: AtomicU64,
    uploads: Mutex<UploadLane>,
    downloads: Mutex<DownloadLane>,
}

/// Upload and download queues, each drained by at most one transfer at a time.
///
/// Every lane has its own lock; none is held across a network await. Uploads
/// wait for a reconciled [`RemoteIndex`] before the first transfer starts.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransferQueue {
    pub fn new(
        client: Arc<dyn DavClient>,
        gate: Arc<NetworkGate>,
        opener: Arc<dyn FileOpener>,
        events: EventSink,
        config: QueueConfig,
    ) -> Self {
        let uploads = UploadLane {
            local_root: config.local_root,
            remote_root: config.remote_root,
            pending: VecDeque::new(),
            remote: None,
            running: None,
            draining: false,
            pass: 0,
            generation: 0,
            retry_scheduled: false,
        };
        Self {
            inner: Arc::new(Inner {
                client,
                gate,
                opener,
                events,
                retry: config.retry,
                next_id: AtomicU64::new(1),
                uploads: Mutex::new(uploads),
                downloads: Mutex::new(DownloadLane::default()),
            }),
        }
    }

    /// Queues a local file for upload. Returns `false` when it is already queued,
    /// already running, or already present on the server.
    pub fn enqueue_upload(&self, local_path: impl AsRef<Path>) -> Result<bool, PathError> {
        let local_path = local_path.as_ref().to_path_buf();
        let added = {
            let mut lane = lock(&self.inner.uploads);
            let remote_path = remote_path_for(&lane.local_root, &lane.remote_root, &local_path)?;
            let queued = lane.pending.iter().any(|item| item.local_path == local_path)
                || lane
                    .running
                    .as_ref()
                    .is_some_and(|running| running.snapshot.local_path == local_path);
            if lane
                .remote
                .as_ref()
                .is_some_and(|remote| remote.contains_file(&remote_path))
            {
                debug!(remote = %remote_path, "already on server, not queueing");
                false
            } else if queued {
                debug!(local = %local_path.display(), "upload already queued");
                false
            } else {
                let item = UploadQueueItem {
                    id: self.inner.next_id(),
                    ancestors: ancestors(&remote_path),
                    local_path,
                    remote_path,
                    attempts: 0,
                    not_before_pass: 0,
                };
                info!(local = %item.local_path.display(), remote = %item.remote_path, "queued upload");
                self.inner
                    .events
                    .emit(SyncEvent::TransferAdded(item.entry().snapshot()));
                lane.pending.push_back(item);
                true
            }
        };
        if added {
            self.inner.drain(TransferDirection::Upload);
        }
        Ok(added)
    }

    /// Queues a download unless one for the same remote path is queued or running.
    pub fn enqueue_download(&self, request: DownloadRequest) -> Option<TransferId> {
        let id = {
            let mut lane = lock(&self.inner.downloads);
            let remote_path = normalize_file(&request.remote_path);
            if lane.is_queued(&remote_path) {
                debug!(remote = %remote_path, "download already queued");
                return None;
            }
            let entry = TransferEntry::download(
                self.inner.next_id(),
                remote_path,
                request.local_path,
                request.size,
                request.open_on_completion,
            );
            info!(remote = %entry.remote_path(), local = %entry.local_path().display(), "queued download");
            self.inner
                .events
                .emit(SyncEvent::TransferAdded(entry.snapshot()));
            let id = entry.id();
            lane.pending.push_back(entry);
            id
        };
        self.inner.drain(TransferDirection::Download);
        Some(id)
    }

    /// Starts draining `direction` if nothing is running and it is allowed to.
    pub fn drain(&self, direction: TransferDirection) {
        self.inner.drain(direction);
    }

    /// Cancels a queued or running transfer. Returns `false` for unknown ids.
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        {
            let mut lane = lock(&self.inner.uploads);
            if let Some(pos) = lane.pending.iter().position(|item| item.id == id) {
                if let Some(item) = lane.pending.remove(pos) {
                    let mut entry = item.entry();
                    entry.cancel_transfer();
                    self.inner.report_completed(&entry, false);
                }
                return true;
            }
            if let Some(running) = lane.running.as_ref().filter(|r| r.snapshot.id == id) {
                info!(id, "canceling running upload");
                running.abort.cancel();
                return true;
            }
        }
        let mut lane = lock(&self.inner.downloads);
        if let Some(pos) = lane.pending.iter().position(|entry| entry.id() == id) {
            if let Some(mut entry) = lane.pending.remove(pos) {
                entry.cancel_transfer();
                self.inner.report_completed(&entry, false);
            }
            return true;
        }
        if let Some(running) = lane.running.as_ref().filter(|r| r.snapshot.id == id) {
            info!(id, "canceling running download");
            running.abort.cancel();
            return true;
        }
        false
    }

    /// Hands over a freshly reconciled index and unblocks upload draining.
    ///
    /// Ignored when the queue was reset after the reconciliation started.
    pub fn install_index(&self, generation: u64, index: RemoteIndex) -> bool {
        {
            let mut lane = lock(&self.inner.uploads);
            if lane.generation != generation {
                debug!(
                    generation,
                    current = lane.generation,
                    "ignoring stale reconciliation"
                );
                return false;
            }
            lane.remote = Some(index);
        }
        self.inner.drain(TransferDirection::Upload);
        true
    }

    /// Forgets everything learned about the server and the pending uploads.
    ///
    /// Used when connection settings change: the running upload is aborted and
    /// uploads stay blocked until a new index is installed.
    pub fn reset(&self, local_root: PathBuf, remote_root: String) -> u64 {
        let mut lane = lock(&self.inner.uploads);
        lane.generation += 1;
        lane.remote = None;
        lane.local_root = local_root;
        lane.remote_root = remote_root;
        if let Some(running) = &lane.running {
            running.abort.cancel();
        }
        let dropped: Vec<UploadQueueItem> = lane.pending.drain(..).collect();
        info!(
            generation = lane.generation,
            dropped = dropped.len(),
            "upload queue reset"
        );
        for item in dropped {
            let mut entry = item.entry();
            entry.cancel_transfer();
            self.inner.report_completed(&entry, false);
        }
        lane.generation
    }

    /// Aborts both running transfers and drops everything pending.
    pub fn shutdown(&self) {
        let (local_root, remote_root) = {
            let lane = lock(&self.inner.uploads);
            (lane.local_root.clone(), lane.remote_root.clone())
        };
        self.reset(local_root, remote_root);

        let mut lane = lock(&self.inner.downloads);
        if let Some(running) = &lane.running {
            running.abort.cancel();
        }
        for mut entry in lane.pending.drain(..) {
            entry.cancel_transfer();
            self.inner.report_completed(&entry, false);
        }
    }

    /// Records a file that appeared on the server outside the upload path.
    pub fn note_remote_file(&self, remote_path: &str) {
        let mut lane = lock(&self.inner.uploads);
        if let Some(remote) = lane.remote.as_mut() {
            remote.insert_file(remote_path);
        }
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner.uploads).generation
    }

    pub fn is_reconciled(&self) -> bool {
        lock(&self.inner.uploads).remote.is_some()
    }

    pub fn remote_index(&self) -> Option<RemoteIndex> {
        lock(&self.inner.uploads).remote.clone()
    }

    pub fn is_draining(&self, direction: TransferDirection) -> bool {
        match direction {
            TransferDirection::Upload => lock(&self.inner.uploads).draining,
            TransferDirection::Download => lock(&self.inner.downloads).draining,
        }
    }

    pub fn is_download_queued(&self, remote_path: &str) -> bool {
        lock(&self.inner.downloads).is_queued(&normalize_file(remote_path))
    }

    pub fn pending_uploads(&self) -> Vec<UploadQueueItem> {
        lock(&self.inner.uploads).pending.iter().cloned().collect()
    }

    /// Running and queued transfers, running first, uploads before downloads.
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        let mut out = Vec::new();
        {
            let lane = lock(&self.inner.uploads);
            out.extend(lane.running.as_ref().map(|r| r.snapshot.clone()));
            out.extend(lane.pending.iter().map(|item| item.entry().snapshot()));
        }
        let lane = lock(&self.inner.downloads);
        out.extend(lane.running.as_ref().map(|r| r.snapshot.clone()));
        out.extend(lane.pending.iter().map(TransferEntry::snapshot));
        out
    }
}

impl DownloadLane {
    fn is_queued(&self, remote_path: &str) -> bool {
        self.pending
            .iter()
            .any(|entry| entry.remote_path() == remote_path)
            || self
                .running
                .as_ref()
                .is_some_and(|running| running.snapshot.remote_path == remote_path)
    }
}

impl Inner {
    fn next_id(&self) -> TransferId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn report_completed(&self, entry: &TransferEntry, success: bool) {
        self.events.emit(SyncEvent::TransferCompleted {
            transfer: entry.snapshot(),
            success,
        });
    }

    fn drain(self: &Arc<Self>, direction: TransferDirection) {
        match direction {
            TransferDirection::Upload => {
                let mut lane = lock(&self.uploads);
                if lane.draining || lane.running.is_some() {
                    return;
                }
                if !self.gate.allows(direction) {
                    debug!("uploads withheld by network policy");
                    return;
                }
                if lane.remote.is_none() {
                    debug!("uploads wait for remote reconciliation");
                    return;
                }
                if lane.pending.is_empty() {
                    return;
                }
                lane.pass += 1;
                lane.draining = true;
                info!(pass = lane.pass, queued = lane.pending.len(), "upload drain started");
                self.events.emit(SyncEvent::DrainingChanged {
                    direction,
                    active: true,
                });
                tokio::spawn(Arc::clone(self).run_uploads());
            }
            TransferDirection::Download => {
                let mut lane = lock(&self.downloads);
                if lane.draining || lane.running.is_some() {
                    return;
                }
                if !self.gate.allows(direction) {
                    debug!("downloads withheld by network policy");
                    return;
                }
                if lane.pending.is_empty() {
                    return;
                }
                lane.draining = true;
                info!(queued = lane.pending.len(), "download drain started");
                self.events.emit(SyncEvent::DrainingChanged {
                    direction,
                    active: true,
                });
                tokio::spawn(Arc::clone(self).run_downloads());
            }
        }
    }

    async fn run_uploads(self: Arc<Self>) {
        while let Some(job) = self.next_upload() {
            let outcome = self.perform_upload(job).await;
            self.finish_upload(outcome);
        }
    }

    fn next_upload(self: &Arc<Self>) -> Option<UploadJob> {
        let mut lane = lock(&self.uploads);
        let job = self.pop_upload(&mut lane);
        if job.is_none() {
            self.stop_upload_drain(&mut lane);
        }
        job
    }

    fn pop_upload(&self, lane: &mut UploadLane) -> Option<UploadJob> {
        if !self.gate.allows(TransferDirection::Upload) {
            info!("network policy closed, pausing uploads");
            return None;
        }
        loop {
            let pass = lane.pass;
            let Some(pos) = lane
                .pending
                .iter()
                .position(|item| item.not_before_pass <= pass)
            else {
                if !lane.pending.is_empty() {
                    debug!(pass, "remaining uploads already failed in this pass");
                }
                return None;
            };
            // Nothing leaves the queue while the index is missing (after a reset).
            let Some(remote) = lane.remote.as_ref() else {
                debug!("remote index gone, leaving uploads queued");
                return None;
            };
            if remote.contains_file(&lane.pending[pos].remote_path) {
                let item = lane.pending.remove(pos)?;
                debug!(remote = %item.remote_path, "already on server, skipping");
                let mut entry = item.entry();
                entry.mark_already_synced();
                self.report_completed(&entry, true);
                continue;
            }
            let dirs = missing_directories(&lane.pending[pos].remote_path, remote);
            let item = lane.pending.remove(pos)?;
            let entry = item.entry();
            let abort = CancellationToken::new();
            lane.running = Some(RunningSlot::new(&entry, abort.clone()));
            return Some(UploadJob {
                item,
                dirs,
                entry,
                abort,
                generation: lane.generation,
            });
        }
    }

    fn stop_upload_drain(self: &Arc<Self>, lane: &mut UploadLane) {
        lane.draining = false;
        info!(queued = lane.pending.len(), "upload drain stopped");
        self.events.emit(SyncEvent::DrainingChanged {
            direction: TransferDirection::Upload,
            active: false,
        });

        let deferred = !lane.pending.is_empty()
            && lane
                .pending
                .iter()
                .all(|item| item.not_before_pass > lane.pass);
        if let Some(interval) = self.retry.retry_interval
            && deferred
            && !lane.retry_scheduled
        {
            lane.retry_scheduled = true;
            debug!(?interval, "scheduling next upload pass");
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                lock(&inner.uploads).retry_scheduled = false;
                inner.drain(TransferDirection::Upload);
            });
        }
    }

    async fn perform_upload(&self, job: UploadJob) -> UploadOutcome {
        let UploadJob {
            item,
            dirs,
            mut entry,
            abort,
            generation,
        } = job;

        if !dirs.is_empty() {
            let created = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                result = materialize(self.client.as_ref(), &dirs) => Some(result),
            };
            let failure = match created {
                None => {
                    entry.cancel_transfer();
                    Some(TransferError::Canceled)
                }
                Some(Ok(created)) => {
                    self.record_dirs(generation, &created);
                    None
                }
                Some(Err(err)) => {
                    warn!(error = %err, remote = %item.remote_path, "could not prepare remote directories");
                    self.record_dirs(generation, &err.created);
                    entry.mark_failed();
                    Some(err.into())
                }
            };
            if let Some(err) = failure {
                return UploadOutcome {
                    item,
                    entry,
                    result: Err(err),
                    generation,
                };
            }
        }

        let result = self.drive(&mut entry, &abort).await;
        UploadOutcome {
            item,
            entry,
            result,
            generation,
        }
    }

    fn record_dirs(&self, generation: u64, dirs: &[String]) {
        let mut lane = lock(&self.uploads);
        if lane.generation != generation {
            return;
        }
        if let Some(remote) = lane.remote.as_mut() {
            for dir in dirs {
                remote.insert_dir(dir);
            }
        }
    }

    fn finish_upload(&self, outcome: UploadOutcome) {
        let UploadOutcome {
            mut item,
            entry,
            result,
            generation,
        } = outcome;
        let mut lane = lock(&self.uploads);
        lane.running = None;

        if lane.generation != generation {
            debug!(remote = %item.remote_path, "dropping outcome from previous settings");
            self.report_completed(&entry, result.is_ok());
            return;
        }

        match result {
            Ok(()) => {
                if let Some(remote) = lane.remote.as_mut() {
                    for dir in &item.ancestors {
                        remote.insert_dir(dir);
                    }
                    remote.insert_file(&item.remote_path);
                }
                self.report_completed(&entry, true);
                self.events.emit(SyncEvent::FileUploaded {
                    local_path: item.local_path,
                });
            }
            Err(err) if err.is_canceled() => {
                self.report_completed(&entry, false);
            }
            Err(err) => {
                self.report_completed(&entry, false);
                item.attempts += 1;
                if self
                    .retry
                    .max_attempts
                    .is_some_and(|max| item.attempts >= max)
                {
                    warn!(
                        local = %item.local_path.display(),
                        attempts = item.attempts,
                        error = %err,
                        "giving up on upload"
                    );
                    return;
                }
                debug!(local = %item.local_path.display(), attempts = item.attempts, "requeueing failed upload");
                item.not_before_pass = lane.pass + 1;
                lane.pending.push_back(item);
            }
        }
    }

    async fn run_downloads(self: Arc<Self>) {
        while let Some((mut entry, abort)) = self.next_download() {
            let result = self.drive(&mut entry, &abort).await;
            self.finish_download(entry, result);
        }
    }

    fn next_download(&self) -> Option<(TransferEntry, CancellationToken)> {
        let mut lane = lock(&self.downloads);
        let next = if self.gate.allows(TransferDirection::Download) {
            lane.pending.pop_front()
        } else {
            info!("network policy closed, pausing downloads");
            None
        };
        match next {
            Some(entry) => {
                let abort = CancellationToken::new();
                lane.running = Some(RunningSlot::new(&entry, abort.clone()));
                Some((entry, abort))
            }
            None => {
                lane.draining = false;
                info!(queued = lane.pending.len(), "download drain stopped");
                self.events.emit(SyncEvent::DrainingChanged {
                    direction: TransferDirection::Download,
                    active: false,
                });
                None
            }
        }
    }

    fn finish_download(&self, entry: TransferEntry, result: Result<(), TransferError>) {
        let mut lane = lock(&self.downloads);
        lane.running = None;
        if let Err(err) = &result
            && !err.is_canceled()
        {
            warn!(remote = %entry.remote_path(), error = %err, "download failed");
        }
        self.report_completed(&entry, result.is_ok());
    }

    /// Runs one transfer to its terminal state, forwarding progress.
    async fn drive(
        &self,
        entry: &mut TransferEntry,
        abort: &CancellationToken,
    ) -> Result<(), TransferError> {
        if abort.is_cancelled() {
            entry.cancel_transfer();
            return Err(TransferError::Canceled);
        }
        let mut reply = entry.start_transfer(self.client.as_ref()).await?;
        loop {
            let event = tokio::select! {
                biased;
                _ = abort.cancelled(), if !reply.is_aborted() => {
                    entry.cancel_transfer();
                    continue;
                }
                event = reply.next_event() => event,
            };
            match event {
                Some(ReplyEvent::Progress(progress)) => {
                    if let Some(fraction) =
                        entry.handle_progress_change(progress.transferred, progress.total)
                    {
                        self.note_progress(entry, fraction);
                    }
                }
                Some(ReplyEvent::Finished(result)) => {
                    return entry.complete(result, self.opener.as_ref()).await;
                }
                None => {
                    return entry
                        .complete(Err(DavError::Disconnected), self.opener.as_ref())
                        .await;
                }
            }
        }
    }

    fn note_progress(&self, entry: &TransferEntry, progress: f64) {
        let update = |running: &mut Option<RunningSlot>| {
            if let Some(slot) = running.as_mut().filter(|slot| slot.snapshot.id == entry.id()) {
                slot.snapshot.progress = progress;
                slot.snapshot.size = entry.size();
            }
        };
        match entry.direction() {
            TransferDirection::Upload => update(&mut lock(&self.uploads).running),
            TransferDirection::Download => update(&mut lock(&self.downloads).running),
        }
        self.events.emit(SyncEvent::TransferProgress {
            id: entry.id(),
            remote_path: entry.remote_path().to_string(),
            progress,
        });
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
