use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use davsync_core::{DavClient, DavError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::events::{EventSink, SyncEvent};
use crate::open::FileOpener;
use crate::sync::gate::{ConnectivitySnapshot, ConnectivityState, NetworkGate};
use crate::sync::index::RemoteIndex;
use crate::sync::paths::{PathError, normalize_file};
use crate::sync::queue::{DownloadRequest, QueueConfig, TransferQueue};
use crate::sync::reconcile::{ReconcileError, reconcile};
use crate::sync::transfer::{TransferDirection, TransferId, TransferSnapshot};

struct ReconcileTask {
    generation: u64,
    cancel: CancellationToken,
}

struct CoreInner {
    client: Arc<dyn DavClient>,
    gate: Arc<NetworkGate>,
    queue: TransferQueue,
    events: EventSink,
    settings: Mutex<SyncSettings>,
    reconciling: Mutex<Option<ReconcileTask>>,
    shutdown: CancellationToken,
}

/// Entry point for hosts: wires the gate, the reconciler and the queue together.
///
/// Cloning is cheap; all clones drive the same core.
#[derive(Clone)]
pub struct SyncCore {
    inner: Arc<CoreInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncCore {
    /// Must be called inside a Tokio runtime; a task watching the network gate
    /// is spawned right away.
    pub fn new(
        client: Arc<dyn DavClient>,
        settings: SyncSettings,
        opener: Arc<dyn FileOpener>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, rx) = EventSink::channel();
        let gate = Arc::new(NetworkGate::new(settings.allow_metered_upload));
        let queue = TransferQueue::new(
            client.clone(),
            gate.clone(),
            opener,
            events.clone(),
            QueueConfig {
                local_root: settings.local_root.clone(),
                remote_root: settings.remote_root.clone(),
                retry: settings.retry_policy(),
            },
        );
        let allowed = gate.subscribe();
        let core = Self {
            inner: Arc::new(CoreInner {
                client,
                gate,
                queue,
                events,
                settings: Mutex::new(settings),
                reconciling: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        };
        tokio::spawn(core.clone().watch_gate(allowed));
        (core, rx)
    }

    async fn watch_gate(self, mut allowed: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                changed = allowed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *allowed.borrow_and_update() {
                        self.resume();
                    } else {
                        info!("transfers paused by network policy");
                    }
                }
            }
        }
        debug!("gate watcher stopped");
    }

    fn resume(&self) {
        if !self.inner.queue.is_reconciled() {
            self.start_reconciliation();
        }
        self.inner.queue.drain(TransferDirection::Upload);
        self.inner.queue.drain(TransferDirection::Download);
    }

    /// Feeds a new connectivity report into the gate.
    pub fn connectivity_changed(&self, snapshot: &ConnectivitySnapshot) {
        self.inner.gate.connectivity_changed(snapshot);
        if snapshot.online && !self.inner.queue.is_reconciled() {
            self.start_reconciliation();
        }
    }

    pub fn set_allow_metered_upload(&self, allow: bool) {
        lock(&self.inner.settings).allow_metered_upload = allow;
        self.inner.gate.set_allow_metered_upload(allow);
    }

    /// Replaces the settings. A different local or remote root invalidates
    /// everything known about the server and starts a fresh reconciliation.
    ///
    /// Retry knobs are fixed when the core is built.
    pub fn apply_settings(&self, settings: SyncSettings) {
        let roots_changed = {
            let mut current = lock(&self.inner.settings);
            let changed = current.local_root != settings.local_root
                || current.remote_root != settings.remote_root;
            *current = settings.clone();
            changed
        };
        self.inner
            .gate
            .set_allow_metered_upload(settings.allow_metered_upload);
        if !roots_changed {
            return;
        }

        info!(
            local = %settings.local_root.display(),
            remote = %settings.remote_root,
            "sync roots changed"
        );
        if let Some(task) = lock(&self.inner.reconciling).take() {
            task.cancel.cancel();
        }
        self.inner
            .queue
            .reset(settings.local_root, settings.remote_root);
        self.start_reconciliation();
    }

    /// Walks the remote tree again. Returns `false` when offline or when a walk
    /// for the current settings is already running.
    pub fn reconcile(&self) -> bool {
        self.start_reconciliation()
    }

    fn start_reconciliation(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        if !self.inner.gate.state().online {
            debug!("offline, reconciliation deferred");
            return false;
        }
        let generation = self.inner.queue.generation();
        let cancel = {
            let mut slot = lock(&self.inner.reconciling);
            if slot.as_ref().is_some_and(|task| task.generation == generation) {
                debug!(generation, "reconciliation already running");
                return false;
            }
            if let Some(stale) = slot.take() {
                stale.cancel.cancel();
            }
            let cancel = self.inner.shutdown.child_token();
            *slot = Some(ReconcileTask {
                generation,
                cancel: cancel.clone(),
            });
            cancel
        };
        let root = lock(&self.inner.settings).remote_root.clone();
        tokio::spawn(self.clone().run_reconciliation(generation, root, cancel));
        true
    }

    async fn run_reconciliation(self, generation: u64, root: String, cancel: CancellationToken) {
        let result = reconcile(self.inner.client.as_ref(), &root, &cancel).await;
        match result {
            Ok(index) => {
                if self.inner.queue.install_index(generation, index) {
                    self.inner.events.emit(SyncEvent::ReconciliationComplete);
                }
            }
            Err(ReconcileError::Canceled) => debug!(%root, "reconciliation canceled"),
            Err(err) => {
                warn!(%root, error = %err, "reconciliation failed");
                self.inner
                    .events
                    .emit(SyncEvent::ConnectionError(err.to_string()));
            }
        }
        // Cleared after the index is installed so a concurrent resume never
        // sees neither a walk nor an index.
        let mut slot = lock(&self.inner.reconciling);
        if slot.as_ref().is_some_and(|task| task.generation == generation) {
            *slot = None;
        }
    }

    pub fn enqueue_upload(&self, local_path: impl AsRef<Path>) -> Result<bool, PathError> {
        self.inner.queue.enqueue_upload(local_path)
    }

    pub fn enqueue_download(&self, request: DownloadRequest) -> Option<TransferId> {
        self.inner.queue.enqueue_download(request)
    }

    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        self.inner.queue.cancel_transfer(id)
    }

    /// Moves a remote file and records the destination as present.
    pub async fn move_remote(&self, from: &str, to: &str) -> Result<(), DavError> {
        self.inner.client.move_resource(from, to).await?;
        info!(%from, %to, "moved remote file");
        self.inner.queue.note_remote_file(&normalize_file(to));
        Ok(())
    }

    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.inner.queue.transfers()
    }

    pub fn is_reconciled(&self) -> bool {
        self.inner.queue.is_reconciled()
    }

    /// What the last completed reconciliation (plus later uploads) knows exists.
    pub fn remote_index(&self) -> Option<RemoteIndex> {
        self.inner.queue.remote_index()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.gate.state()
    }

    pub fn settings(&self) -> SyncSettings {
        lock(&self.inner.settings).clone()
    }

    /// Stops the watcher, cancels any walk, and aborts running transfers.
    pub fn shutdown(&self) {
        info!("shutting down sync core");
        self.inner.shutdown.cancel();
        lock(&self.inner.reconciling).take();
        self.inner.queue.shutdown();
    }
}

#[cfg(test)]
#[path = "core_tests.rs"]
mod tests;
