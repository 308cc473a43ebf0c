use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::sync::transfer::{TransferDirection, TransferId, TransferSnapshot};

/// Notifications the core emits for the host (UI, tray, logs).
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    TransferAdded(TransferSnapshot),
    TransferProgress {
        id: TransferId,
        remote_path: String,
        progress: f64,
    },
    TransferCompleted {
        transfer: TransferSnapshot,
        success: bool,
    },
    DrainingChanged {
        direction: TransferDirection,
        active: bool,
    },
    ReconciliationComplete,
    FileUploaded {
        local_path: PathBuf,
    },
    ConnectionError(String),
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A host that stopped listening never blocks or fails the core.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}
