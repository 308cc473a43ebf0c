use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::info;

use super::transfer::TransferDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bearer {
    Wlan,
    Ethernet,
    Cellular,
    Other,
}

impl Bearer {
    pub fn is_unmetered(self) -> bool {
        matches!(self, Bearer::Wlan | Bearer::Ethernet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub bearer: Bearer,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, bearer: Bearer) -> Self {
        Self {
            name: name.into(),
            bearer,
        }
    }
}

/// What the connectivity collaborator currently reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub online: bool,
    pub interfaces: Vec<NetworkInterface>,
}

impl ConnectivitySnapshot {
    pub fn offline() -> Self {
        Self::default()
    }

    pub fn online(interfaces: Vec<NetworkInterface>) -> Self {
        Self {
            online: true,
            interfaces,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub online: bool,
    pub has_unmetered_path: bool,
    pub allow_metered_upload: bool,
}

impl ConnectivityState {
    pub fn should_download(&self) -> bool {
        if !self.online {
            return false;
        }
        self.allow_metered_upload || self.has_unmetered_path
    }
}

/// Derives whether transfers may start from connectivity and policy.
///
/// Flips of the derived value are published on a watch channel. Closing the gate
/// never touches a transfer already in flight.
#[derive(Debug)]
pub struct NetworkGate {
    state: Mutex<ConnectivityState>,
    allowed: watch::Sender<bool>,
}

impl NetworkGate {
    pub fn new(allow_metered_upload: bool) -> Self {
        let (allowed, _) = watch::channel(false);
        Self {
            state: Mutex::new(ConnectivityState {
                allow_metered_upload,
                ..ConnectivityState::default()
            }),
            allowed,
        }
    }

    pub fn connectivity_changed(&self, snapshot: &ConnectivitySnapshot) -> bool {
        self.recheck(|state| {
            state.online = snapshot.online;
            state.has_unmetered_path = snapshot
                .interfaces
                .iter()
                .any(|iface| iface.bearer.is_unmetered());
        })
    }

    pub fn set_allow_metered_upload(&self, allow: bool) -> bool {
        self.recheck(|state| state.allow_metered_upload = allow)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn should_download(&self) -> bool {
        *self.allowed.borrow()
    }

    /// Both directions share one derived value.
    pub fn allows(&self, _direction: TransferDirection) -> bool {
        self.should_download()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.allowed.subscribe()
    }

    fn recheck(&self, update: impl FnOnce(&mut ConnectivityState)) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut state);
        let allowed = state.should_download();
        let flipped = self.allowed.send_if_modified(|current| {
            if *current == allowed {
                return false;
            }
            *current = allowed;
            true
        });
        if flipped {
            info!(
                allowed,
                online = state.online,
                unmetered = state.has_unmetered_path,
                allow_metered = state.allow_metered_upload,
                "transfer gate changed"
            );
        }
        allowed
    }
}
