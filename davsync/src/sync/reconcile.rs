use std::collections::VecDeque;

use davsync_core::{DavClient, DavError, RemoteEntry};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::index::RemoteIndex;
use super::paths::normalize_dir;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to create remote root {path}: {source}")]
    CreateRoot {
        path: String,
        #[source]
        source: DavError,
    },
    #[error("failed to list {path}: {source}")]
    List {
        path: String,
        #[source]
        source: DavError,
    },
    #[error("reconciliation was canceled")]
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    List(String),
    Complete,
}

/// Breadth-first walk state over the remote tree.
///
/// Pure bookkeeping: the caller performs the listings and feeds them back
/// through [`Reconciliation::on_listing`].
#[derive(Debug)]
pub struct Reconciliation {
    root: String,
    index: RemoteIndex,
    frontier: VecDeque<String>,
    complete: bool,
}

impl Reconciliation {
    pub fn begin(root: &str) -> Self {
        Self {
            root: normalize_dir(root),
            index: RemoteIndex::new(),
            frontier: VecDeque::new(),
            complete: false,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// The root exists (created, or already there): list it first.
    pub fn root_ready(&mut self) -> Step {
        self.index.insert_dir(&self.root);
        Step::List(self.root.clone())
    }

    pub fn on_listing(&mut self, parent: &str, entries: &[RemoteEntry]) -> Step {
        let parent = normalize_dir(parent);
        for entry in entries {
            if entry.is_dir {
                let dir = normalize_dir(&entry.path);
                if dir == parent || self.index.contains_dir(&dir) || self.frontier.contains(&dir)
                {
                    continue;
                }
                self.frontier.push_back(dir);
            } else {
                self.index.insert_file(&entry.path);
            }
        }
        self.advance()
    }

    fn advance(&mut self) -> Step {
        while let Some(next) = self.frontier.pop_front() {
            if self.index.insert_dir(&next) {
                return Step::List(next);
            }
        }
        self.complete = true;
        Step::Complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn pending(&self) -> usize {
        self.frontier.len()
    }

    pub fn index(&self) -> &RemoteIndex {
        &self.index
    }

    pub fn into_index(self) -> RemoteIndex {
        self.index
    }
}

/// Ensures `root` exists and walks everything below it.
///
/// The index is only returned once the whole tree has been listed; any error
/// discards what was learned so far.
pub async fn reconcile(
    client: &dyn DavClient,
    root: &str,
    cancel: &CancellationToken,
) -> Result<RemoteIndex, ReconcileError> {
    let mut walk = Reconciliation::begin(root);
    info!(root = walk.root(), "reconciling remote tree");

    let created = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ReconcileError::Canceled),
        result = client.mkdir(walk.root()) => result,
    };
    match created {
        Ok(()) => debug!(root = walk.root(), "created remote root"),
        Err(err) if err.is_idempotent_conflict() => {
            debug!(root = walk.root(), "remote root already exists");
        }
        Err(source) => {
            return Err(ReconcileError::CreateRoot {
                path: walk.root().to_string(),
                source,
            });
        }
    }

    let mut step = walk.root_ready();
    while let Step::List(path) = step {
        let listing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconcileError::Canceled),
            result = client.list_directory(&path) => result,
        };
        let entries = listing.map_err(|source| ReconcileError::List {
            path: path.clone(),
            source,
        })?;
        debug!(%path, entries = entries.len(), pending = walk.pending(), "listed remote directory");
        step = walk.on_listing(&path, &entries);
    }

    let index = walk.into_index();
    info!(
        dirs = index.dir_count(),
        files = index.file_count(),
        "remote tree reconciled"
    );
    Ok(index)
}
