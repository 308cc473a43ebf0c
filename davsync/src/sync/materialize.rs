use davsync_core::{DavClient, DavError};
use thiserror::Error;
use tracing::debug;

use super::index::RemoteIndex;
use super::paths::ancestors;

#[derive(Debug, Error)]
#[error("failed to create remote directory {path}: {source}")]
pub struct MaterializeError {
    pub path: String,
    /// Directories confirmed before the failure, shallow to deep.
    pub created: Vec<String>,
    #[source]
    pub source: DavError,
}

/// Ancestors of `target` not yet known to exist, parent before child.
pub fn missing_directories(target: &str, index: &RemoteIndex) -> Vec<String> {
    ancestors(target)
        .into_iter()
        .filter(|dir| !index.contains_dir(dir))
        .collect()
}

/// Creates `dirs` in order. An "already exists" answer counts as created.
pub async fn materialize(
    client: &dyn DavClient,
    dirs: &[String],
) -> Result<Vec<String>, MaterializeError> {
    let mut created = Vec::with_capacity(dirs.len());
    for dir in dirs {
        match client.mkdir(dir).await {
            Ok(()) => debug!(%dir, "created remote directory"),
            Err(err) if err.is_idempotent_conflict() => {
                debug!(%dir, "remote directory already exists");
            }
            Err(source) => {
                return Err(MaterializeError {
                    path: dir.clone(),
                    created,
                    source,
                });
            }
        }
        created.push(dir.clone());
    }
    Ok(created)
}
