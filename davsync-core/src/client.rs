use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tokio::fs::File;

use crate::{DavError, Reply};

/// One item of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub last_modified: Option<OffsetDateTime>,
}

impl RemoteEntry {
    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            size: None,
            last_modified: None,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size: None,
            last_modified: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_modified(mut self, modified: OffsetDateTime) -> Self {
        self.last_modified = Some(modified);
        self
    }

    pub fn name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

/// The WebDAV protocol implementation the transfer core drives.
///
/// Paths are absolute remote paths (`/App/photo.jpg`). Timeouts are the
/// implementation's concern and surface as ordinary errors.
pub trait DavClient: Send + Sync {
    /// Lists the direct children of `path`. The listed directory itself may be included.
    fn list_directory<'a>(&'a self, path: &'a str)
    -> BoxFuture<'a, Result<Vec<RemoteEntry>, DavError>>;

    /// Creates a collection. An existing collection yields a 405 status error.
    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), DavError>>;

    fn move_resource<'a>(&'a self, from: &'a str, to: &'a str)
    -> BoxFuture<'a, Result<(), DavError>>;

    /// Streams `source` to `remote_path`, attaching `last_modified` as remote metadata.
    fn put(&self, remote_path: &str, source: File, last_modified: Option<OffsetDateTime>)
    -> Reply;

    /// Streams `remote_path` into `sink`. The final [`crate::ReplyMeta`] carries the
    /// remote modification time when the server reports one.
    fn get(&self, remote_path: &str, sink: File) -> Reply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_ignores_trailing_slash() {
        assert_eq!(RemoteEntry::dir("/App/sub/").name(), "sub");
        assert_eq!(RemoteEntry::file("/App/a.txt").name(), "a.txt");
    }
}
