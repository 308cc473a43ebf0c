//! In-memory [`DavClient`] whose replies are scripted by the test.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use davsync_core::{DavClient, DavError, RemoteEntry, Reply, ReplyMeta, ReplySender};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use time::OffsetDateTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::paths::{normalize_dir, normalize_file};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Mkdir(String),
    Move(String, String),
    Put(String),
    Get(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    listings: HashMap<String, Vec<RemoteEntry>>,
    list_failures: HashMap<String, u16>,
    dirs: HashSet<String>,
    mkdir_failures: HashMap<String, u16>,
    put_failures: HashMap<String, (u16, u32)>,
    get_failures: HashMap<String, u16>,
    held: HashSet<String>,
    pending: HashMap<String, ReplySender>,
    uploaded: HashMap<String, (Vec<u8>, Option<OffsetDateTime>)>,
    remote_files: HashMap<String, (Vec<u8>, Option<OffsetDateTime>)>,
}

#[derive(Clone, Default)]
pub struct FakeDav {
    state: Arc<Mutex<State>>,
}

impl FakeDav {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_listing(self, dir: &str, entries: Vec<RemoteEntry>) -> Self {
        self.state().listings.insert(normalize_dir(dir), entries);
        self
    }

    pub fn with_existing_dir(self, dir: &str) -> Self {
        self.state().dirs.insert(normalize_dir(dir));
        self
    }

    pub fn with_remote_file(self, path: &str, body: &[u8], modified: Option<OffsetDateTime>) -> Self {
        self.state()
            .remote_files
            .insert(normalize_file(path), (body.to_vec(), modified));
        self
    }

    pub fn fail_list(&self, dir: &str, status: u16) {
        self.state().list_failures.insert(normalize_dir(dir), status);
    }

    pub fn fail_mkdir(&self, dir: &str, status: u16) {
        self.state().mkdir_failures.insert(normalize_dir(dir), status);
    }

    /// The next `times` PUTs to `path` fail with `status`.
    pub fn fail_put(&self, path: &str, status: u16, times: u32) {
        self.state()
            .put_failures
            .insert(normalize_file(path), (status, times));
    }

    pub fn fail_get(&self, path: &str, status: u16) {
        self.state().get_failures.insert(normalize_file(path), status);
    }

    /// Transfers to `path` stay in flight until [`FakeDav::release`] is called.
    pub fn hold(&self, path: &str) {
        self.state().held.insert(normalize_file(path));
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        self.state().pending.contains_key(&normalize_file(path))
    }

    pub fn is_aborted(&self, path: &str) -> bool {
        self.state()
            .pending
            .get(&normalize_file(path))
            .is_some_and(ReplySender::is_aborted)
    }

    pub fn progress(&self, path: &str, transferred: u64, total: u64) {
        if let Some(sender) = self.state().pending.get(&normalize_file(path)) {
            sender.progress(transferred, total);
        }
    }

    pub fn release(&self, path: &str, result: Result<ReplyMeta, DavError>) {
        let key = normalize_file(path);
        let sender = {
            let mut state = self.state();
            state.held.remove(&key);
            state.pending.remove(&key)
        };
        if let Some(sender) = sender {
            sender.finish(result);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn put_count(&self, path: &str) -> usize {
        let key = normalize_file(path);
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Put(p) if *p == key))
            .count()
    }

    pub fn uploaded(&self, path: &str) -> Option<(Vec<u8>, Option<OffsetDateTime>)> {
        self.state().uploaded.get(&normalize_file(path)).cloned()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl DavClient for FakeDav {
    fn list_directory<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<RemoteEntry>, DavError>> {
        let key = normalize_dir(path);
        self.record(Call::List(key.clone()));
        let state = self.state();
        let result = match state.list_failures.get(&key) {
            Some(status) => Err(DavError::status(*status, "listing failed")),
            None => Ok(state.listings.get(&key).cloned().unwrap_or_default()),
        };
        async move { result }.boxed()
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), DavError>> {
        let key = normalize_dir(path);
        self.record(Call::Mkdir(key.clone()));
        let mut state = self.state();
        let result = if let Some(status) = state.mkdir_failures.get(&key) {
            Err(DavError::status(*status, "mkdir failed"))
        } else if !state.dirs.insert(key) {
            Err(DavError::status(405, "Method Not Allowed"))
        } else {
            Ok(())
        };
        async move { result }.boxed()
    }

    fn move_resource<'a>(
        &'a self,
        from: &'a str,
        to: &'a str,
    ) -> BoxFuture<'a, Result<(), DavError>> {
        let (from, to) = (normalize_file(from), normalize_file(to));
        self.record(Call::Move(from.clone(), to.clone()));
        let mut state = self.state();
        let result = match state.remote_files.remove(&from) {
            Some(body) => {
                state.remote_files.insert(to, body);
                Ok(())
            }
            None => Err(DavError::status(404, "Not Found")),
        };
        async move { result }.boxed()
    }

    fn put(
        &self,
        remote_path: &str,
        mut source: File,
        last_modified: Option<OffsetDateTime>,
    ) -> Reply {
        let key = normalize_file(remote_path);
        self.record(Call::Put(key.clone()));
        let (sender, reply) = Reply::channel();

        let mut state = self.state();
        if let Some((status, remaining)) = state.put_failures.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            sender.finish(Err(DavError::status(*status, "put failed")));
            return reply;
        }
        if state.held.contains(&key) {
            state.pending.insert(key, sender);
            return reply;
        }
        drop(state);

        let fake = self.clone();
        tokio::spawn(async move {
            let mut body = Vec::new();
            if let Err(err) = source.read_to_end(&mut body).await {
                sender.finish(Err(err.into()));
                return;
            }
            let len = body.len() as u64;
            sender.progress(len / 2, len);
            sender.progress(len, len);
            fake.state().uploaded.insert(key, (body, last_modified));
            sender.finish(Ok(ReplyMeta {
                last_modified,
                size: Some(len),
            }));
        });
        reply
    }

    fn get(&self, remote_path: &str, mut sink: File) -> Reply {
        let key = normalize_file(remote_path);
        self.record(Call::Get(key.clone()));
        let (sender, reply) = Reply::channel();

        let mut state = self.state();
        if let Some(status) = state.get_failures.get(&key) {
            sender.finish(Err(DavError::status(*status, "get failed")));
            return reply;
        }
        if state.held.contains(&key) {
            state.pending.insert(key, sender);
            return reply;
        }
        let Some((body, modified)) = state.remote_files.get(&key).cloned() else {
            sender.finish(Err(DavError::status(404, "Not Found")));
            return reply;
        };
        drop(state);

        tokio::spawn(async move {
            let len = body.len() as u64;
            if let Err(err) = sink.write_all(&body).await {
                sender.finish(Err(err.into()));
                return;
            }
            if let Err(err) = sink.flush().await {
                sender.finish(Err(err.into()));
                return;
            }
            sender.progress(len, len);
            sender.finish(Ok(ReplyMeta {
                last_modified: modified,
                size: Some(len),
            }));
        });
        reply
    }
}
