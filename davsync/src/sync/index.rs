use std::collections::HashSet;

use super::paths::{normalize_dir, normalize_file};

/// Remote paths known to exist: the existing-directory and existing-file sets.
///
/// Both sets only grow. A path is never recorded as both a file and a directory;
/// the first classification wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteIndex {
    dirs: HashSet<String>,
    files: HashSet<String>,
}

impl RemoteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_dir(&mut self, path: &str) -> bool {
        let key = normalize_dir(path);
        if self.files.contains(&normalize_file(&key)) {
            return false;
        }
        self.dirs.insert(key)
    }

    pub fn insert_file(&mut self, path: &str) -> bool {
        let key = normalize_file(path);
        if self.dirs.contains(&normalize_dir(&key)) {
            return false;
        }
        self.files.insert(key)
    }

    pub fn contains_dir(&self, path: &str) -> bool {
        self.dirs.contains(&normalize_dir(path))
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains(&normalize_file(path))
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
