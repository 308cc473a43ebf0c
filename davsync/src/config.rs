use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, ensure};

use crate::sync::paths::{default_remote_root, normalize_dir};
use crate::sync::queue::RetryPolicy;

pub const LOCAL_ROOT_ENV: &str = "DAVSYNC_LOCAL_ROOT";
pub const REMOTE_ROOT_ENV: &str = "DAVSYNC_REMOTE_ROOT";
pub const ALLOW_METERED_ENV: &str = "DAVSYNC_ALLOW_METERED_UPLOAD";
pub const RETRY_SECS_ENV: &str = "DAVSYNC_RETRY_SECS";
pub const MAX_ATTEMPTS_ENV: &str = "DAVSYNC_MAX_UPLOAD_ATTEMPTS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Local directory whose files are uploaded.
    pub local_root: PathBuf,
    /// Remote directory mirroring `local_root`, always ending in `/`.
    pub remote_root: String,
    pub allow_metered_upload: bool,
    pub retry_interval: Option<Duration>,
    pub max_upload_attempts: Option<u32>,
}

impl SyncSettings {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: &str) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: normalize_dir(remote_root),
            allow_metered_upload: false,
            retry_interval: None,
            max_upload_attempts: None,
        }
    }

    /// Reads the `DAVSYNC_*` variables, defaulting the local root to the
    /// Pictures directory and the remote root to the device name.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), dirs::home_dir())
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        home: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let local_root = match lookup(LOCAL_ROOT_ENV) {
            Some(value) => {
                let home = home.context("cannot expand local root without a home directory")?;
                expand_with_home(value.trim(), &home)
            }
            None => dirs::picture_dir()
                .with_context(|| format!("no pictures directory; set {LOCAL_ROOT_ENV}"))?,
        };
        ensure!(
            local_root.is_absolute(),
            "{LOCAL_ROOT_ENV} must be absolute, got {}",
            local_root.display()
        );

        let remote_root = lookup(REMOTE_ROOT_ENV)
            .map(|value| value.trim().to_string())
            .unwrap_or_else(default_remote_root);
        ensure!(
            remote_root.starts_with('/'),
            "{REMOTE_ROOT_ENV} must start with '/', got {remote_root:?}"
        );

        let retry_interval = match read_u64_env(&lookup, RETRY_SECS_ENV, 0) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let max_upload_attempts = match read_u64_env(&lookup, MAX_ATTEMPTS_ENV, 0) {
            0 => None,
            attempts => Some(
                u32::try_from(attempts)
                    .with_context(|| format!("{MAX_ATTEMPTS_ENV} is out of range"))?,
            ),
        };

        Ok(Self {
            local_root,
            remote_root: normalize_dir(&remote_root),
            allow_metered_upload: read_bool_env(&lookup, ALLOW_METERED_ENV, false),
            retry_interval,
            max_upload_attempts,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_interval: self.retry_interval,
            max_attempts: self.max_upload_attempts,
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
