use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const HW_RELEASE_PATH: &str = "/etc/hw-release";
const FALLBACK_REMOTE_ROOT: &str = "/Jolla/";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("{0} is outside the local sync root")]
    OutsideRoot(PathBuf),
    #[error("local path contains unsupported component")]
    UnsupportedComponent,
    #[error("local path is not valid UTF-8")]
    NonUtf8,
    #[error("local path names the sync root itself")]
    Empty,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

/// Directory keys always carry a leading and trailing `/` (`/App/sub/`).
pub fn normalize_dir(path: &str) -> String {
    let mut out = String::from("/");
    for part in segments(path) {
        out.push_str(part);
        out.push('/');
    }
    out
}

/// File keys carry a leading `/` and no trailing one (`/App/a.txt`).
pub fn normalize_file(path: &str) -> String {
    let mut out = String::new();
    for part in segments(path) {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Every proper ancestor directory of `path`, shallow to deep, excluding `/`.
pub fn ancestors(path: &str) -> Vec<String> {
    let parts: Vec<&str> = segments(path).collect();
    let mut out = Vec::with_capacity(parts.len().saturating_sub(1));
    let mut current = String::from("/");
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        current.push_str(part);
        current.push('/');
        out.push(current.clone());
    }
    out
}

pub fn parent_dir(path: &str) -> Option<String> {
    ancestors(path).pop().or_else(|| {
        if segments(path).next().is_some() {
            Some("/".to_string())
        } else {
            None
        }
    })
}

pub fn file_name(path: &str) -> Option<&str> {
    segments(path).last()
}

/// Maps a file under `local_root` onto the same relative location under `remote_root`.
pub fn remote_path_for(
    local_root: &Path,
    remote_root: &str,
    local: &Path,
) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(local_root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;

    let mut out = normalize_dir(remote_root);
    let mut pushed = false;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or(PathError::NonUtf8)?;
                if pushed {
                    out.push('/');
                }
                out.push_str(part);
                pushed = true;
            }
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if !pushed {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Reads `NAME=` from an os-release style file and turns it into `/<NAME>/`.
pub fn remote_root_from_hw_release(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let name = line.strip_prefix("NAME=")?.replace('"', "");
        let name = name.trim();
        (!name.is_empty()).then(|| normalize_dir(name))
    })
}

pub fn default_remote_root() -> String {
    std::fs::read_to_string(HW_RELEASE_PATH)
        .ok()
        .and_then(|contents| remote_root_from_hw_release(&contents))
        .unwrap_or_else(|| FALLBACK_REMOTE_ROOT.to_string())
}

/// Well-known user directories downloads are sorted into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDirs {
    pub pictures: Option<PathBuf>,
    pub music: Option<PathBuf>,
    pub videos: Option<PathBuf>,
    pub documents: Option<PathBuf>,
    pub downloads: Option<PathBuf>,
}

impl UserDirs {
    pub fn from_system() -> Self {
        Self {
            pictures: dirs::picture_dir(),
            music: dirs::audio_dir(),
            videos: dirs::video_dir(),
            documents: dirs::document_dir(),
            downloads: dirs::download_dir(),
        }
    }
}

/// Picks the local directory for a downloaded file from its MIME type.
pub fn download_dir_for(name: &str, dirs: &UserDirs) -> Option<PathBuf> {
    use mime_guess::mime;

    let by_type = mime_guess::from_path(name).first().and_then(|guess| {
        let kind = guess.type_();
        if kind == mime::IMAGE {
            dirs.pictures.clone()
        } else if kind == mime::AUDIO {
            dirs.music.clone()
        } else if kind == mime::VIDEO {
            dirs.videos.clone()
        } else {
            None
        }
    });
    by_type
        .or_else(|| dirs.documents.clone())
        .or_else(|| dirs.downloads.clone())
}
