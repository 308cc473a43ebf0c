use std::io;
use std::path::Path;

/// Post-download "open this file" action.
pub trait FileOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<()>;
}

/// Hands the file to the desktop's default handler (`xdg-open` and friends).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl FileOpener for SystemOpener {
    fn open(&self, path: &Path) -> io::Result<()> {
        open::that_detached(path)
    }
}

/// Opener for hosts without a desktop session.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOpener;

impl FileOpener for NoopOpener {
    fn open(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}
