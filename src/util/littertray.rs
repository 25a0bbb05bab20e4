//! Filesystem helper for tests
// Copyright (c) 2020 Sergio Benitez, (c) 2025 Ross Younger
// MIT license applies to this file.

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use tempfile::TempDir;

/// A scratch directory that the process works in for the duration of a closure.
///
/// Configuration file tests use it so relative paths land somewhere disposable.
/// The previous working directory is restored, and the directory removed, on drop.
/// Derived from `figment::Jail`, without the environment handling.
#[derive(Debug)]
pub(crate) struct LitterTray {
    _dir: TempDir,
    saved_cwd: PathBuf,
}

/// Only one tray at a time: the working directory is process-wide.
static G_LOCK: Mutex<()> = Mutex::new(());

impl LitterTray {
    /// Runs a closure in a new litter tray, passing the tray to the closure.
    pub(crate) fn try_with<F: FnOnce(&mut LitterTray) -> Result<()>>(f: F) -> Result<()> {
        let _guard = G_LOCK.lock();
        let dir = TempDir::new()?;
        let saved_cwd = std::env::current_dir()?;
        std::env::set_current_dir(dir.path())?;
        let mut tray = LitterTray {
            _dir: dir,
            saved_cwd,
        };
        f(&mut tray)
    }

    /// Writes a text file, named relative to the tray
    pub(crate) fn create_text<P: AsRef<Path>>(&self, path: P, contents: &str) -> Result<()> {
        let path = path.as_ref();
        anyhow::ensure!(
            path.components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir)),
            "LitterTray: {} is outside of the tray",
            path.display()
        );
        std::fs::write(path, contents)?;
        Ok(())
    }
}

impl Drop for LitterTray {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.saved_cwd);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::LitterTray;

    #[test]
    fn stays_inside() {
        LitterTray::try_with(|tray| {
            tray.create_text("a.conf", "x 1\n")?;
            assert!(std::path::Path::new("a.conf").exists());
            assert!(tray.create_text("../escape.conf", "").is_err());
            assert!(tray.create_text("/tmp/escape.conf", "").is_err());
            Ok(())
        })
        .unwrap();
    }
}
