use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Instant;

use fs2::FileExt;
use tracing::debug;

use repolens_core::{Error, Result};

pub const LOCK_FILE: &str = "build.lock";

/// Cross-process exclusive lock on a project's index directory, held for
/// the duration of a rebuild. Released on drop.
pub struct BuildLock {
    file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(project_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(project_dir)?;
        let path = project_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| Error::Operation(format!("open build lock {}: {err}", path.display())))?;

        let start = Instant::now();
        file.lock_exclusive().map_err(|err| {
            Error::Operation(format!("acquire build lock {}: {err}", path.display()))
        })?;
        let wait_ms = start.elapsed().as_millis() as u64;
        debug!(path = %path.display(), wait_ms, "build lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            debug!(path = %self.path.display(), error = %err, "failed to release build lock");
        }
    }
}
