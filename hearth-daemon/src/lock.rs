//! Single-instance lock on the pid file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{io_err, DaemonError};

/// Exclusive advisory lock held for the life of the service. The pid file
/// contains the holder's process id.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    /// Take the lock without blocking. Fails with
    /// [`DaemonError::AlreadyRunning`] when another process holds it.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(DaemonError::AlreadyRunning {
                path: path.to_path_buf(),
            });
        }

        file.set_len(0).map_err(|e| io_err(path, e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| io_err(path, e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| io_err(path, e))?;
        file.flush().map_err(|e| io_err(path, e))?;
        tracing::debug!(path = %path.display(), "acquired exclusive lock");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and remove the pid file.
    pub fn release(self) -> Result<(), DaemonError> {
        FileExt::unlock(&self.file).map_err(|e| io_err(&self.path, e))?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&self.path, err)),
        }
        tracing::debug!(path = %self.path.display(), "released exclusive lock");
        Ok(())
    }
}
