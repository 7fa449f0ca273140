//! Index lock file
//!
//! One advisory exclusive lock guards the whole index directory. The lock
//! file doubles as a nameplate: the holder writes its pid and client name so
//! a contending process can report *who* has the index, not just that it is
//! taken.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::{is_permission_error, IndexError};

pub const LOCK_FILE_NAME: &str = "lock";

/// Exclusive lock over an index directory. Dropping a locked `LockFile`
/// releases the OS lock (the handle closes) but prefer calling
/// [`LockFile::unlock`] so the holder information is cleared too.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    client_name: String,
    file: Option<File>,
}

impl LockFile {
    /// `dir` is the index directory; the lock file lives directly inside it.
    pub fn new(dir: &Path, client_name: &str) -> Self {
        Self {
            path: dir.join(LOCK_FILE_NAME),
            client_name: client_name.to_string(),
            file: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Take the lock. With `blocking` set, waits for the current holder;
    /// otherwise contention is reported as [`IndexError::Locked`] carrying
    /// whatever holder information the lock file yields.
    pub fn lock(&mut self, blocking: bool) -> Result<(), IndexError> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.map_fs_error(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| self.map_fs_error(&self.path, e))?;

        let acquired = if blocking {
            file.lock_exclusive()
        } else {
            file.try_lock_exclusive()
        };
        if let Err(e) = acquired {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                let (pid, holder) = read_holder(&mut file);
                return Err(IndexError::Locked { pid, holder });
            }
            return Err(self.map_fs_error(&self.path, e));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        writeln!(file, "{}", self.client_name)?;
        file.flush()?;
        self.file = Some(file);
        Ok(())
    }

    /// Release the lock. Clears the holder information first so a stale
    /// nameplate never outlives the lock; failures to clear are logged and
    /// swallowed since the OS lock is released either way.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.set_len(0) {
                log::warn!("could not clear lock file {:?}: {}", self.path, e);
            }
            if let Err(e) = FileExt::unlock(&file) {
                log::warn!("could not release lock {:?}: {}", self.path, e);
            }
        }
    }

    fn map_fs_error(&self, path: &Path, e: std::io::Error) -> IndexError {
        if is_permission_error(&e) {
            IndexError::Permissions {
                path: path.to_path_buf(),
            }
        } else {
            e.into()
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Best-effort read of "pid\nclient\n" out of a contended lock file. The
/// holder may be rewriting it concurrently, so any shape of garbage maps to
/// `None` rather than an error.
fn read_holder(file: &mut File) -> (Option<u32>, Option<String>) {
    let mut content = String::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut content).is_err() {
        return (None, None);
    }
    let mut lines = content.lines();
    let pid = lines.next().and_then(|l| l.trim().parse().ok());
    let holder = lines
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());
    (pid, holder)
}
