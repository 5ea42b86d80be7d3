//! Advisory file locking for mirror mutations.
//!
//! The lock is mandatory for writers (init, fetch, ref updates) and ignored
//! by readers of immutable commit objects. Contention is resolved by
//! exponential backoff up to a caller-supplied deadline; dropping the guard
//! releases the lock on every exit path.

use std::{
    fs::File,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use thiserror::Error;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out waiting for the lock on {}", .0.display())]
    Timeout(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FileLock {
    /// Take the exclusive lock on `path`, backing off exponentially while
    /// another writer holds it. Gives up once `timeout` has elapsed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, Error> {
        let file = File::create(path)?;
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(_) => return Ok(Self { _file: file }),
                Err(error)
                    if error.raw_os_error() == fs4::lock_contended_error().raw_os_error() =>
                {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(path.to_path_buf()));
                    }
                    debug!(
                        "lock on {} is held elsewhere, backing off for {:?}",
                        path.display(),
                        backoff
                    );
                    std::thread::sleep(backoff.min(deadline.saturating_duration_since(now)));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
