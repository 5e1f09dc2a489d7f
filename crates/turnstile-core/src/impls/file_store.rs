//! JSON file task store.
//!
//! All records live in one JSON array document. Writers are serialized twice:
//! a `tokio::sync::Mutex` inside the process and a lock file next to the
//! document across processes sharing the same directory. The lock file is
//! hard-linked into place from a staged copy, so it never exists without its
//! holder's token. Every write goes to a per-writer temp file which is then
//! renamed over the document, so a reader sees either the old or the new
//! array, never a torn one. Readers take no lock. All file I/O runs on the
//! blocking pool.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{StoreError, TaskId, TaskLookup, TaskRecord, TaskStatus};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// File-backed [`TaskStore`] that survives restarts and can be shared by
/// several server processes on one host.
pub struct JsonFileTaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    write_guard: Mutex<()>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl JsonFileTaskStore {
    /// Open (or lazily create) the document at `path`.
    ///
    /// Parent directories are created; the document itself is written on the
    /// first `create`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock_path = sibling(&path, "lock");
        Ok(Self {
            path,
            lock_path,
            write_guard: Mutex::new(()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long a writer waits for the cross-process lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Age after which a leftover lock file (crashed writer) is removed.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-modify-write the whole document under both locks.
    async fn modify<R: Send>(
        &self,
        f: impl FnOnce(&mut Vec<TaskRecord>) -> Result<R, StoreError> + Send,
    ) -> Result<R, StoreError> {
        let _local = self.write_guard.lock().await;
        let lock = LockFile::acquire(&self.lock_path, self.lock_timeout, self.stale_after).await?;

        let outcome = async {
            let mut records = self.load().await?;
            let out = f(&mut records)?;
            self.save(records, lock.token()).await?;
            Ok::<R, StoreError>(out)
        }
        .await;

        let released = lock.release().await;
        let out = outcome?;
        released?;
        Ok(out)
    }

    async fn load(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let path = self.path.clone();
        blocking(move || read_document(&path)).await
    }

    async fn save(&self, records: Vec<TaskRecord>, writer: &str) -> Result<(), StoreError> {
        let path = self.path.clone();
        let tmp = sibling(&self.path, &format!("{writer}.tmp"));
        blocking(move || write_document(&path, &tmp, &records)).await
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn create(&self, endpoint: &str) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new(self.ids.generate_task_id(), endpoint, self.clock.now());
        let stored = record.clone();
        self.modify(move |records| {
            records.push(stored);
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn update(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.modify(move |records| {
            let record = records
                .iter_mut()
                .find(|r| r.task_id == task_id)
                .ok_or(StoreError::NotFound(task_id))?;
            record.set_status(status, now);
            Ok(())
        })
        .await
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskLookup, StoreError> {
        let records = self.load().await?;
        Ok(match records.into_iter().find(|r| r.task_id == task_id) {
            Some(record) => TaskLookup::Found(record),
            None => TaskLookup::not_found(task_id, self.clock.now()),
        })
    }
}

/// Run blocking file I/O off the async workers.
async fn blocking<R: Send + 'static>(
    f: impl FnOnce() -> Result<R, StoreError> + Send + 'static,
) -> Result<R, StoreError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

fn read_document(path: &Path) -> Result<Vec<TaskRecord>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io(e)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_document(path: &Path, tmp: &Path, records: &[TaskRecord]) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(records)?;
    {
        let mut file = std::fs::File::create(tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// `<pid>-<random>`: identifies one lock holder across processes.
fn lock_token() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

enum LockAttempt {
    Acquired,
    Held,
}

/// Cross-process exclusive lock held while the file exists.
///
/// The lock file contains the holder's token and is only ever removed by
/// that holder, or by a reclaimer that moved it aside and confirmed it was
/// the stale file it inspected. A lock older than `stale_after` is assumed
/// to belong to a crashed writer.
struct LockFile {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockFile {
    async fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, StoreError> {
        let token = lock_token();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let attempt = {
                let path = path.to_path_buf();
                let token = token.clone();
                blocking(move || try_lock(&path, &token, stale_after)).await?
            };
            if let LockAttempt::Acquired = attempt {
                return Ok(Self {
                    path: path.to_path_buf(),
                    token,
                    released: false,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    path: path.to_path_buf(),
                });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    fn token(&self) -> &str {
        &self.token
    }

    async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        let path = self.path.clone();
        let token = self.token.clone();
        blocking(move || remove_if_owned(&path, &token)).await
    }
}

impl Drop for LockFile {
    // only reached without `release` when the write future was dropped or panicked
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_if_owned(&self.path, &self.token) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release task store lock");
        }
    }
}

/// One attempt to take the lock, reclaiming it first if it is stale.
fn try_lock(path: &Path, token: &str, stale_after: Duration) -> Result<LockAttempt, StoreError> {
    // the lock appears with its token already written: stage it, then link
    let staged = sibling(path, token);
    std::fs::write(&staged, token)?;
    let linked = std::fs::hard_link(&staged, path);
    let _ = std::fs::remove_file(&staged);
    match linked {
        Ok(()) => return Ok(LockAttempt::Acquired),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(StoreError::Io(e)),
    }

    let observed = match std::fs::read_to_string(path) {
        Ok(owner) => owner,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockAttempt::Held),
        Err(e) => return Err(StoreError::Io(e)),
    };
    if is_stale(path, stale_after) {
        reclaim_if_unchanged(path, &observed, token)?;
    }
    Ok(LockAttempt::Held)
}

/// Move the lock aside and delete it only if it is still the file whose
/// owner was `observed`; a lock taken in between is linked back.
fn reclaim_if_unchanged(path: &Path, observed: &str, token: &str) -> Result<(), StoreError> {
    let parked = sibling(path, &format!("{token}.stale"));
    match std::fs::rename(path, &parked) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::Io(e)),
    }

    let parked_owner = std::fs::read_to_string(&parked)?;
    if parked_owner == observed {
        tracing::warn!(lock = %path.display(), owner = %observed, "removed stale task store lock");
    } else if let Err(e) = std::fs::hard_link(&parked, path) {
        tracing::error!(
            lock = %path.display(),
            owner = %parked_owner,
            error = %e,
            "could not restore a live task store lock"
        );
    }
    std::fs::remove_file(&parked)?;
    Ok(())
}

fn remove_if_owned(path: &Path, token: &str) -> Result<(), StoreError> {
    match std::fs::read_to_string(path) {
        Ok(owner) if owner == token => std::fs::remove_file(path)?,
        Ok(owner) => {
            tracing::warn!(lock = %path.display(), %owner, "task store lock was taken over; leaving it");
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(StoreError::Io(e)),
    }
    Ok(())
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}
