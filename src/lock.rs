//! Cross-process channel ownership
//!
//! A channel is owned by whoever holds its lock medium: an advisory `flock`
//! on the channel's record file, or an abstract unix socket name derived from
//! the same path. Both are released by the kernel when the holder exits, so a
//! held medium means a live owner. The JSON record inside the file (owner pid,
//! acquisition time, liveness token) is informational while the medium is
//! held; a record whose medium is free belongs to a dead or departed owner and
//! is reclaimed by the next caller.
//!
//! The record file is never unlinked. Unlinking would let a waiter lock the
//! orphaned inode while a newcomer locks a fresh one.

use std::fs::{File, OpenOptions};
use std::hash::{BuildHasher, Hasher};
use std::io::{Seek, SeekFrom, Write};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{SocketAddr, UnixListener};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, LockError, Result};
use crate::parameters::LockMedium;

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Card identity plus channel number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    card: String,
    channel: u32,
}

impl ChannelKey {
    pub fn new(card: impl ToString, channel: u32) -> Self {
        Self {
            card: card.to_string(),
            channel,
        }
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn file_name(&self) -> String {
        let card: String = self
            .card
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == ':' || c == '.' { c } else { '_' })
            .collect();
        format!("roc_{}_chan{}.lock", card, self.channel)
    }
}

// ============================================================================
// Shared state record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    pub card: String,
    pub channel: u32,
    pub pid: u32,
    /// Unix time in milliseconds
    pub acquired_at_ms: u64,
    pub token: u64,
}

impl SharedState {
    fn new(key: &ChannelKey) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let pid = std::process::id();

        let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
        hasher.write_u32(pid);
        hasher.write_u128(now.as_nanos());

        Self {
            card: key.card.clone(),
            channel: key.channel,
            pid,
            acquired_at_ms: now.as_millis() as u64,
            token: hasher.finish(),
        }
    }

    /// Read the record at `path`; missing or empty files have no record
    pub fn load(path: &Path) -> Result<SharedState> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SharedObjectNotFound(path.to_path_buf()))
            }
            Err(e) => {
                return Err(Error::SharedState(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if text.trim().is_empty() {
            return Err(Error::SharedObjectNotFound(path.to_path_buf()));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::SharedState(format!("corrupt record {}: {}", path.display(), e)))
    }

    fn store(&self, file: &mut File, path: &Path) -> Result<()> {
        let text = serde_json::to_string(self)
            .map_err(|e| Error::SharedState(format!("cannot encode record: {}", e)))?;
        let write = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(text.as_bytes())?;
            file.sync_data()
        };
        write(file).map_err(|e| {
            Error::SharedState(format!("cannot write record {}: {}", path.display(), e))
        })
    }

    fn describe(&self) -> String {
        let state = if process_exists(self.pid) {
            "running"
        } else {
            "gone"
        };
        format!(
            "pid {} ({}) since {} ms, token {:016x}",
            self.pid, state, self.acquired_at_ms, self.token
        )
    }
}

/// Whether a process with this pid exists (it may not be the recorded one)
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// ============================================================================
// Lock manager
// ============================================================================

pub struct LockManager {
    dir: PathBuf,
    medium: LockMedium,
    timeout: Duration,
}

enum Medium {
    File(File),
    Socket(UnixListener),
}

/// Exclusive ownership of one channel
///
/// Released by [`ChannelLock::release`], or best-effort on drop.
pub struct ChannelLock {
    key: ChannelKey,
    path: PathBuf,
    record: SharedState,
    reclaimed: Option<SharedState>,
    medium: Option<Medium>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, medium: LockMedium, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            medium,
            timeout,
        }
    }

    pub fn record_path(&self, key: &ChannelKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn lock_error(&self, path: &Path, message: String) -> Error {
        match self.medium {
            LockMedium::File => LockError::File {
                path: path.to_path_buf(),
                message,
            }
            .into(),
            LockMedium::Socket => LockError::Socket {
                name: socket_name(path),
                message,
            }
            .into(),
        }
    }

    /// Take ownership of `key`, retrying until the configured timeout
    pub fn acquire(&self, key: &ChannelKey) -> Result<ChannelLock> {
        let path = self.record_path(key);
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            self.lock_error(&path, format!("cannot create {}: {}", self.dir.display(), e))
        })?;

        // No deadline when the timeout does not fit an Instant
        let deadline = Instant::now().checked_add(self.timeout);
        let medium = loop {
            let attempt = match self.medium {
                LockMedium::File => self.try_flock(&path),
                LockMedium::Socket => self.try_bind(&path),
            };
            match attempt? {
                Some(medium) => break medium,
                None if deadline.is_some_and(|d| Instant::now() >= d) => {
                    let owner = match SharedState::load(&path) {
                        Ok(record) => record.describe(),
                        Err(e) => format!("unknown owner ({})", e),
                    };
                    return Err(self.lock_error(
                        &path,
                        format!("channel held by {} after waiting {:?}", owner, self.timeout),
                    ));
                }
                None => std::thread::sleep(RETRY_INTERVAL),
            }
        };

        let reclaimed = match SharedState::load(&path) {
            Ok(previous) => {
                tracing::warn!(
                    "Reclaiming stale lock on {} channel {} from {}",
                    key.card,
                    key.channel,
                    previous.describe()
                );
                Some(previous)
            }
            Err(Error::SharedObjectNotFound(_)) => None,
            Err(e) => {
                tracing::warn!("Overwriting unreadable lock record: {}", e);
                None
            }
        };

        let record = SharedState::new(key);
        let mut file = match &medium {
            Medium::File(file) => file
                .try_clone()
                .map_err(|e| self.lock_error(&path, format!("cannot clone fd: {}", e)))?,
            Medium::Socket(_) => open_record(&path)
                .map_err(|e| self.lock_error(&path, format!("cannot open record: {}", e)))?,
        };
        record.store(&mut file, &path)?;

        tracing::info!(
            "Acquired {} channel {} ({:?} lock, token {:016x})",
            key.card,
            key.channel,
            self.medium,
            record.token
        );

        Ok(ChannelLock {
            key: key.clone(),
            path,
            record,
            reclaimed,
            medium: Some(medium),
        })
    }

    fn try_flock(&self, path: &Path) -> Result<Option<Medium>> {
        let file = open_record(path)
            .map_err(|e| self.lock_error(path, format!("cannot open: {}", e)))?;
        // SAFETY: fd is valid for the lifetime of `file`
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            return Ok(Some(Medium::File(file)));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(None);
        }
        Err(self.lock_error(path, format!("flock failed: {}", err)))
    }

    fn try_bind(&self, path: &Path) -> Result<Option<Medium>> {
        let name = socket_name(path);
        let addr = SocketAddr::from_abstract_name(name.as_bytes())
            .map_err(|e| self.lock_error(path, format!("invalid socket name: {}", e)))?;
        match UnixListener::bind_addr(&addr) {
            Ok(listener) => Ok(Some(Medium::Socket(listener))),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(None),
            Err(e) => Err(self.lock_error(path, format!("bind failed: {}", e))),
        }
    }

    /// Current live owner of `key`, if any
    pub fn owner(&self, key: &ChannelKey) -> Result<Option<SharedState>> {
        let path = self.record_path(key);
        let held = match self.medium {
            LockMedium::File => {
                if !path.exists() {
                    return Ok(None);
                }
                self.try_flock(&path)?.is_none()
            }
            LockMedium::Socket => self.try_bind(&path)?.is_none(),
        };
        if !held {
            return Ok(None);
        }
        SharedState::load(&path).map(Some)
    }
}

impl ChannelLock {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn record(&self) -> &SharedState {
        &self.record
    }

    /// Record of the departed owner this lock was taken over from
    pub fn reclaimed(&self) -> Option<&SharedState> {
        self.reclaimed.as_ref()
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(medium) = self.medium.take() else {
            return Ok(());
        };

        let result = match SharedState::load(&self.path) {
            Ok(current) if current.token == self.record.token => {
                clear_record(&self.path, &medium).map_err(|e| {
                    Error::SharedState(format!("cannot clear {}: {}", self.path.display(), e))
                })
            }
            Ok(current) => Err(Error::SharedState(format!(
                "record {} was replaced by {}",
                self.path.display(),
                current.describe()
            ))),
            Err(e) => Err(e),
        };

        // Closing the fd / socket is what hands the channel over
        if let Medium::Socket(listener) = &medium {
            tracing::debug!("Closing lock socket {:?}", listener.local_addr().ok());
        }
        drop(medium);
        tracing::info!("Released {} channel {}", self.key.card, self.key.channel);
        result
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!("Releasing lock {} failed: {}", self.path.display(), e);
        }
    }
}

fn open_record(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
}

fn clear_record(path: &Path, medium: &Medium) -> std::io::Result<()> {
    match medium {
        Medium::File(file) => file.set_len(0),
        Medium::Socket(_) => open_record(path)?.set_len(0),
    }
}

/// Abstract socket name for a record path
///
/// Hashed (FNV-1a) so any lock directory fits the 108-byte `sun_path`, and
/// stable across processes and builds.
fn socket_name(path: &Path) -> String {
    let hash = path
        .as_os_str()
        .as_bytes()
        .iter()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, &byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        });
    format!("readoutcard:{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn manager(dir: &Path, medium: LockMedium) -> LockManager {
        LockManager::new(dir, medium, Duration::from_millis(5))
    }

    #[test]
    fn record_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.lock");
        let record = SharedState::new(&ChannelKey::new("0000:04:00.0", 1));
        let mut file = open_record(&path).unwrap();
        record.store(&mut file, &path).unwrap();
        assert_eq!(SharedState::load(&path).unwrap(), record);
        assert_eq!(record.pid, std::process::id());
    }

    #[test]
    fn missing_empty_and_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.lock");
        assert_eq!(
            SharedState::load(&path).unwrap_err().kind(),
            ErrorKind::SharedObjectNotFound
        );
        std::fs::write(&path, "").unwrap();
        assert_eq!(
            SharedState::load(&path).unwrap_err().kind(),
            ErrorKind::SharedObjectNotFound
        );
        std::fs::write(&path, "{\"pid\":").unwrap();
        assert_eq!(SharedState::load(&path).unwrap_err().kind(), ErrorKind::SharedState);
    }

    #[test]
    fn file_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), LockMedium::File);
        let key = ChannelKey::new("0000:04:00.0", 1);

        let first = locks.acquire(&key).unwrap();
        assert!(first.reclaimed().is_none());
        let err = locks.acquire(&key).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::FileLock);
        assert_eq!(locks.owner(&key).unwrap().as_ref(), Some(first.record()));

        first.release().unwrap();
        assert_eq!(locks.owner(&key).unwrap(), None);
        let second = locks.acquire(&key).unwrap();
        assert!(second.reclaimed().is_none());
    }

    #[test]
    fn socket_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), LockMedium::Socket);
        let key = ChannelKey::new("0000:04:00.0", 2);

        let first = locks.acquire(&key).unwrap();
        let err = locks.acquire(&key).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SocketLock);
        assert!(locks.owner(&key).unwrap().is_some());
        first.release().unwrap();
        assert!(locks.acquire(&key).is_ok());
    }

    #[test]
    fn unbounded_timeout_acquires_free_channel() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), LockMedium::File, Duration::MAX);
        let lock = locks.acquire(&ChannelKey::new("0000:04:00.0", 4)).unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn socket_lock_under_long_directory() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a".repeat(100)).join("b".repeat(100));
        let locks = manager(&deep, LockMedium::Socket);
        let key = ChannelKey::new("0000:04:00.0", 5);

        let first = locks.acquire(&key).unwrap();
        assert_eq!(locks.acquire(&key).err().unwrap().kind(), ErrorKind::SocketLock);
        first.release().unwrap();
        assert!(locks.acquire(&key).is_ok());
    }

    #[test]
    fn socket_names_fit_and_differ() {
        let a = socket_name(Path::new("/dev/shm/readoutcard/roc_0000:04:00.0_chan0.lock"));
        let b = socket_name(Path::new("/dev/shm/readoutcard/roc_0000:04:00.0_chan1.lock"));
        assert_ne!(a, b);
        assert_eq!(a, socket_name(Path::new("/dev/shm/readoutcard/roc_0000:04:00.0_chan0.lock")));
        let long = socket_name(&Path::new("/").join("x".repeat(300)));
        assert!(long.len() < 108);
    }

    #[test]
    fn channels_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), LockMedium::File);
        let _a = locks.acquire(&ChannelKey::new("0000:04:00.0", 0)).unwrap();
        let _b = locks.acquire(&ChannelKey::new("0000:04:00.0", 1)).unwrap();
        let _c = locks.acquire(&ChannelKey::new("0000:05:00.0", 0)).unwrap();
    }

    #[test]
    fn dropped_lock_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), LockMedium::File);
        let key = ChannelKey::new("#0", 0);
        drop(locks.acquire(&key).unwrap());
        let again = locks.acquire(&key).unwrap();
        assert!(again.reclaimed().is_none());
    }

    #[test]
    fn replaced_record_fails_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), LockMedium::File);
        let key = ChannelKey::new("0000:04:00.0", 3);
        let lock = locks.acquire(&key).unwrap();

        let mut forged = lock.record().clone();
        forged.token ^= 1;
        std::fs::write(locks.record_path(&key), serde_json::to_string(&forged).unwrap()).unwrap();

        assert_eq!(lock.release().unwrap_err().kind(), ErrorKind::SharedState);
    }

    #[test]
    fn own_pid_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(u32::MAX));
    }
}
