//! Lock and counter kept as files in a local directory.
//!
//! Usable by any process on the same host. A lock is a file created with
//! `O_EXCL`; a counter is a file replaced by rename so readers never see a
//! partial write.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{owner_token, parse_counter, CounterStore, DistributedLock, StoreResult};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_optional(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Contents of a lock file: `<owner> <expiry-millis>`, expiry 0 meaning never.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockRecord {
    owner: String,
    expires_at: u64,
}

impl LockRecord {
    fn parse(raw: &str) -> Option<Self> {
        let (owner, expires_at) = raw.trim().split_once(' ')?;
        Some(Self {
            owner: owner.to_owned(),
            expires_at: expires_at.parse().ok()?,
        })
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }
}

pub struct FileLock {
    dir: PathBuf,
    owner: String,
}

impl FileLock {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            owner: owner_token(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    fn create(&self, path: &Path, lease: Duration) -> io::Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };
        let expires_at = if lease.is_zero() {
            0
        } else {
            now_millis() + lease.as_millis() as u64
        };
        let record = format!("{} {}", self.owner, expires_at);
        file.write_all(record.as_bytes())?;
        Ok(true)
    }

    /// Move an expired lock file out of the way.
    fn break_if_expired(&self, path: &Path) -> io::Result<()> {
        let Some(stale) = read_optional(path)?.as_deref().and_then(LockRecord::parse) else {
            return Ok(());
        };
        if !stale.is_expired(now_millis()) {
            return Ok(());
        }
        self.break_stale(path, &stale)
    }

    /// Remove the lock file last seen holding `stale`. Another breaker may have
    /// removed it first and a new holder taken its place; the rename then
    /// catches the new lock, which is linked back unless yet another file has
    /// appeared in the meantime.
    fn break_stale(&self, path: &Path, stale: &LockRecord) -> io::Result<()> {
        tracing::debug!(lock = %path.display(), owner = %stale.owner, "breaking expired lock");
        let grave = path.with_extension(format!("expired.{}", owner_token()));
        match fs::rename(path, &grave) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        let moved = read_optional(&grave)?.as_deref().and_then(LockRecord::parse);
        if moved.as_ref() != Some(stale) {
            match fs::hard_link(&grave, path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!(lock = %path.display(), "lost a live lock while breaking an expired one");
                }
                Err(e) => {
                    remove_optional(&grave)?;
                    return Err(e);
                }
            }
        }
        remove_optional(&grave)
    }
}

impl DistributedLock for FileLock {
    fn try_acquire(&mut self, name: &str, lease: Duration) -> StoreResult<bool> {
        let path = self.path(name);
        if self.create(&path, lease)? {
            return Ok(true);
        }
        self.break_if_expired(&path)?;
        Ok(false)
    }

    fn release(&mut self, name: &str) -> StoreResult<bool> {
        let path = self.path(name);
        let record = read_optional(&path)?.as_deref().and_then(LockRecord::parse);
        match record {
            Some(record) if record.owner == self.owner => {
                remove_optional(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct FileCounter {
    dir: PathBuf,
}

impl FileCounter {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.count"))
    }
}

impl CounterStore for FileCounter {
    fn fetch(&mut self, key: &str) -> StoreResult<Option<u64>> {
        read_optional(&self.path(key))?
            .map(|raw| parse_counter(key, &raw))
            .transpose()
    }

    fn put(&mut self, key: &str, value: u64) -> StoreResult<()> {
        let tmp = self.dir.join(format!("{key}.{}.tmp", owner_token()));
        fs::write(&tmp, value.to_string())?;
        if let Err(e) = fs::rename(&tmp, self.path(key)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn forget(&mut self, key: &str) -> StoreResult<()> {
        remove_optional(&self.path(key))?;
        Ok(())
    }
}
