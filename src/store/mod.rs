//! External lock and counter services.
//!
//! Both traits are deliberately minimal: the counter has no atomic increment, so a
//! lock that fails to exclude shows up as a lost update.

#[cfg(test)]
mod fake;
mod file;
mod memcached;
mod noop;
mod redis;
mod redlock;

pub use self::file::*;
pub use self::memcached::*;
pub use self::noop::*;
pub use self::redis::*;
pub use self::redlock::*;

use std::time::Duration;

use rand::distributions::{Alphanumeric, DistString};
use thiserror::Error;

use crate::{CounterBackend, StoreConfig, StoreSelector};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("memcached: {0}")]
    Memcache(#[from] ::memcache::MemcacheError),

    #[error("lock service: {0}")]
    Lock(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("value at {key:?} is not a counter: {value:?}")]
    Corrupt { key: String, value: String },

    #[error("counter {0:?} still present after reset")]
    ResetFailed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A named mutual-exclusion lock living in an external service.
pub trait DistributedLock {
    /// Make a single, non-blocking attempt to take `name` for `lease`.
    /// A zero lease means no expiry (or the driver default).
    fn try_acquire(&mut self, name: &str, lease: Duration) -> StoreResult<bool>;

    /// Release `name`. Return `false` if this instance no longer owned it,
    /// e.g. because the lease ran out.
    fn release(&mut self, name: &str) -> StoreResult<bool>;
}

/// A key/value integer store.
pub trait CounterStore {
    /// Read the value at `key`, `None` if absent.
    fn fetch(&mut self, key: &str) -> StoreResult<Option<u64>>;

    fn put(&mut self, key: &str, value: u64) -> StoreResult<()>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn forget(&mut self, key: &str) -> StoreResult<()>;

    /// Read the value at `key`, or `default` if absent.
    fn get(&mut self, key: &str, default: u64) -> StoreResult<u64> {
        Ok(self.fetch(key)?.unwrap_or(default))
    }
}

impl<T: DistributedLock + ?Sized> DistributedLock for Box<T> {
    fn try_acquire(&mut self, name: &str, lease: Duration) -> StoreResult<bool> {
        (**self).try_acquire(name, lease)
    }

    fn release(&mut self, name: &str) -> StoreResult<bool> {
        (**self).release(name)
    }
}

impl<T: CounterStore + ?Sized> CounterStore for Box<T> {
    fn fetch(&mut self, key: &str) -> StoreResult<Option<u64>> {
        (**self).fetch(key)
    }

    fn put(&mut self, key: &str, value: u64) -> StoreResult<()> {
        (**self).put(key, value)
    }

    fn forget(&mut self, key: &str) -> StoreResult<()> {
        (**self).forget(key)
    }
}

/// Connect to the lock service named by `selector`.
pub fn open_lock(
    selector: StoreSelector,
    config: &StoreConfig,
) -> StoreResult<Box<dyn DistributedLock>> {
    Ok(match selector {
        StoreSelector::Redis => Box::new(RedisLock::connect(&config.redis_url)?),
        StoreSelector::Redlock => Box::new(RedlockLock::connect(&config.redis_url)?),
        StoreSelector::Memcached => Box::new(MemcachedLock::connect(&config.memcached_url)?),
        StoreSelector::File => Box::new(FileLock::open(config.file_dir())?),
        StoreSelector::Noop => Box::new(NoopLock),
    })
}

/// Connect to the configured counter backend.
pub fn open_counter(config: &StoreConfig) -> StoreResult<Box<dyn CounterStore>> {
    Ok(match config.counter {
        CounterBackend::Redis => Box::new(RedisCounter::connect(&config.redis_url)?),
        CounterBackend::Memcached => Box::new(MemcachedCounter::connect(&config.memcached_url)?),
        CounterBackend::File => Box::new(FileCounter::open(config.file_dir())?),
    })
}

/// Random token identifying one lock owner.
pub(crate) fn owner_token() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), 16)
}

/// Parse a stored counter value.
pub(crate) fn parse_counter(key: &str, raw: &str) -> StoreResult<u64> {
    raw.trim().parse().map_err(|_| StoreError::Corrupt {
        key: key.to_owned(),
        value: raw.to_owned(),
    })
}
