//! Memcached lock and counter.

use std::time::Duration;

use ::memcache::{Client, CommandError, MemcacheError};

use super::{owner_token, parse_counter, CounterStore, DistributedLock, StoreResult};

/// Memcached treats expirations above 30 days as absolute timestamps.
const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;

fn expiry_secs(lease: Duration) -> u32 {
    lease.as_secs().min(MAX_RELATIVE_EXPIRY) as u32
}

/// Map an `add` reply to whether the key may now be ours. Only `KeyExists`
/// means somebody else holds it; any other error is a real failure.
fn added(reply: Result<(), MemcacheError>) -> StoreResult<bool> {
    match reply {
        Ok(()) => Ok(true),
        Err(MemcacheError::CommandError(CommandError::KeyExists)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Lock taken with `add`, which only succeeds if the key is absent.
pub struct MemcachedLock {
    client: Client,
    owner: String,
}

impl MemcachedLock {
    pub fn connect(url: &str) -> StoreResult<Self> {
        Ok(Self {
            client: Client::connect(url)?,
            owner: owner_token(),
        })
    }
}

impl DistributedLock for MemcachedLock {
    fn try_acquire(&mut self, name: &str, lease: Duration) -> StoreResult<bool> {
        let reply = self
            .client
            .add(name, self.owner.as_str(), expiry_secs(lease));
        if !added(reply)? {
            return Ok(false);
        }
        // The ascii protocol reports NOT_STORED as success, so only our own
        // token in the slot proves the grant.
        let holder: Option<String> = self.client.get(name)?;
        Ok(holder.as_deref() == Some(self.owner.as_str()))
    }

    fn release(&mut self, name: &str) -> StoreResult<bool> {
        // Not atomic: the lease may run out between the check and the delete.
        let current: Option<String> = self.client.get(name)?;
        if current.as_deref() != Some(self.owner.as_str()) {
            return Ok(false);
        }
        Ok(self.client.delete(name)?)
    }
}

pub struct MemcachedCounter {
    client: Client,
}

impl MemcachedCounter {
    pub fn connect(url: &str) -> StoreResult<Self> {
        Ok(Self {
            client: Client::connect(url)?,
        })
    }
}

impl CounterStore for MemcachedCounter {
    fn fetch(&mut self, key: &str) -> StoreResult<Option<u64>> {
        let raw: Option<String> = self.client.get(key)?;
        raw.map(|raw| parse_counter(key, &raw)).transpose()
    }

    fn put(&mut self, key: &str, value: u64) -> StoreResult<()> {
        self.client.set(key, value.to_string().as_str(), 0)?;
        Ok(())
    }

    fn forget(&mut self, key: &str) -> StoreResult<()> {
        self.client.delete(key)?;
        Ok(())
    }
}
