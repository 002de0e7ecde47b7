//! Redlock over the configured Redis endpoint.

use std::collections::HashMap;
use std::time::Duration;

use super::{DistributedLock, StoreError, StoreResult};
use crate::DEFAULT_LEASE;

/// Lock backed by the `redlock` crate.
pub struct RedlockLock {
    rl: &'static ::redlock::RedLock,
    held: HashMap<String, ::redlock::Lock<'static>>,
}

impl RedlockLock {
    pub fn connect(url: &str) -> StoreResult<Self> {
        // Probe the endpoint first; `RedLock::new` does not report bad URLs.
        ::redis::Client::open(url)?.get_connection()?;

        // One round per call: retrying is the worker's job. The delay must stay
        // at least 1 ms because the crate draws its pause from `0..delay`.
        let mut rl = ::redlock::RedLock::new(vec![url]);
        rl.set_retry(1, 1);

        // Held locks borrow the manager, which lives as long as the worker process.
        let rl: &'static ::redlock::RedLock = Box::leak(Box::new(rl));
        Ok(Self {
            rl,
            held: HashMap::new(),
        })
    }
}

impl DistributedLock for RedlockLock {
    fn try_acquire(&mut self, name: &str, lease: Duration) -> StoreResult<bool> {
        let lease = if lease.is_zero() { DEFAULT_LEASE } else { lease };
        let granted = self
            .rl
            .lock(name.as_bytes(), lease.as_millis() as usize)
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        match granted {
            Some(lock) => {
                self.held.insert(name.to_owned(), lock);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release(&mut self, name: &str) -> StoreResult<bool> {
        let Some(lock) = self.held.remove(name) else {
            return Ok(false);
        };
        self.rl.unlock(&lock);
        Ok(true)
    }
}
