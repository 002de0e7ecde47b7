//! One worker: take the lock, read-modify-write the counter, release, repeat.

use std::time::Duration;

use quanta::Instant;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{self, CounterStore, DistributedLock, StoreError};
use crate::utils::busy_wait;
use crate::{AcquirePolicy, ConfigError, StoreSelector, WorkerArgs, WorkerParams, EXIT_CONFIG};

/// Payload a worker writes to stdout as its last action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub iterations: u64,
    /// Lease in seconds.
    pub lease_duration: u64,
    pub store_selector: StoreSelector,
    pub lock_key: String,
    pub counter_key: String,
    /// Counter value read inside the first critical section.
    pub first_observed_value: u64,
    /// Counter value written by the last critical section.
    pub last_observed_value: u64,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gave up on lock {name:?} after {waited:?} ({attempts} attempts)")]
    AcquireTimeout {
        name: String,
        waited: Duration,
        attempts: u64,
    },
}

impl WorkerError {
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkerError::Config(_) => EXIT_CONFIG,
            WorkerError::Store(_) => 2,
            WorkerError::AcquireTimeout { .. } => 3,
        }
    }
}

/// Ownership of a lock for one critical section.
///
/// Consumed by [`LockGuard::release`]; dropping an unreleased guard (early
/// return or panic) still releases, so every exit path gives the lock back
/// exactly once.
pub struct LockGuard<'a, L: DistributedLock + ?Sized> {
    lock: &'a mut L,
    name: &'a str,
    held: bool,
}

impl<L: DistributedLock + ?Sized> LockGuard<'_, L> {
    /// Release the lock. `Ok(false)` means the lease had already run out.
    pub fn release(mut self) -> Result<bool, StoreError> {
        self.held = false;
        self.lock.release(self.name)
    }
}

impl<L: DistributedLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.lock.release(self.name) {
                tracing::error!(lock = self.name, "release on unwind failed: {e}");
            }
        }
    }
}

/// Spin until `name` is granted.
///
/// Unbounded unless the policy sets a maximum wait. Errors from the lock
/// service are not retried.
pub fn acquire<'a, L: DistributedLock + ?Sized>(
    lock: &'a mut L,
    name: &'a str,
    lease: Duration,
    policy: &AcquirePolicy,
) -> Result<LockGuard<'a, L>, WorkerError> {
    let start = Instant::now();
    let max_wait = policy.max_wait();
    let mut attempts = 0u64;
    loop {
        attempts += 1;
        if lock.try_acquire(name, lease)? {
            return Ok(LockGuard {
                lock,
                name,
                held: true,
            });
        }
        if let Some(max_wait) = max_wait {
            let waited = start.elapsed();
            if waited >= max_wait {
                return Err(WorkerError::AcquireTimeout {
                    name: name.to_owned(),
                    waited,
                    attempts,
                });
            }
        }
        busy_wait(policy.backoff_nanos);
    }
}

/// The critical section. Returns the value read and the value written.
fn increment<C: CounterStore + ?Sized>(
    counter: &mut C,
    key: &str,
) -> Result<(u64, u64), StoreError> {
    let current = counter.get(key, 0)?;
    let next = current + 1;
    counter.put(key, next)?;
    Ok((current, next))
}

/// Run all iterations against the given services.
pub fn run<L, C>(
    lock: &mut L,
    counter: &mut C,
    params: &WorkerParams,
    policy: &AcquirePolicy,
) -> Result<WorkerResult, WorkerError>
where
    L: DistributedLock + ?Sized,
    C: CounterStore + ?Sized,
{
    if params.iterations == 0 {
        return Err(ConfigError::ZeroIterations.into());
    }

    let lease = params.lease();
    let mut first = None;
    let mut last = 0;
    for i in 0..params.iterations {
        let guard = acquire(lock, &params.lock_key, lease, policy)?;
        let section = increment(counter, &params.counter_key);
        let released = guard.release();

        let (read, written) = section?;
        if !released? {
            tracing::warn!(
                iteration = i,
                lock = %params.lock_key,
                "lock was no longer owned at release; lease too short?"
            );
        }
        if first.is_some() && read < last {
            tracing::warn!(iteration = i, read, last, "counter went backwards");
        }
        first.get_or_insert(read);
        last = written;
    }

    Ok(WorkerResult {
        iterations: params.iterations,
        lease_duration: params.lease_secs,
        store_selector: params.store,
        lock_key: params.lock_key.clone(),
        counter_key: params.counter_key.clone(),
        first_observed_value: first.unwrap_or_default(),
        last_observed_value: last,
    })
}

/// Entry point of the worker binary: validate, connect, run.
pub fn execute(args: &WorkerArgs) -> Result<WorkerResult, WorkerError> {
    let params = WorkerParams::try_from(args)?;
    let mut lock = store::open_lock(params.store, &args.stores)?;
    let mut counter = store::open_counter(&args.stores)?;
    tracing::debug!(?params, "worker starting");
    run(&mut lock, &mut counter, &params, &args.policy)
}
