//! Run parameters, identifiers and the argument schema shared by both binaries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lock implementation exercised by the workers.
#[derive(
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum StoreSelector {
    /// Single-instance Redis lock (`SET NX PX` with owner token).
    Redis,
    /// Redlock algorithm over the configured Redis endpoint.
    Redlock,
    /// Memcached `add` lock.
    Memcached,
    /// Lock files in a local directory.
    File,
    /// Grants every request. Exists to prove the harness catches a broken lock.
    Noop,
}

/// Backend holding the shared counter.
#[derive(strum::EnumString, strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CounterBackend {
    Redis,
    Memcached,
    File,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the workers option must be at least 1")]
    ZeroWorkers,

    #[error("the iterations option must be at least 1")]
    ZeroIterations,

    #[error("{workers} workers of {iterations} iterations overflow the counter")]
    CountOverflow { workers: u64, iterations: u64 },

    #[error("the {0} option must not be empty")]
    EmptyKey(&'static str),

    #[error("worker executable not found at {0}")]
    WorkerBinary(PathBuf),
}

/// The pair of identifiers naming one test run's lock and counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKeys {
    pub lock_key: String,
    pub counter_key: String,
}

impl RunKeys {
    /// Generate fresh identifiers. Two runs never share either key.
    pub fn generate() -> Self {
        Self {
            lock_key: Uuid::new_v4().to_string(),
            counter_key: Uuid::new_v4().to_string(),
        }
    }
}

/// Endpoints of the external services.
#[derive(Debug, Clone, clap::Args)]
pub struct StoreConfig {
    /// Backend holding the shared counter.
    #[clap(long, default_value = "redis")]
    pub counter: CounterBackend,

    /// Redis endpoint, used by the `redis` and `redlock` backends.
    #[clap(long, default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Memcached endpoint.
    #[clap(long, default_value = "memcache://127.0.0.1:11211")]
    pub memcached_url: String,

    /// Directory used by the `file` backend. Defaults to `<tmp>/lockcheck`.
    #[clap(long)]
    pub file_dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn file_dir(&self) -> PathBuf {
        self.file_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("lockcheck"))
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--counter".to_owned(),
            self.counter.to_string(),
            "--redis-url".to_owned(),
            self.redis_url.clone(),
            "--memcached-url".to_owned(),
            self.memcached_url.clone(),
        ];
        if let Some(dir) = &self.file_dir {
            args.push("--file-dir".to_owned());
            args.push(dir.to_string_lossy().into_owned());
        }
        args
    }
}

/// How a worker waits for the lock.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct AcquirePolicy {
    /// Backoff nanoseconds between attempts. 0 indicates busy retry.
    #[clap(long, default_value = "0")]
    pub backoff_nanos: u64,

    /// Give up acquiring after this many milliseconds. Unbounded if absent.
    #[clap(long)]
    pub max_wait_ms: Option<u64>,
}

impl AcquirePolicy {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--backoff-nanos".to_owned(), self.backoff_nanos.to_string()];
        if let Some(ms) = self.max_wait_ms {
            args.push("--max-wait-ms".to_owned());
            args.push(ms.to_string());
        }
        args
    }
}

/// Run concurrent workers that increment a shared counter while holding a distributed lock.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct RunArgs {
    /// Number of worker processes.
    #[clap(short, long, default_value = "2")]
    pub workers: u64,

    /// Iterations per worker.
    #[clap(short, long, default_value = "1000")]
    pub iterations: u64,

    /// Lock implementation under test.
    #[clap(short, long, default_value = "redis")]
    pub store: StoreSelector,

    /// Lock lease in seconds. 0 means no expiry or the driver default.
    ///
    /// With the file store, expired locks are broken by whichever waiter sees
    /// them first; when several waiters race on the same expired lock, a fresh
    /// lock can occasionally be lost.
    #[clap(long, alias = "seconds", default_value = "0")]
    pub lease: u64,

    /// Kill workers still running after this many seconds.
    #[clap(long)]
    pub timeout_secs: Option<u64>,

    /// Worker executable. Defaults to `lockcheck-worker` next to this binary.
    #[clap(long)]
    pub worker_bin: Option<PathBuf>,

    #[clap(flatten)]
    pub stores: StoreConfig,

    #[clap(flatten)]
    pub policy: AcquirePolicy,
}

/// Increment a shared counter while holding a distributed lock.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct WorkerArgs {
    /// Number of critical sections to run.
    #[clap(long)]
    pub iterations: u64,

    /// Lock lease in seconds.
    #[clap(long, alias = "seconds", default_value = "0")]
    pub lease: u64,

    /// Lock implementation under test.
    #[clap(long)]
    pub store: StoreSelector,

    /// Name of the lock.
    #[clap(long)]
    pub lock_key: String,

    /// Key of the shared counter.
    #[clap(long, alias = "count-key")]
    pub counter_key: String,

    #[clap(flatten)]
    pub stores: StoreConfig,

    #[clap(flatten)]
    pub policy: AcquirePolicy,
}

/// Validated orchestrator parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub workers: u64,
    pub iterations: u64,
    pub lease_secs: u64,
    pub store: StoreSelector,
}

impl RunParams {
    pub fn new(
        workers: u64,
        iterations: u64,
        lease_secs: u64,
        store: StoreSelector,
    ) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if workers.checked_mul(iterations).is_none() {
            return Err(ConfigError::CountOverflow {
                workers,
                iterations,
            });
        }
        Ok(Self {
            workers,
            iterations,
            lease_secs,
            store,
        })
    }

    /// The counter value a correct lock must produce. `new` rejects counts
    /// that do not fit.
    pub fn expected_count(&self) -> u64 {
        self.workers.saturating_mul(self.iterations)
    }

    /// Parameters handed to every worker of this run.
    pub fn worker_params(&self, keys: &RunKeys) -> WorkerParams {
        WorkerParams {
            iterations: self.iterations,
            lease_secs: self.lease_secs,
            store: self.store,
            lock_key: keys.lock_key.clone(),
            counter_key: keys.counter_key.clone(),
        }
    }
}

impl TryFrom<&RunArgs> for RunParams {
    type Error = ConfigError;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        Self::new(args.workers, args.iterations, args.lease, args.store)
    }
}

/// Validated worker parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParams {
    pub iterations: u64,
    pub lease_secs: u64,
    pub store: StoreSelector,
    pub lock_key: String,
    pub counter_key: String,
}

impl WorkerParams {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Marshal into the command line understood by [`WorkerArgs`].
    pub fn to_args(&self, stores: &StoreConfig, policy: &AcquirePolicy) -> Vec<String> {
        let mut args = vec![
            "--iterations".to_owned(),
            self.iterations.to_string(),
            "--lease".to_owned(),
            self.lease_secs.to_string(),
            "--store".to_owned(),
            self.store.to_string(),
            "--lock-key".to_owned(),
            self.lock_key.clone(),
            "--counter-key".to_owned(),
            self.counter_key.clone(),
        ];
        args.extend(stores.to_args());
        args.extend(policy.to_args());
        args
    }
}

impl TryFrom<&WorkerArgs> for WorkerParams {
    type Error = ConfigError;

    fn try_from(args: &WorkerArgs) -> Result<Self, Self::Error> {
        if args.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if args.lock_key.is_empty() {
            return Err(ConfigError::EmptyKey("lock-key"));
        }
        if args.counter_key.is_empty() {
            return Err(ConfigError::EmptyKey("counter-key"));
        }
        Ok(Self {
            iterations: args.iterations,
            lease_secs: args.lease,
            store: args.store,
            lock_key: args.lock_key.clone(),
            counter_key: args.counter_key.clone(),
        })
    }
}
