//! Spawn workers as independent processes and judge the final count.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::store::{self, CounterStore, StoreError};
use crate::worker::WorkerResult;
use crate::*;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Name of the worker executable installed next to the orchestrator.
pub const WORKER_BIN: &str = "lockcheck-worker";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("counter store: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            OrchestratorError::Config(_) => EXIT_CONFIG,
            OrchestratorError::Store(_) => EXIT_STORE_FAILURE,
        }
    }
}

/// How to launch one worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Arguments placed before the marshaled worker parameters.
    pub leading_args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// The worker executable sitting next to the running binary.
    pub fn sibling() -> Result<Self, ConfigError> {
        let exe = std::env::current_exe()
            .map_err(|_| ConfigError::WorkerBinary(PathBuf::from(WORKER_BIN)))?;
        let program = exe
            .with_file_name(WORKER_BIN)
            .with_extension(std::env::consts::EXE_EXTENSION);
        if !program.is_file() {
            return Err(ConfigError::WorkerBinary(program));
        }
        Ok(Self::new(program))
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Exited on its own. `None` when killed by a signal.
    Exited(Option<i32>),
    /// Could not be started.
    SpawnFailed(String),
    /// Started, but waiting for it failed; killed.
    WaitFailed(String),
    /// Still running at the deadline; killed.
    TimedOut,
}

impl ProcessStatus {
    pub fn success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(Some(0)))
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Exited(Some(code)) => write!(f, "exit code {code}"),
            ProcessStatus::Exited(None) => write!(f, "terminated by signal"),
            ProcessStatus::SpawnFailed(e) => write!(f, "could not be started: {e}"),
            ProcessStatus::WaitFailed(e) => write!(f, "could not be waited on: {e}"),
            ProcessStatus::TimedOut => write!(f, "did not finish"),
        }
    }
}

/// Exit status and captured output of one worker.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// 1-based worker index.
    pub index: u64,
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
}

/// A worker that failed at the process level.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub index: u64,
    pub reason: String,
    pub stdout: String,
    pub stderr: String,
}

/// Verdict of one run.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every update was accounted for.
    Pass { count: u64 },
    /// Workers finished but updates were lost: the lock failed.
    CountMismatch { expected: u64, actual: u64 },
    /// Some workers crashed; the count was not checked.
    WorkerFailures {
        workers: u64,
        failures: Vec<WorkerFailure>,
    },
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Pass { .. } => EXIT_PASS,
            Outcome::WorkerFailures { .. } => EXIT_WORKER_FAILURE,
            Outcome::CountMismatch { .. } => EXIT_COUNT_MISMATCH,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass { count } => write!(f, "OK: successfully counted to {count}"),
            Outcome::CountMismatch { expected, actual } => write!(
                f,
                "FAIL: counted only to {actual} instead of the expected {expected}"
            ),
            Outcome::WorkerFailures { workers, failures } => {
                write!(f, "FAIL: {}/{workers} workers failed", failures.len())?;
                for failure in failures {
                    write!(f, "\n  worker {}/{workers}: {}", failure.index, failure.reason)?;
                }
                Ok(())
            }
        }
    }
}

struct Running {
    index: u64,
    child: Child,
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

enum Slot {
    Running(Running),
    Failed { index: u64, error: String },
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // Whatever arrived before the error is still kept.
            if let Err(e) = pipe.read_to_end(&mut buf) {
                tracing::warn!("failed to read worker output: {e}");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_child(child: &mut Child, deadline: Option<Instant>) -> ProcessStatus {
    let Some(deadline) = deadline else {
        return match child.wait() {
            Ok(status) => ProcessStatus::Exited(status.code()),
            Err(e) => wait_failed(child, e),
        };
    };
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return ProcessStatus::Exited(status.code()),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return ProcessStatus::TimedOut;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return wait_failed(child, e),
        }
    }
}

fn wait_failed(child: &mut Child, e: io::Error) -> ProcessStatus {
    tracing::warn!(pid = child.id(), "failed to wait for worker: {e}");
    let _ = child.kill();
    ProcessStatus::WaitFailed(e.to_string())
}

/// Drives one test run.
pub struct Orchestrator<C: CounterStore> {
    params: RunParams,
    keys: RunKeys,
    counter: C,
    worker: WorkerCommand,
    worker_args: Vec<String>,
    timeout: Option<Duration>,
}

impl<C: CounterStore> Orchestrator<C> {
    /// Configure a run with fresh identifiers.
    pub fn new(
        params: RunParams,
        counter: C,
        worker: WorkerCommand,
        stores: &StoreConfig,
        policy: &AcquirePolicy,
    ) -> Self {
        let keys = RunKeys::generate();
        let worker_args = params.worker_params(&keys).to_args(stores, policy);
        Self {
            params,
            keys,
            counter,
            worker,
            worker_args,
            timeout: None,
        }
    }

    /// Kill workers still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keys(&self) -> &RunKeys {
        &self.keys
    }

    pub fn params(&self) -> &RunParams {
        &self.params
    }

    /// Clear the counter and make sure it is gone.
    pub fn prepare(&mut self) -> Result<(), StoreError> {
        let key = &self.keys.counter_key;
        self.counter.forget(key)?;
        if self.counter.fetch(key)?.is_some() {
            return Err(StoreError::ResetFailed(key.clone()));
        }
        Ok(())
    }

    fn spawn_one(&self, index: u64) -> Slot {
        let spawned = Command::new(&self.worker.program)
            .args(&self.worker.leading_args)
            .args(&self.worker_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match spawned {
            Ok(mut child) => {
                let stdout = drain::<ChildStdout>(child.stdout.take());
                let stderr = drain::<ChildStderr>(child.stderr.take());
                Slot::Running(Running {
                    index,
                    child,
                    stdout,
                    stderr,
                })
            }
            Err(e) => Slot::Failed {
                index,
                error: e.to_string(),
            },
        }
    }

    /// Launch every worker before waiting on any of them.
    fn spawn(&self) -> Vec<Slot> {
        let n = self.params.workers;
        (1..=n)
            .map(|index| {
                let slot = self.spawn_one(index);
                match &slot {
                    Slot::Running(_) => tracing::info!("process {index}/{n} started"),
                    Slot::Failed { error, .. } => {
                        tracing::error!("process {index}/{n} could not be started: {error}")
                    }
                }
                slot
            })
            .collect()
    }

    /// Block until every worker has exited, in index order.
    fn await_all(&self, slots: Vec<Slot>) -> Vec<ProcessOutcome> {
        let n = self.params.workers;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Running(mut running) => {
                    let status = wait_child(&mut running.child, deadline);
                    tracing::info!("process {}/{n} finished", running.index);
                    ProcessOutcome {
                        index: running.index,
                        status,
                        stdout: running.stdout.join().unwrap_or_default(),
                        stderr: running.stderr.join().unwrap_or_default(),
                    }
                }
                Slot::Failed { index, error } => ProcessOutcome {
                    index,
                    status: ProcessStatus::SpawnFailed(error),
                    stdout: String::new(),
                    stderr: String::new(),
                },
            })
            .collect()
    }

    /// Split finished workers into parsed results or process-level failures.
    pub fn diagnose(
        &self,
        outcomes: &[ProcessOutcome],
    ) -> Result<Vec<WorkerResult>, Vec<WorkerFailure>> {
        let failure = |o: &ProcessOutcome, reason: String| WorkerFailure {
            index: o.index,
            reason,
            stdout: o.stdout.clone(),
            stderr: o.stderr.clone(),
        };

        let failed = outcomes
            .iter()
            .filter(|o| !o.status.success())
            .map(|o| failure(o, o.status.to_string()))
            .collect::<Vec<_>>();
        if !failed.is_empty() {
            return Err(failed);
        }

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        for o in outcomes {
            match self.parse_result(&o.stdout) {
                Ok(result) => results.push(result),
                Err(reason) => failed.push(failure(o, reason)),
            }
        }
        if failed.is_empty() {
            Ok(results)
        } else {
            Err(failed)
        }
    }

    fn parse_result(&self, stdout: &str) -> Result<WorkerResult, String> {
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| "no result payload".to_owned())?;
        let result: WorkerResult = serde_json::from_str(line)
            .map_err(|e| format!("malformed result payload: {e}"))?;
        if result.lock_key != self.keys.lock_key || result.counter_key != self.keys.counter_key {
            return Err("result payload belongs to another run".to_owned());
        }
        if result.iterations != self.params.iterations {
            return Err(format!(
                "worker ran {} iterations instead of {}",
                result.iterations, self.params.iterations
            ));
        }
        Ok(result)
    }

    /// Compare the final counter to `workers × iterations`.
    pub fn verify(&mut self, results: &[WorkerResult]) -> Result<Outcome, StoreError> {
        let n = self.params.workers;
        for (i, r) in results.iter().enumerate() {
            tracing::info!(
                "process {}/{n} started at {} and ended at {}",
                i + 1,
                r.first_observed_value,
                r.last_observed_value
            );
            if r.last_observed_value < r.first_observed_value {
                tracing::warn!("process {}/{n} observed the counter going backwards", i + 1);
            }
        }

        let expected = self.params.expected_count();
        let actual = self.counter.get(&self.keys.counter_key, 0)?;
        Ok(if actual == expected {
            Outcome::Pass { count: actual }
        } else {
            Outcome::CountMismatch { expected, actual }
        })
    }

    /// Prepare, spawn, await, diagnose and verify.
    pub fn run(&mut self) -> Result<Outcome, StoreError> {
        tracing::info!(
            "running {} iterations with {} workers using the '{}' lock",
            self.params.iterations,
            self.params.workers,
            self.params.store
        );
        self.prepare()?;

        let slots = self.spawn();
        let outcomes = self.await_all(slots);
        match self.diagnose(&outcomes) {
            Ok(results) => self.verify(&results),
            Err(failures) => {
                for f in &failures {
                    tracing::error!(
                        "process {}/{} failed: {}\n{}{}",
                        f.index,
                        self.params.workers,
                        f.reason,
                        f.stdout,
                        f.stderr
                    );
                }
                Ok(Outcome::WorkerFailures {
                    workers: self.params.workers,
                    failures,
                })
            }
        }
    }
}

/// Entry point of the orchestrator binary.
pub fn execute(args: &RunArgs) -> Result<Outcome, OrchestratorError> {
    let params = RunParams::try_from(args)?;
    let worker = match &args.worker_bin {
        Some(path) => WorkerCommand::new(path),
        None => WorkerCommand::sibling()?,
    };
    let counter = store::open_counter(&args.stores)?;
    let mut orchestrator = Orchestrator::new(params, counter, worker, &args.stores, &args.policy)
        .with_timeout(args.timeout_secs.map(Duration::from_secs));
    Ok(orchestrator.run()?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::store::FileCounter;

    fn orchestrator(dir: &std::path::Path, workers: u64) -> Orchestrator<FileCounter> {
        let params = RunParams::new(workers, 10, 0, StoreSelector::File).unwrap();
        let stores = StoreConfig {
            counter: CounterBackend::File,
            redis_url: String::new(),
            memcached_url: String::new(),
            file_dir: Some(dir.to_owned()),
        };
        Orchestrator::new(
            params,
            FileCounter::open(dir).unwrap(),
            WorkerCommand::new("/nonexistent/lockcheck-worker"),
            &stores,
            &AcquirePolicy::default(),
        )
    }

    fn payload(o: &Orchestrator<FileCounter>, first: u64, last: u64) -> String {
        serde_json::to_string(&WorkerResult {
            iterations: o.params.iterations,
            lease_duration: 0,
            store_selector: StoreSelector::File,
            lock_key: o.keys.lock_key.clone(),
            counter_key: o.keys.counter_key.clone(),
            first_observed_value: first,
            last_observed_value: last,
        })
        .unwrap()
    }

    fn exited(index: u64, code: i32, stdout: String) -> ProcessOutcome {
        ProcessOutcome {
            index,
            status: ProcessStatus::Exited(Some(code)),
            stdout,
            stderr: String::new(),
        }
    }

    #[test]
    fn test_prepare_clears_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = orchestrator(dir.path(), 2);
        let key = o.keys.counter_key.clone();
        o.counter.put(&key, 17).unwrap();

        o.prepare().unwrap();
        assert_eq!(o.counter.fetch(&key).unwrap(), None);
        o.prepare().unwrap();
        assert_eq!(o.counter.fetch(&key).unwrap(), None);
    }

    #[test]
    fn test_failed_worker_skips_verification() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(dir.path(), 2);
        let outcomes = vec![
            exited(1, 0, payload(&o, 0, 10)),
            ProcessOutcome {
                index: 2,
                status: ProcessStatus::Exited(None),
                stdout: String::new(),
                stderr: "killed".to_owned(),
            },
        ];
        let failures = o.diagnose(&outcomes).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 2);
        assert_eq!(failures[0].reason, "terminated by signal");
        assert_eq!(failures[0].stderr, "killed");
    }

    #[test]
    fn test_wait_failure_is_its_own_reason() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(dir.path(), 2);
        let status = ProcessStatus::WaitFailed("interrupted".to_owned());
        assert!(!status.success());

        let outcomes = vec![
            exited(1, 0, payload(&o, 0, 10)),
            ProcessOutcome {
                index: 2,
                status,
                stdout: String::new(),
                stderr: String::new(),
            },
        ];
        let failures = o.diagnose(&outcomes).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, "could not be waited on: interrupted");
    }

    /// Yields `data` once, then fails.
    struct BrokenPipe {
        data: &'static [u8],
    }

    impl Read for BrokenPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            let n = self.data.len().min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_drain_keeps_output_read_before_an_error() {
        let out = drain(Some(BrokenPipe { data: b"partial" })).join().unwrap();
        assert_eq!(out, "partial");
        assert_eq!(drain(None::<BrokenPipe>).join().unwrap(), "");
    }

    #[test]
    fn test_malformed_payload_is_a_process_failure() {
        let dir = tempfile::tempdir().unwrap();
        let o = orchestrator(dir.path(), 2);
        let other_run = payload(&o, 0, 10).replace(&o.keys.counter_key, "another-counter");

        let outcomes = vec![
            exited(1, 0, "{not json".to_owned()),
            exited(2, 0, other_run),
        ];
        let failures = o.diagnose(&outcomes).unwrap_err();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].reason.starts_with("malformed result payload"));
        assert_eq!(failures[1].reason, "result payload belongs to another run");
    }

    #[test]
    fn test_verify_pass_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = orchestrator(dir.path(), 2);
        let key = o.keys.counter_key.clone();
        let outcomes = vec![
            exited(1, 0, format!("noise\n{}\n", payload(&o, 0, 19))),
            exited(2, 0, payload(&o, 1, 20)),
        ];
        let results = o.diagnose(&outcomes).unwrap();
        assert_eq!(results.len(), 2);

        o.counter.put(&key, 20).unwrap();
        let outcome = o.verify(&results).unwrap();
        assert!(outcome.is_pass());
        assert_eq!(outcome.exit_code(), EXIT_PASS);

        o.counter.put(&key, 13).unwrap();
        let outcome = o.verify(&results).unwrap();
        assert!(matches!(
            outcome,
            Outcome::CountMismatch {
                expected: 20,
                actual: 13
            }
        ));
        assert_eq!(outcome.exit_code(), EXIT_COUNT_MISMATCH);
        assert_eq!(
            outcome.to_string(),
            "FAIL: counted only to 13 instead of the expected 20"
        );
    }

    #[test]
    fn test_missing_worker_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = orchestrator(dir.path(), 3);
        let outcome = o.run().unwrap();
        match &outcome {
            Outcome::WorkerFailures { workers, failures } => {
                assert_eq!(*workers, 3);
                assert_eq!(
                    failures.iter().map(|f| f.index).collect::<Vec<_>>(),
                    vec![1, 2, 3]
                );
                assert!(failures[0].reason.starts_with("could not be started"));
            }
            other => panic!("unexpected outcome: {other}"),
        }
        assert_eq!(outcome.exit_code(), EXIT_WORKER_FAILURE);
    }

    #[test]
    fn test_zero_workers_spawns_nothing() {
        let args = RunArgs::try_parse_from([
            "lockcheck",
            "--workers",
            "0",
            "--worker-bin",
            "/nonexistent/lockcheck-worker",
        ])
        .unwrap();
        let err = execute(&args).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(ConfigError::ZeroWorkers)));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }
}
