pub mod config;
pub mod orchestrator;
pub mod store;
pub mod utils;
pub mod worker;

pub use config::*;

/// Orchestrator exit code: every worker succeeded and the counter matched.
pub const EXIT_PASS: u8 = 0;

/// Exit code for invalid parameters. Nothing was spawned.
pub const EXIT_CONFIG: u8 = 1;

/// Orchestrator exit code: at least one worker failed at the process level.
pub const EXIT_WORKER_FAILURE: u8 = 2;

/// Orchestrator exit code: all workers succeeded but updates were lost.
pub const EXIT_COUNT_MISMATCH: u8 = 3;

/// Orchestrator exit code: the counter store could not be reset or read back.
pub const EXIT_STORE_FAILURE: u8 = 4;

/// Default lease handed to backends that cannot express "no expiry".
pub const DEFAULT_LEASE: std::time::Duration = std::time::Duration::from_secs(30);
