//! One contender: increments the shared counter under the lock and reports
//! what it saw as a JSON line on stdout.

use std::io::Write;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use lockcheck::utils::init_logging;
use lockcheck::worker::{self, WorkerResult};
use lockcheck::{WorkerArgs, EXIT_CONFIG};

fn emit(result: &WorkerResult) -> anyhow::Result<()> {
    let payload = serde_json::to_string(result).with_context(|| "failed to serialize result")?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{payload}").with_context(|| "failed to write result")?;
    out.flush().with_context(|| "failed to flush result")?;
    Ok(())
}

fn main() -> ExitCode {
    init_logging("warn");

    let args = match WorkerArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let result = match worker::execute(&args) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };
    if let Err(e) = emit(&result) {
        tracing::error!("{e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
