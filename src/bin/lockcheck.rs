//! Verify that a distributed lock really excludes concurrent processes.

use std::process::ExitCode;

use clap::Parser;
use lockcheck::orchestrator;
use lockcheck::utils::init_logging;
use lockcheck::{RunArgs, EXIT_CONFIG};

fn main() -> ExitCode {
    init_logging("info");

    let args = match RunArgs::try_parse() {
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

    match orchestrator::execute(&args) {
        Ok(outcome) => {
            println!("{outcome}");
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
