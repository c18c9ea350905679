use std::process::ExitCode;

use clap::Parser;
use loanprint_lib::cli::{self, Cli};
use loanprint_lib::config;

fn main() -> ExitCode {
    loanprint_lib::init_tracing();
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    match cli::run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
