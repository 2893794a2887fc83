//! rpc-stress: A load generator for ONC RPC services
//!
//! Opens many concurrent TCP connections to a sum service and drives each
//! through repeated call/reply cycles from a single thread:
//! - Random payloads whose sum is checked against the reply
//! - Irregular partial writes to exercise server-side reassembly
//! - Per-connection deadlines and an error budget
//! - Send and receive latency histograms at the end of the run
//! - Configuration via CLI arguments or TOML file

mod config;
mod driver;
mod histogram;
mod protocols;
mod runtime;

#[cfg(test)]
mod testing;

use config::Config;
use driver::Driver;
use std::io;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout carries the report
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut driver = Driver::new(&config)?;

    let mut stdout = io::stdout().lock();
    let summary = driver.run(&mut stdout)?;
    driver.report(&mut stdout)?;

    if summary.failed() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
