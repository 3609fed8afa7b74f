//! xmc: one messaging client for many brokers.
//!
//! ```text
//! xmc --backend rabbitmq send orders 'hello'
//! xmc --backend kafka subscribe events --group audit --wait
//! xmc --backend artemis manage stats orders
//! ```
//!
//! ## Configuration
//! - `--config FILE`, `./xmc.yaml` or `XMC_CONFIG`: YAML configuration
//! - `XMC_*`: overrides, nested keys separated by `__` (e.g. `XMC_CONNECTION__SERVER`)
//! - `AMC_*`, `RMC_*`, `KMC_*`...: per-backend server and credentials
//! - `XMC_LOG`: log filter (default `warn`, `debug` with `--verbose`)
//! - `XMC_LOG_FORMAT=json`: JSON log lines on stderr

use std::process::ExitCode;

use clap::Parser;

use xmc::cli::{commands, resolve_config, Cli};
use xmc::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.connection.verbose);

    let outcome = match resolve_config(&cli) {
        Ok(config) => commands::run(cli, config).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
