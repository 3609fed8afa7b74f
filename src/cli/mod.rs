//! Command-line surface of the `xmc` binary.

mod args;
pub mod commands;
pub mod output;

pub use args::{
    Cli, Commands, ConnectionArgs, HeaderArgs, ManageCommand, PublishArgs, ReceiveArgs,
    RequestArgs, SendArgs, SubscribeArgs,
};

use crate::config::Config;

/// Build the effective configuration for a parsed command line.
///
/// Files and `XMC_*` variables first, then flags, then the per-backend
/// legacy variables for anything still unset.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    use anyhow::Context;

    let mut config =
        Config::load(cli.connection.config.as_deref()).context("loading configuration")?;
    cli.connection.apply(&mut config);
    config.apply_legacy_env();
    Ok(config)
}
