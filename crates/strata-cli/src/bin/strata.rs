// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `strata` entry point.

use anyhow::Result;
use clap::Parser;
use strata_cli::{config_service, run, Cli};
use strata_config::CliPrefs;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config_service(cli.config_dir.as_deref())?;
    let prefs: CliPrefs = config.load()?;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&prefs.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let out = run(cli, &config, &prefs)?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
