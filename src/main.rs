mod cli;
mod commands;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use traitforge::config::ForgeConfig;
use traitforge::hooks::NoHooks;
use ui::BatchProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = ForgeConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    match cli.command {
        Command::Serve { .. } => traitforge::api::serve(config, Arc::new(NoHooks)).await,
        Command::Generate {
            count,
            start_id,
            output,
            ..
        } => {
            let generated = tokio::task::spawn_blocking(move || {
                let progress = if console::Term::stderr().is_term() {
                    BatchProgress::start(count)
                } else {
                    BatchProgress::hidden(count)
                };
                commands::generate(&config, count, start_id, &progress)
            })
            .await
            .context("generation task panicked")??;
            commands::write_output(&generated.metadata, output.as_deref())?;
            if !generated.failures.is_empty() {
                bail!("{} of {count} variants failed", generated.failures.len());
            }
            Ok(())
        }
        Command::Schema => {
            println!("{}", commands::schema(&config)?);
            Ok(())
        }
        Command::Validate { path } => {
            let report = commands::validate(&config, &path)?;
            let lines = BatchProgress::hidden(0);
            let mut invalid = 0;
            for (id, result) in &report {
                match result {
                    Ok(()) => println!("{}", lines.ok_line(&format!("metadata {id} is valid"))),
                    Err(e) => {
                        invalid += 1;
                        println!("{}", lines.error_line(&format!("metadata {id}: {e}")));
                    }
                }
            }
            if invalid > 0 {
                bail!("{invalid} of {} metadata entries are invalid", report.len());
            }
            Ok(())
        }
    }
}

/// `info` by default, `debug` with --verbose; `RUST_LOG` wins over both.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
