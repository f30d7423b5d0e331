//! Command-line interface of traitforge, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (serve, generate, schema,
//! validate) and the global flags (--config, --scene, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use traitforge::config::ForgeConfig;

/// traitforge: weighted trait generation and render orchestration.
#[derive(Debug, Parser)]
#[command(name = "traitforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./traitforge.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Scene description, overriding the configured one.
    #[arg(long, global = true)]
    pub scene: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the HTTP API and its workers.
    Serve {
        /// Address to listen on, overriding the configured one.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Generates variants locally, without the server.
    Generate {
        /// How many variants to generate.
        #[arg(long, default_value_t = 1)]
        count: u64,

        /// Id of the first variant.
        #[arg(long, default_value_t = 1)]
        start_id: u64,

        /// Seed for reproducible output.
        #[arg(long)]
        seed: Option<u64>,

        /// Write the metadata list here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Prints the trait schema of the scene.
    Schema,

    /// Checks a metadata file against the scene.
    Validate {
        /// Metadata JSON (a single object or a list).
        path: PathBuf,
    },
}

impl Cli {
    /// Flags take precedence over the file and the environment.
    pub fn apply(&self, config: &mut ForgeConfig) {
        if let Some(scene) = &self.scene {
            config.scene = Some(scene.clone());
        }
        match &self.command {
            Command::Serve { bind: Some(bind) } => config.bind = bind.clone(),
            Command::Generate { seed: Some(seed), .. } => config.seed = Some(*seed),
            _ => {}
        }
    }
}
