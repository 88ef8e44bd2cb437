//! Entry point of the `envrack` binary.
//!
//! Parses command-line arguments, builds the environment described by the
//! config file and hands the primary command to the supervision loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};

use envrack::config::{abs_dir, load_services, ConfigSource};
use envrack::store::process_env;
use envrack::supervisor::{self, Settings, Supervisor};
use envrack::{logging, watch};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "envrack",
    version,
    about = "Builds an environment from a config file and supervises a command inside it",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the directive file (YAML or JSON).
    #[arg(short, long, default_value = "xe.yml")]
    config: PathBuf,
    /// Only evaluate data directives and print the resulting environment.
    #[arg(short, long)]
    data: bool,
    /// Give children the inherited environment with the config data on top.
    #[arg(long)]
    inherit_env: bool,
    /// Seconds between checks for configuration changes.
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,
    /// Primary command to supervise: -- <cmd> [args...]
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a plain list of services until they all exit.
    Services {
        /// Path to the service list (YAML or JSON).
        #[arg(short, long, default_value = "svcs.yml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    if let Some(Commands::Services { config }) = &cli.command {
        let services = load_services(config)?;
        let dir = abs_dir(config)?;
        return supervisor::serve(&services, &dir).await;
    }

    if cli.poll_interval == 0 {
        bail!("--poll-interval must be at least 1 second");
    }
    let source = ConfigSource::File(cli.config.clone());
    let base = Arc::new(process_env());

    if cli.data {
        let store = watch::recompute(&source, base, cli.inherit_env).await?;
        for line in store.to_env_list() {
            println!("{}", line);
        }
        return Ok(());
    }

    let settings = Settings {
        poll_interval: Duration::from_secs(cli.poll_interval),
        inherit_env: cli.inherit_env,
    };
    Supervisor::new(source, cli.args, base, settings).run().await
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
