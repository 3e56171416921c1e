//! embedserve server binary

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use embedserve::{Config, Server, set_password};

#[derive(Parser)]
#[command(name = "embedserve", version)]
#[command(about = "Embeddable HTTP/1.1 server", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Set an option, e.g. `-o document_root=/srv/www`; repeatable
    #[arg(short = 'o', long = "option", value_name = "NAME=VALUE")]
    options: Vec<String>,

    /// File of `name value` lines read before any `-o`
    config_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add, change or (with an empty password) remove a digest credential
    Passwd {
        file: PathBuf,
        realm: String,
        user: String,
        password: String,
    },
    /// List every option with its default
    Options,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Passwd {
            file,
            realm,
            user,
            password,
        }) => set_password(&file, &realm, &user, &password)
            .with_context(|| format!("cannot update {}", file.display())),
        Some(Commands::Options) => {
            for (name, default) in Config::options() {
                println!("{name:<28}{default}");
            }
            Ok(())
        }
        None => serve(cli.config_file, &cli.options),
    }
}

fn serve(config_file: Option<PathBuf>, options: &[String]) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match &config_file {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };
    for option in options {
        let Some((name, value)) = option.split_once('=') else {
            bail!("expected NAME=VALUE, got {option:?}");
        };
        config.set(name.trim(), value.trim())?;
    }

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("cannot install signal handlers")?;
    let mut server = Server::start(config)?;

    if let Some(signal) = signals.forever().next() {
        tracing::info!(signal, "shutting down");
    }
    server.stop();
    Ok(())
}
