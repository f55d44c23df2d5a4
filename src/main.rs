use anyhow::{bail, Context, Result};
use clap::Parser;
use relay_sync::config::Config;
use relay_sync::supervisor::{shutdown_on_ctrl_c, Supervisor};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Synchronize directories of several machines through a shared relay store
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (default: <config dir>/relay-sync/config.toml)
    #[arg(short, long, env = "RELAY_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Only run the named repositories
    #[arg(short, long = "repository", action = clap::ArgAction::Append)]
    repositories: Vec<String>,

    /// Run one round per repository and exit
    #[arg(long)]
    once: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// More output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also append warnings and errors to this file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("cannot locate the user configuration directory")?;
    Ok(dir.join("relay-sync").join("config.toml"))
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter);

    let errors = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::WARN),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(errors)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_file.as_deref())?;

    let path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = Config::load(&path)
        .with_context(|| format!("loading configuration {}", path.display()))?;

    if !args.repositories.is_empty() {
        for name in &args.repositories {
            if !config.repository.iter().any(|r| &r.name == name) {
                bail!("no repository named '{}' in {}", name, path.display());
            }
        }
        config
            .repository
            .retain(|r| args.repositories.contains(&r.name));
    }

    if args.check {
        for repo in &config.repository {
            println!(
                "{}: {} -> {}:{} ({})",
                repo.name,
                repo.local.display(),
                repo.protocol,
                repo.address,
                if repo.index { "paged" } else { "flat" }
            );
        }
        return Ok(());
    }

    let supervisor = Supervisor::new(config);
    if args.once {
        return supervisor.run_once().await;
    }

    info!(config = %path.display(), "starting");
    supervisor.run(shutdown_on_ctrl_c()).await
}
