use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info, Level};

use livereload::bootstrap;
use livereload::child::{ChildCommand, ProcessLauncher};
use livereload::config::{self, ReloadConfig};
use livereload::service::TcpConnector;

/// Read from the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "livereload.toml";

/// Runs a command and keeps it up to date as its source changes: live patch
/// when the program offers it, full restart otherwise.
#[derive(Debug, Parser)]
#[command(name = "livereload", version)]
struct Args {
    /// TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory to watch recursively. Replaces the configured list.
    #[arg(short = 'w', long = "watch", value_name = "PATH")]
    watch: Vec<PathBuf>,

    /// File extension to react to. Replaces the configured list.
    #[arg(short = 'e', long = "ext", value_name = "EXT")]
    ext: Vec<String>,

    /// Extra ignore pattern, added to the configured ones.
    #[arg(short = 'i', long = "ignore", value_name = "PATTERN")]
    ignore: Vec<String>,

    #[arg(long, value_name = "MS")]
    debounce_ms: Option<u64>,

    #[arg(short = 'v', long)]
    verbose: bool,

    /// The program to supervise and its arguments.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<OsString>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("livereload: {e:#}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match supervise(&config, &args.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn supervise(config: &ReloadConfig, argv: &[OsString]) -> Result<i32> {
    let command = ChildCommand::from_argv(argv.iter().cloned())?;
    info!(command = %command.display(), "livereload v{} supervising", env!("CARGO_PKG_VERSION"));

    let launcher = ProcessLauncher::new(command);
    let connector = TcpConnector::new(config.connect_timeout(), config.reload_timeout());
    Ok(bootstrap::supervise(config, Box::new(launcher), Box::new(connector)).await?)
}

/// Defaults, then the config file, then command-line flags.
fn resolve_config(args: &Args) -> Result<ReloadConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            config::load_or_default(path)?
        }
        None => config::load_or_default(Path::new(DEFAULT_CONFIG_FILE))?,
    };

    if !args.watch.is_empty() {
        config.watch_paths = args.watch.clone();
    }
    if !args.ext.is_empty() {
        config.watch_extensions = args.ext.clone();
    }
    config.ignore_patterns.extend(args.ignore.iter().cloned());
    if let Some(ms) = args.debounce_ms {
        config.debounce_ms = ms;
    }
    config.verbose |= args.verbose;
    Ok(config)
}
