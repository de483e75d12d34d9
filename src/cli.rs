use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::io::Read;
use std::path::PathBuf;

use crate::config::parse_config;
use crate::exec::ProcessExecutor;
use crate::kernel::namespace::probe_capabilities;
use crate::kernel::signal::SignalHandler;
use crate::verdict::ReportEmitter;

/// Run one command in an isolated sandbox and report how it ended.
///
/// The run configuration is a JSON document read from stdin unless
/// `--config` names a file. The report is written to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Read the run configuration from this file instead of stdin
    #[arg(long, value_name = "PATH", env = "RUNBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Log every setup step to stderr
    #[arg(
        long,
        env = "RUNBOX_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "warn" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();
}

fn read_config_text(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read config from stdin")?;
            Ok(text)
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let text = read_config_text(cli.config.as_ref())?;
    let config = parse_config(&text).context("invalid run configuration")?;

    let signals = SignalHandler::init()
        .map_err(anyhow::Error::msg)
        .context("failed to install signal handlers")?;

    let caps = probe_capabilities();
    log::debug!("Host capabilities: {:?}", caps);

    let executor = ProcessExecutor::new(config, &caps)
        .context("sandbox setup refused")?
        .with_signal_handler(signals);
    let run_id = executor.run_id().to_string();

    let outcome = executor
        .execute()
        .with_context(|| format!("run {} failed", run_id))?;

    ReportEmitter::stdout()
        .emit(&outcome.report)
        .context("failed to write report")?;
    Ok(())
}
