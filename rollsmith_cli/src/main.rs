mod cli;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::Parser;
use cli::{Cli, Commands};
use rollsmith_rs::analyze::analyze_symbol;
use rollsmith_rs::backtest::backtest;
use rollsmith_rs::context::{self, Context};
use rollsmith_rs::correlation::oos_correlation;
use rollsmith_rs::generate::generate_archives;
use rollsmith_rs::mining::data_mine;
use rollsmith_rs::strategy::emit_strategy_yaml;
use tracing_appender::non_blocking;
use tracing_subscriber::{prelude::*, EnvFilter};

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("failed to create log directory {parent:?}: {err}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| anyhow!("failed to open log file {path:?}: {err}"))?;
        let (non_blocking_writer, guard) = non_blocking(file);
        // The writer flushes on drop of the guard; keep it for the whole process.
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

fn log_invocation(log_file: Option<&PathBuf>) {
    let cwd = std::env::current_dir().ok();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        cwd = ?cwd,
        log_file = ?log_file,
        argv = ?argv,
        "rollsmith invoked"
    );
}

fn load_context(cli: &Cli) -> Result<&'static Context> {
    let loaded = Context::load(&cli.config, &cli.assets)?;
    context::install(loaded)
}

fn run(cli: Cli) -> Result<()> {
    let context = if cli.command.needs_context() {
        Some(load_context(&cli)?)
    } else {
        None
    };
    let context = || context.ok_or_else(|| anyhow!("Configuration was not loaded"));

    match cli.command {
        Commands::Generate(args) => {
            let summaries = generate_archives(context()?, args.symbol.as_deref())?;
            tracing::info!(streams = summaries.len(), "Generation complete");
        }
        Commands::Analyze(args) => {
            analyze_symbol(context()?, &args.symbol, args.output.as_deref())?;
        }
        Commands::Backtest(args) => {
            backtest(context()?, &args.config_file, args.output.as_deref())?;
        }
        Commands::DataMine(args) => {
            let paths = data_mine(context()?, &args.config_file, args.output_dir.as_deref())?;
            tracing::info!(
                strategies = paths.strategies,
                report = %paths.report.display(),
                "Data mining complete"
            );
        }
        Commands::OosCorrelation(args) => {
            oos_correlation(context()?, &args.config_file)?;
        }
        Commands::EmitStrategyYaml(args) => {
            emit_strategy_yaml(&args.input, &args.output, args.dates())?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    log_invocation(cli.log_file.as_ref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
