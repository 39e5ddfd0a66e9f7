//! Binary entry point for the Overcast CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use overcast::{
    Cancellation, ConfigError, HostOrchestrator, HostProperties, HostRegistry, HostSpec,
    LifecycleError, OvercastConfig, Session,
};

mod cli;

use cli::{CheckCommand, Cli, UpCommand};

const LOG_ENV: &str = "OVERCAST_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Up(command) => up(&command).await,
        Cli::Check(command) => check(&command),
    }
}

fn load_specs(config: &OvercastConfig, labels: &[String]) -> Result<Vec<HostSpec>, CliError> {
    let properties = HostProperties::load_layers(&config.host_property_files())?;
    labels
        .iter()
        .map(|label| HostSpec::from_properties(label, &properties).map_err(CliError::from))
        .collect()
}

fn check(command: &CheckCommand) -> Result<(), CliError> {
    let config = OvercastConfig::load_without_cli_args()?;
    let specs = load_specs(&config, &command.labels)?;
    let mut stdout = io::stdout().lock();
    for spec in &specs {
        writeln!(stdout, "{}\t{}", spec.label, spec.kind())?;
    }
    Ok(())
}

async fn up(command: &UpCommand) -> Result<(), CliError> {
    let config = OvercastConfig::load_without_cli_args()?;
    let specs = load_specs(&config, &command.labels)?;

    let (canceller, cancel) = Cancellation::new();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let orchestrator = Arc::new(HostOrchestrator::from_config(&config));
    let mut session = Session::new(orchestrator, cancel.clone());
    if let Err(err) = session.acquire_all(specs).await {
        if let Err(teardown) = session.teardown_all().await {
            warn!(error = %teardown, "teardown after failed acquisition failed");
        }
        return Err(err.into());
    }

    print_hosts(session.registry())?;
    if command.keep {
        info!("leaving hosts running");
        return Ok(());
    }

    info!("hosts ready; press Ctrl-C to tear them down");
    cancel.cancelled().await;
    session.teardown_all().await?;
    Ok(())
}

fn print_hosts(registry: &HostRegistry) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    for host in registry.iter() {
        let address = host
            .address()
            .map_or_else(String::new, |address| address.host.clone());
        let instance = host
            .instance()
            .map_or_else(String::new, |instance| instance.id.clone());
        writeln!(stdout, "{}\t{address}\t{instance}", host.label())?;
    }
    stdout.flush()?;
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
