use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use bit_service_helper::AuthorizationBackend;
use bit_service_helper::DEFAULT_CONFIG_PATH;
use bit_service_helper::RulesDir;
use bit_service_helper::ServiceConfig;
use bit_service_helper::ServiceHelperServer;
use bit_service_helper::UdevRules;
use bit_service_helper::bind_socket;
use bit_service_helper::oracle_for;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(version)]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Socket to listen on, overriding the configuration file.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Grant every request without asking polkit. Only for testing.
    #[arg(long)]
    no_enforce_authorization: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::load(&cli.config)?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if cli.no_enforce_authorization {
        config.authorization = AuthorizationBackend::None;
    }

    let broker = Arc::new(UdevRules::new(
        config.programs.clone(),
        config.limits,
        RulesDir::new(&config.rules_dir),
        oracle_for(config.authorization),
    ));
    let listener = bind_socket(&config.socket_path)?;
    tracing::info!(
        "Running BIT service on {} (rules in {}, entry point {})",
        config.socket_path.display(),
        config.rules_dir.display(),
        config.programs.entry_point
    );

    let cancel = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });

    ServiceHelperServer::new(broker).serve(listener, cancel).await;

    if let Err(err) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(
            "failed to remove {}: {err}",
            config.socket_path.display()
        );
    }
    Ok(())
}
