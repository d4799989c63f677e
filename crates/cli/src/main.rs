use clap::Parser;
use std::path::PathBuf;
use taskgate_config::ClientSettings;
use taskgate_core::events::LoggingSubscriber;
use taskgate_task::TaskGate;

mod commands;
mod execute;

use commands::Commands;

#[derive(Parser)]
#[command(name = "taskgate")]
#[command(about = "Discover and run build server tasks from the command line", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON settings file, overlaid with TASKGATE_* environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Unix socket the build server listens on
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Build server executable to launch when none is listening
    #[arg(long, global = true)]
    server: Option<PathBuf>,

    /// Project root to load tasks from (repeatable)
    #[arg(long = "root", global = true)]
    roots: Vec<PathBuf>,

    /// Seconds to wait for the build server to become ready
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn settings(&self) -> taskgate_core::Result<ClientSettings> {
        let mut settings = match &self.config {
            Some(path) => ClientSettings::load(path)?,
            None => ClientSettings::from_env()?,
        };
        if let Some(socket) = &self.socket {
            settings.socket_path = socket.clone();
        }
        if let Some(server) = &self.server {
            settings.server_executable = Some(server.clone());
        }
        if !self.roots.is_empty() {
            settings.project_roots = self.roots.clone();
        }
        if let Some(timeout) = self.timeout {
            settings.connect_timeout_secs = timeout;
        }
        if settings.project_roots.is_empty() {
            settings.project_roots.push(std::env::current_dir()?);
        }
        settings.debug_logging |= self.debug;
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let settings = cli.settings()?;
    taskgate_utils::tracing::init(settings.debug_logging)
        .map_err(|e| eyre::eyre!("failed to initialise logging: {e}"))?;

    let gate = TaskGate::new(settings);
    let logger = gate
        .events()
        .spawn_subscriber(std::sync::Arc::new(LoggingSubscriber::new(cli.debug)));

    let result = cli.command.execute(&gate).await;

    if let Err(e) = gate.shutdown().await {
        tracing::debug!(error = %e, "build server shutdown failed");
    }
    logger.abort();

    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
