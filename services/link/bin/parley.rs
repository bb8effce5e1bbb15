//! Main Entrypoint for the parley participant
//!
//! `parley serve` runs one scripted participant from environment
//! configuration until Ctrl+C. `parley demo` runs a simulation/chatbot pair
//! in-process and prints what happened as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use parley_link::{
    Communicator, LinkConfig,
    demo::{ChatbotPersona, Persona, SimulationPersona, ask_periodically, run_demo},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "parley", about = "Turn-taking question/answer messaging over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one participant until interrupted.
    Serve {
        #[arg(long, value_enum, default_value_t = PersonaKind::Simulation)]
        persona: PersonaKind,
        /// Overrides PARLEY_NAME.
        #[arg(long)]
        name: Option<String>,
        /// Overrides PARLEY_PORT.
        #[arg(long)]
        port: Option<u16>,
        /// Overrides PARLEY_TARGET_HOST.
        #[arg(long)]
        target_host: Option<String>,
        /// Overrides PARLEY_TARGET_PORT.
        #[arg(long)]
        target_port: Option<u16>,
        /// Seconds between question attempts.
        #[arg(long, default_value_t = 15)]
        interval_secs: u64,
    },
    /// Run a simulation/chatbot pair in-process and print their stats.
    Demo {
        #[arg(long, default_value_t = 8765)]
        first_port: u16,
        #[arg(long, default_value_t = 8766)]
        second_port: u16,
        #[arg(long, default_value_t = 20)]
        duration_secs: u64,
        #[arg(long, default_value_t = 3)]
        interval_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PersonaKind {
    Simulation,
    Chatbot,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

async fn serve<P: Persona + 'static>(
    config: LinkConfig,
    persona: Arc<P>,
    interval: Duration,
) -> anyhow::Result<()> {
    let comm = Communicator::with_config(config);
    comm.set_handler(persona.clone());
    comm.start()
        .await
        .context("Failed to start WebSocket server")?;
    if !comm.connect_as_client().await {
        info!("Peer not reachable yet; will retry before each question");
    }

    let cancel = CancellationToken::new();
    tokio::join!(
        ask_periodically(&comm, persona.as_ref(), interval, cancel.clone()),
        async {
            shutdown_signal().await;
            cancel.cancel();
        },
    );

    let stats = comm.stats().await?;
    info!(stats = %serde_json::to_string(&stats)?, "Final stats");
    comm.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = LinkConfig::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    match cli.command {
        Command::Serve {
            persona,
            name,
            port,
            target_host,
            target_port,
            interval_secs,
        } => {
            if let Some(name) = name {
                config.name = name;
            }
            if let Some(port) = port {
                config.server_port = port;
            }
            if let Some(host) = target_host {
                config.target_host = host;
            }
            if target_port.is_some() {
                config.target_port = target_port;
            }
            info!(name = %config.name, port = config.server_port, target_port = ?config.target_port, "Starting participant");

            let interval = Duration::from_secs(interval_secs.max(1));
            match persona {
                PersonaKind::Simulation => {
                    serve(config, Arc::new(SimulationPersona::new()), interval).await
                }
                PersonaKind::Chatbot => {
                    serve(config, Arc::new(ChatbotPersona::new()), interval).await
                }
            }
        }
        Command::Demo {
            first_port,
            second_port,
            duration_secs,
            interval_secs,
        } => {
            info!(first_port, second_port, duration_secs, "Running demo");
            let report = run_demo(
                first_port,
                second_port,
                Duration::from_secs(duration_secs),
                Duration::from_secs(interval_secs.max(1)),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
