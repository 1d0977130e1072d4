use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_supervisor::{ProcessWorkerLauncher, RuntimeController, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "warden-supervisor")]
#[command(about = "Local runtime supervisor for background task workers", long_about = None)]
struct Args {
    /// Control-plane channel address
    #[arg(short, long)]
    control: Option<String>,

    /// Control-plane presence stream address
    #[arg(short, long)]
    presence: Option<String>,

    /// Supervisor ID (auto-generated if not provided)
    #[arg(long)]
    supervisor_id: Option<String>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        SupervisorConfig::from_file(config_path)?
    } else {
        SupervisorConfig::default()
    };

    // Override with CLI args
    if let Some(control) = args.control {
        config.control_addr = control;
    }
    if let Some(presence) = args.presence {
        config.presence_addr = presence;
    }
    if let Some(supervisor_id) = args.supervisor_id {
        config.supervisor_id = Some(supervisor_id);
    }

    let launcher = Arc::new(ProcessWorkerLauncher::new(config.spawn.clone()));
    let mut controller = RuntimeController::new(config, launcher);

    // Cannot operate without the control plane's runtime settings
    controller.init().await?;

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal");
    controller.shutdown().await;

    Ok(())
}
