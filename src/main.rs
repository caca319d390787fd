use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskherd::agent::Agent;
use taskherd::config::{AgentConfig, ControllerConfig};
use taskherd::controller::Controller;
use taskherd::driver::DriverRegistry;
use taskherd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "taskherd")]
#[command(version)]
#[command(about = "A minimal cluster job scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the controller: agent listener, scheduler and HTTP API
    Controller {
        /// Path to the controller config file
        #[arg(long, short = 'c', default_value = "./controller-config.json")]
        config: PathBuf,
    },

    /// Run an agent that executes jobs for a controller
    Agent {
        /// Path to the agent config file
        #[arg(long, short = 'c', default_value = "./agent-config.json")]
        config: PathBuf,
    },

    /// Run a controller and one local agent in a single process
    Dev {
        /// Data directory for job logs
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

// =============================================================================
// Subcommands
// =============================================================================

async fn run_controller(config: ControllerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    Controller::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let drivers = DriverRegistry::with_defaults();
    tracing::info!(name = %config.name, cluster = %config.cluster, drivers = ?drivers.names(), "Starting agent");
    Agent::new(config, drivers).run(shutdown).await?;
    Ok(())
}

async fn run_dev(data_dir: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let mut controller_config = ControllerConfig::dev()?;
    if let Some(dir) = data_dir {
        controller_config.data_dir = dir;
    }
    let agent_config = AgentConfig::dev(&controller_config.addresses.tcp)?;
    tracing::info!(
        http = %controller_config.addresses.http,
        tcp = %controller_config.addresses.tcp,
        data_dir = %controller_config.data_dir.display(),
        "Starting dev cluster"
    );

    let shutdown = install_shutdown_handler()?;
    let controller = tokio::spawn(Controller::new(controller_config).run(shutdown.clone()));

    // give the controller a moment to bind before the agent dials in
    tokio::time::sleep(Duration::from_millis(500)).await;
    let agent = Agent::new(agent_config, DriverRegistry::with_defaults());
    let agent_result = agent.run(shutdown.clone()).await;

    shutdown.cancel();
    controller.await??;
    agent_result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Controller { config } => {
            run_controller(ControllerConfig::load(&config)?).await?;
        }
        Commands::Agent { config } => {
            run_agent(AgentConfig::load(&config)?).await?;
        }
        Commands::Dev { data_dir } => {
            run_dev(data_dir).await?;
        }
    }

    Ok(())
}
