use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use antload::agent::AgentInstallRequest;
use antload::config::AppConfig;
use antload::context::AppContext;

#[derive(Parser)]
#[command(
    name = "antload",
    about = "Distributed load-test orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (otherwise ANT_CONFIG, then ${ROOT}/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage load-test agents on remote hosts
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Show execution state for one test, or all tests
    State {
        #[arg(long)]
        key: Option<String>,
    },

    /// Show the stored definition for one test, or all tests
    Config {
        #[arg(long)]
        key: Option<String>,
    },

    /// Aggregate request results for a test
    Result {
        #[arg(long)]
        key: String,

        /// normal | aggregate
        #[arg(long)]
        format: Option<String>,
    },

    /// Aggregate host metrics for a test
    Metrics {
        #[arg(long)]
        key: String,

        /// normal | aggregate
        #[arg(long)]
        format: Option<String>,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Install the agent on a host and register it
    Install {
        /// Private key used to reach the host
        #[arg(long)]
        pem_key_path: String,

        #[arg(long)]
        username: String,

        #[arg(long)]
        public_ip: String,
    },

    /// Remove the agent from its host and forget it
    Uninstall {
        #[arg(long)]
        id: i64,
    },

    /// Drop an agent record without contacting its host
    Forget {
        #[arg(long)]
        id: i64,
    },

    /// List registered agents
    List,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        antload::logging::with_bootstrap(|| AppConfig::resolve(cli.config.as_deref()))?;
    antload::logging::init(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting antload");
            antload::serve(config).await
        }
        command => run_command(command, config).await,
    }
}

async fn run_command(command: Commands, config: AppConfig) -> Result<()> {
    let ctx = AppContext::init(config)?;
    let orchestrator = &ctx.orchestrator;

    match command {
        Commands::Serve { .. } => {}
        Commands::Agent { action } => match action {
            AgentAction::Install {
                pem_key_path,
                username,
                public_ip,
            } => {
                let req = AgentInstallRequest {
                    pem_key_path,
                    username,
                    public_ip,
                };
                let id = orchestrator.install_agent(&req).await?;
                println!("Agent {} registered for {}.", id, req.public_ip);
            }
            AgentAction::Uninstall { id } => {
                orchestrator.uninstall_agent(id).await?;
                println!("Agent {} removed.", id);
            }
            AgentAction::Forget { id } => {
                orchestrator.forget_agent(id)?;
                println!("Agent {} record deleted; the host was not contacted.", id);
            }
            AgentAction::List => print_json(&orchestrator.list_agents()?)?,
        },
        Commands::State { key } => match key {
            Some(key) => print_json(&orchestrator.get_state(&key)?)?,
            None => print_json(&orchestrator.list_states()?)?,
        },
        Commands::Config { key } => match key {
            Some(key) => print_json(&orchestrator.get_config(&key)?)?,
            None => print_json(&orchestrator.list_configs()?)?,
        },
        Commands::Result { key, format } => {
            print_json(&orchestrator.result(&key, format.as_deref()).await?)?
        }
        Commands::Metrics { key, format } => {
            print_json(&orchestrator.metrics(&key, format.as_deref()).await?)?
        }
    }

    Ok(())
}
