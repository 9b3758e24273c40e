use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use a3s_hitl::config::{self, HitlConfig};

#[derive(Parser)]
#[command(
    name = "a3s-hitl",
    version,
    about = "Human-in-the-loop approval daemon for agent sessions"
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Serve {
        /// Config file (default: $A3S_HITL_HOME/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Deny every tool request without recording it
        #[arg(long)]
        auto_deny_all: bool,

        /// Keep all state in memory instead of the data directory
        #[arg(long)]
        memory: bool,
    },

    /// Print the effective configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<HitlConfig> {
    let path = path.unwrap_or_else(|| {
        let home = std::env::var_os(config::HOME_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(config::hitl_home);
        config::config_path(&home)
    });
    let mut config = HitlConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            auto_deny_all,
            memory,
        } => {
            let mut config = load_config(config)?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if auto_deny_all {
                config.gateway.auto_deny_all = true;
            }

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("Shutdown requested");
                        signal_token.cancel();
                    }
                    Err(e) => tracing::warn!(error = %e, "Ctrl-C handler unavailable"),
                }
            });

            a3s_hitl::server::start(config, memory, shutdown).await?;
        }
        Commands::Config { config } => {
            let config = load_config(config)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
