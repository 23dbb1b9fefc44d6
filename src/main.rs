use clap::{Parser, Subcommand};
use tracing::info;

use canopy::config::Config;
use canopy::watch::session;

/// canopy — watches an IRC network's spanning tree from the inside.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and monitor until the session ends
    Run {
        /// Path to the configuration file
        #[arg(default_value = "canopy.toml")]
        config: String,
    },
    /// Load the configuration file and report problems
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "canopy.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => {
            let config = Config::load(&config)?;
            info!(server = %config.server, channel = %config.channel, "canopy starting");
            session::run(config, None).await?;
        }
        Commands::Validate { config } => {
            let config = Config::load(&config)?;
            println!("{}: ok (server {})", config.nickname, config.server);
        }
    }
    Ok(())
}
