//! Course Lens bridge: entry point.

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use course_lens::Bridge;
use course_lens_bridge::{
    BridgeConfig, BridgeOverrides, HttpBridge, ProtocolHandler, StdioTransport,
};

#[derive(Parser)]
#[command(
    name = "course-lens-bridge",
    about = "Background bridge for Course Lens: metrics, explanation caching and AI formatting",
    version
)]
struct Cli {
    /// Base URL of the metrics and explanation-cache service.
    #[arg(long)]
    metrics_url: Option<String>,

    /// Base URL of the OpenAI-compatible completion API.
    #[arg(long)]
    completion_url: Option<String>,

    /// API key for the completion API.
    #[arg(long)]
    api_key: Option<String>,

    /// Completion model name.
    #[arg(long)]
    model: Option<String>,

    /// HTTP timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer page requests over stdio (default).
    Serve,

    /// Check the metrics service and print the result as JSON.
    Health,

    /// Look up metrics for a query and product id and print them as JSON.
    Metrics {
        /// Search query as typed on the page.
        query: String,

        /// Product id, with or without its namespace prefix.
        product_id: String,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   course-lens-bridge completions bash > ~/.local/share/bash-completion/completions/course-lens-bridge
    ///   course-lens-bridge completions zsh > ~/.zfunc/_course-lens-bridge
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let overrides = BridgeOverrides {
        metrics_url: cli.metrics_url,
        completion_url: cli.completion_url,
        api_key: cli.api_key,
        model: cli.model,
        timeout_secs: cli.timeout,
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = BridgeConfig::resolve(overrides)?;
            tracing::info!(
                metrics_url = %config.metrics_url,
                completion_url = %config.completion_url,
                model = %config.model,
                "Starting bridge"
            );
            let bridge = Arc::new(HttpBridge::from_config(&config)?);
            let handler = ProtocolHandler::new(bridge);
            let transport = StdioTransport::new(handler);
            transport.run().await?;
        }

        Commands::Health => {
            let config = BridgeConfig::resolve(overrides)?;
            let bridge = HttpBridge::from_config(&config)?;
            let health = bridge.check_health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }

        Commands::Metrics { query, product_id } => {
            let config = BridgeConfig::resolve(overrides)?;
            let bridge = HttpBridge::from_config(&config)?;
            let metrics = bridge.fetch_metrics(&query, &product_id).await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "course-lens-bridge", &mut std::io::stdout());
        }
    }

    Ok(())
}
