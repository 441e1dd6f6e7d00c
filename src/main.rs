use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use homelab_portal::cli;
use homelab_portal::config::{default_data_dir, load_config};
use homelab_portal::server;

#[derive(Parser, Debug)]
#[command(
    name = "homelab-portal",
    version,
    about = "Single-sign-on home infrastructure portal with guarded upstream proxies"
)]
struct Cli {
    /// Path to the data directory containing config.toml
    #[arg(short, long, default_value_os_t = default_data_dir(), global = true)]
    data_dir: PathBuf,

    /// Override the HTTP port
    #[arg(long)]
    port: Option<u16>,

    /// Override the bind address (127.0.0.1 = local only, 0.0.0.0 = all interfaces)
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the portal server (default)
    Serve,
    /// Print the capability rule registry
    Rules(cli::rules::RulesArgs),
    /// Show which upstreams and auth settings are configured
    Check(cli::check::CheckArgs),
    /// Query a running portal's status endpoint
    Status(cli::status::StatusArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "homelab_portal=debug,info"
    } else {
        "homelab_portal=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Rules(args) => return cli::rules::execute(args),
        Command::Status(args) => return cli::status::execute(args).await,
        Command::Check(args) => {
            let config = load_config(&cli.data_dir.join("config.toml"))?;
            return cli::check::execute(args, &config);
        }
        Command::Serve => {}
    }

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create data directory {:?}", cli.data_dir))?;

    let config_path = cli.data_dir.join("config.toml");
    let mut config = load_config(&config_path)?;

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    info!("Homelab Portal v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", cli.data_dir);
    info!("Public URL: {}", config.server.public_url);

    server::serve(Arc::new(config)).await?;

    info!("Homelab Portal stopped.");
    Ok(())
}
