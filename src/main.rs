use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustmemodb_remote::{Dispatcher, IdleReclaimer, ServerConfig, default_drivers, server};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rustmemodb-remote")]
#[command(about = "Command-based remote proxy for database connections")]
#[command(version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides the bind address of the configuration
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate a configuration file and print the resolved settings
    CheckConfig { path: PathBuf },
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("{},hyper=warn,reqwest=warn", level))
            .with_context(|| format!("invalid log level '{}'", level))?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let config = match path {
        Some(path) => ServerConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn serve(config: ServerConfig) -> Result<()> {
    let bind = config.bind.clone();
    let dispatcher = Arc::new(Dispatcher::new(config, default_drivers())?);
    let reclaimer = IdleReclaimer::spawn(&dispatcher);

    tracing::info!("Serving on {} (version {})", bind, env!("CARGO_PKG_VERSION"));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for ctrl-c: {}", e);
        }
        tracing::info!("Shutdown requested");
    };
    let served = server::serve(dispatcher.clone(), &bind, shutdown).await;

    if let Some(reclaimer) = reclaimer {
        reclaimer.stop().await?;
    }
    dispatcher.shutdown().await;
    served.context("server failed")
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    println!("bind: {}", config.bind);
    match config.reclaim_period() {
        Some(period) => println!(
            "idle reclamation: every {}ms, timeout {}ms",
            period.as_millis(),
            config.idle_timeout_ms
        ),
        None => println!("idle reclamation: disabled"),
    }
    for resource in &config.resources {
        let pool = if resource.pool.enabled {
            format!(
                "pool {}..{}",
                resource.pool.min_connections, resource.pool.max_connections
            )
        } else {
            "no pool".to_string()
        };
        println!(
            "resource {} -> {} (packet {}, compression {:?}, {})",
            resource.name, resource.locator, resource.row_packet_size, resource.compression, pool
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Command::Serve { config, bind } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                config = config.bind(&bind);
            }
            serve(config).await
        }
        Command::CheckConfig { path } => check_config(&path),
    }
}
