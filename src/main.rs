//! Storage Center Block Device Driver
//!
//! Runs the driver's REST API, or performs one-off initiator and inventory
//! tasks on this node.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storagecenter_driver::config::PollSettings;
use storagecenter_driver::{
    ApiServer, ApiServerConfig, BlockDeviceDriver, DriverConfig, InitiatorController, IscsiAdm,
    Portal,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Center block device driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file (options under `dataset:`)
    #[arg(
        long,
        short,
        env = "STORAGECENTER_CONFIG",
        default_value = "/etc/flocker/agent.yml",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the REST API
    Serve {
        /// REST API bind address
        #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
        api_addr: SocketAddr,
    },
    /// Print this node's initiator IQN
    Initiator,
    /// Discover and log in to every target behind a portal
    Login { portal: Portal },
    /// Log out of every target behind a portal
    Logout { portal: Portal },
    /// Rescan all iSCSI sessions
    Rescan,
    /// Print the driver's volumes as JSON
    List,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    match args.command {
        Command::Serve { api_addr } => serve(&args.config, api_addr).await,
        Command::Initiator => {
            println!("{}", local_initiator().initiator_name().await?);
            Ok(())
        }
        Command::Login { portal } => {
            let targets = local_initiator().login_portals(&[portal]).await?;
            for target in targets {
                println!("{} {}", target.portal, target.iqn);
            }
            Ok(())
        }
        Command::Logout { portal } => {
            local_initiator().logout_portals(&[portal]).await?;
            Ok(())
        }
        Command::Rescan => {
            local_initiator().rescan().await?;
            Ok(())
        }
        Command::List => {
            let driver = connect(&args.config).await?;
            let volumes = driver.list_volumes().await?;
            println!("{}", serde_json::to_string_pretty(&volumes)?);
            driver.shutdown().await;
            Ok(())
        }
    }
}

fn local_initiator() -> InitiatorController {
    InitiatorController::new(
        Arc::new(IscsiAdm::default()),
        PollSettings::default().policy(),
    )
}

async fn connect(path: &Path) -> anyhow::Result<BlockDeviceDriver> {
    let config = DriverConfig::from_yaml_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    BlockDeviceDriver::connect(&config, Arc::new(IscsiAdm::default()))
        .await
        .with_context(|| format!("connecting to Storage Center {}", config.dell_sc_ssn))
}

async fn serve(config: &Path, api_addr: SocketAddr) -> anyhow::Result<()> {
    info!(version = storagecenter_driver::VERSION, "Starting Storage Center driver");

    let driver = Arc::new(connect(config).await?);
    let server = ApiServer::new(
        ApiServerConfig {
            rest_addr: api_addr,
        },
        driver.clone(),
    );

    let listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding {}", api_addr))?;
    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    driver.shutdown().await;
    info!("Driver shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=info,tower_http=info",
            level.as_str().to_lowercase()
        ))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
