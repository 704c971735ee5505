use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nix::unistd::Uid;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use wiped::adapters;
use wiped::config::AppConfig;
use wiped::context::AppContext;
use wiped::logging::{self, LogConfig};
use wiped::rpc::{RpcClient, RpcServer};

#[derive(Parser)]
#[command(name = "wiped")]
#[command(about = "Secure data destruction daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon(ServerArgs),
    /// Daemon status
    Status,
    /// List jobs, or show one
    Jobs {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        active: bool,
    },
    /// List attached block devices
    Devices,
    /// Recommend a wipe method for a device
    Method { device: String },
    /// Destroy every file on a device
    Boom { device: String },
    /// Overwrite a raw device region by region
    Pendrive {
        device: String,
        #[arg(long)]
        quick: bool,
    },
    /// Encrypt a device's files in place with a throwaway key
    EncryptWipe { device: String },
    /// Move a device's files into an encrypted backup set
    Backup { device: String },
    /// Restore the newest backup set for a device
    Restore {
        device: String,
        #[arg(long, env = "WIPED_RESTORE_KEY", hide_env_values = true)]
        key: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    persist_key_artifact: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&ServerArgs>)?,
    };

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let client = RpcClient::new(config.rpc_bind);
    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Status => print(client.call("daemon.status", ()).await?)?,
        Commands::Jobs { id: Some(id), .. } => {
            print(client.call("jobs.get", json!({ "id": id })).await?)?
        }
        Commands::Jobs { id: None, active } => {
            print(client.call("jobs.list", json!({ "active_only": active })).await?)?
        }
        Commands::Devices => print(client.call("devices.list", ()).await?)?,
        Commands::Method { device } => {
            print(client.call("wipe.method", json!({ "device": device })).await?)?
        }
        Commands::Boom { device } => {
            print(client.call("wipe.boom", json!({ "device": device })).await?)?
        }
        Commands::Pendrive { device, quick } => {
            let method = if quick { "wipe.quick" } else { "wipe.pendrive" };
            print(client.call(method, json!({ "device": device })).await?)?
        }
        Commands::EncryptWipe { device } => {
            print(client.call("wipe.encrypt", json!({ "device": device })).await?)?
        }
        Commands::Backup { device } => {
            print(client.call("backup.encrypt", json!({ "device": device })).await?)?
        }
        Commands::Restore { device, key } => print(
            client
                .call("backup.restore", json!({ "device": device, "key": key }))
                .await?,
        )?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn print(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    if !config.simulation && !Uid::effective().is_root() {
        warn!("Not running as root; raw device wipes will be denied");
    }

    let resolver = adapters::get_resolver(config.simulation);
    let ctx = AppContext::new(config, resolver);
    let server = RpcServer::bind(ctx.clone())
        .await
        .with_context(|| format!("Failed to bind {}", ctx.config.rpc_bind))?;

    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling running jobs");
            shutdown.cancel();
        }
    });

    info!(
        simulation = ctx.config.simulation,
        backups = %ctx.config.backup_directory.display(),
        "Daemon started"
    );
    server.serve().await
}
