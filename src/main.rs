use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rpcgate::config::{AppConfig, DEFAULT_CONFIG_FILE};
use rpcgate::gateway::Gateway;
use rpcgate::logging::{self, LogConfig};
use rpcgate::rpc::{Codec, RpcClient};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "rpcgate")]
#[command(about = "RPC server framework and HTTP gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./rpcgate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[arg(long, global = true)]
    log_json: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Route HTTP calls to registered backends
    Gateway(GatewayArgs),
    /// Perform one RPC call and print the result
    Call(CallArgs),
    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

#[derive(Args, Serialize)]
struct GatewayArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    prefix_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Extra backend as NAME=RPC_ADDR[,HTTP_ADDR]; repeatable
    #[serde(skip)]
    #[arg(long = "backend")]
    backends: Vec<String>,
}

#[derive(Args)]
struct CallArgs {
    #[arg(long)]
    addr: String,

    /// Fully qualified `Service.Method`
    #[arg(long)]
    method: String,

    /// JSON-encoded parameters
    #[arg(long, default_value = "null")]
    params: String,

    /// Use the binary framed protocol instead of JSON-RPC
    #[arg(long)]
    binary: bool,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    log_json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<&'a GatewayArgs>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        AppConfig::write_default(path).context("Failed to write configuration")?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let overrides = Overrides {
        verbose: cli.verbose,
        log_json: cli.log_json,
        gateway: match &cli.command {
            Commands::Gateway(args) => Some(args),
            _ => None,
        },
    };
    let config = AppConfig::new(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: config.log_json,
        verbose: config.verbose,
    });

    match &cli.command {
        Commands::Gateway(args) => run_gateway(config, args).await.context("Gateway failed")?,
        Commands::Call(args) => run_call(args).await.context("Call failed")?,
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

async fn run_gateway(config: AppConfig, args: &GatewayArgs) -> Result<()> {
    let gateway = Gateway::new(config.gateway);

    for entry in &args.backends {
        let (name, rpc, http) = parse_backend(entry)?;
        gateway.add_or_update(name, rpc, http).await;
    }

    gateway.listen().await?;
    Ok(())
}

fn parse_backend(entry: &str) -> Result<(&str, &str, Option<&str>)> {
    let Some((name, addrs)) = entry.split_once('=') else {
        bail!("backend {:?} must look like NAME=RPC_ADDR[,HTTP_ADDR]", entry);
    };
    if name.is_empty() || addrs.is_empty() {
        bail!("backend {:?} is missing a name or address", entry);
    }
    Ok(match addrs.split_once(',') {
        Some((rpc, http)) => (name, rpc, Some(http)),
        None => (name, addrs, None),
    })
}

async fn run_call(args: &CallArgs) -> Result<()> {
    let params: Value = serde_json::from_str(&args.params).context("--params is not valid JSON")?;
    let codec = if args.binary { Codec::Binary } else { Codec::Json };

    let client = RpcClient::new(args.addr.as_str())
        .with_codec(codec)
        .with_timeout(args.timeout_secs.map(Duration::from_secs));

    let result = client.call_value(&args.method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
