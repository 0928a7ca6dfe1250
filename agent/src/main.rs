//! Parameter-Server Agent Process
//!
//! This binary runs one agent beside one local training worker: it joins
//! the cluster through the master, then serves the worker's pull/push
//! signals until the worker terminates.
//!
//! # Usage
//!
//! ```bash
//! # Join a local master with default settings
//! ps-agent
//!
//! # Custom master and listen port
//! ps-agent --master-addr 10.0.0.1:16666 --listen-port 15000
//!
//! # Start with a configuration file
//! ps-agent --config agent.toml
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{Agent, AgentConfig, ShmWorkerLink, TcpTransport};

/// Parameter-server agent
#[derive(Parser, Debug)]
#[command(name = "ps-agent")]
#[command(about = "Agent-side runtime for a sharded parameter server")]
struct Args {
    /// Master address as host:port
    #[arg(short, long)]
    master_addr: Option<String>,

    /// Port the main receiver listens on
    #[arg(short, long)]
    listen_port: Option<u16>,

    /// Network interface to resolve the announced IP from
    #[arg(long)]
    net_interface: Option<String>,

    /// Announced IP, bypassing interface resolution
    #[arg(long)]
    announced_ip: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// FIFO the worker writes signals into
    #[arg(long)]
    signal_fifo: Option<PathBuf>,

    /// FIFO the agent writes the pull-ready signal into
    #[arg(long)]
    ready_fifo: Option<PathBuf>,

    /// Shared region the worker fills with request batches
    #[arg(long)]
    request_region: Option<PathBuf>,

    /// Shared region the agent fills with pulled parameters
    #[arg(long)]
    reply_region: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// File config, then environment overrides, then explicit flags.
    fn into_config(self) -> Result<AgentConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };
        config = config.with_env_overrides();

        if let Some(addr) = self.master_addr {
            config.master_addr = addr;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(iface) = self.net_interface {
            config.net_interface = Some(iface);
        }
        if let Some(ip) = self.announced_ip {
            config.announced_ip = Some(ip);
        }
        if let Some(path) = self.signal_fifo {
            config.ipc.signal_fifo = path;
        }
        if let Some(path) = self.ready_fifo {
            config.ipc.ready_fifo = path;
        }
        if let Some(path) = self.request_region {
            config.ipc.request_region = path;
        }
        if let Some(path) = self.reply_region {
            config.ipc.reply_region = path;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;

    tracing::info!("Starting parameter-server agent");
    tracing::info!("  Master: {}", config.master_addr);
    tracing::info!("  Listen port: {}", config.listen_port);
    tracing::info!("  Heartbeat port: {}", config.heartbeat_port());

    let sender = TcpTransport::sender();
    let receiver = TcpTransport::bind(config.listen_port, config.inbound_capacity).await?;
    let heartbeat_receiver =
        TcpTransport::bind(config.heartbeat_port(), config.inbound_capacity).await?;

    tracing::info!("Waiting for the local worker to attach");
    let worker = ShmWorkerLink::open(&config.ipc, config.batch_capacity).await?;

    let agent = Agent::initialize(config, sender, receiver, Box::new(worker)).await?;
    tracing::info!("Joined cluster as node {}", agent.local_id());

    let state = agent.start(heartbeat_receiver).await?;
    tracing::info!("Agent exited cleanly ({:?})", state);
    Ok(())
}
