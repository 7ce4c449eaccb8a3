mod addresses;
mod agent;
mod backends;
mod capture;
mod config;
mod connections;
mod flows;
mod geo;
mod payload;
mod probes;
mod server;
mod session;
mod sustainability;
mod system;
mod traffic_classifier;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::Agent;
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "hostpulse")]
#[command(version)]
#[command(about = "Real-time host telemetry streamed over WebSocket", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Config file (default: <config dir>/hostpulse/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Capture backend: tcpdump or pnet (anything else disables capture)
    #[arg(long, value_name = "METHOD")]
    capture_method: Option<String>,

    /// Interface to capture on; repeat for several
    #[arg(long = "capture-interface", value_name = "IFACE")]
    capture_interfaces: Vec<String>,

    /// Flow table bound, 0 for unbounded
    #[arg(long, value_name = "N")]
    max_flow_keys: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(method) = self.capture_method {
            config.capture_method = method.to_ascii_lowercase();
        }
        if !self.capture_interfaces.is_empty() {
            config.capture_interfaces = self.capture_interfaces;
        }
        if let Some(max) = self.max_flow_keys {
            config.max_flow_keys = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    log::info!(
        "hostpulse v{} - capture method {}, flow table bound {}",
        env!("CARGO_PKG_VERSION"),
        config.capture_method,
        config.max_flow_keys
    );

    let agent = Arc::new(Agent::new(config)?);
    server::run_server(agent).await
}
