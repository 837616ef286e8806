use agency_proxy::{start_proxy_server, ProxyConfig};
use clap::Parser;
use std::net::IpAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Embedding proxy server
///
/// Serves `GET <endpoint>?url=<absolute-url>` and returns the page
/// rewritten for framing.
#[derive(Parser, Debug)]
#[command(name = "agency-proxy-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, env = "AGENCY_PROXY_ADDR", default_value = "127.0.0.1")]
    addr: IpAddr,

    /// Port to bind (0 picks a free port)
    #[arg(long, short = 'p', env = "AGENCY_PROXY_PORT", default_value_t = 0)]
    port: u16,

    /// Path of the proxy endpoint
    #[arg(long, env = "AGENCY_PROXY_ENDPOINT", default_value = "/proxy")]
    endpoint: String,

    /// Upstream fetch timeout in seconds
    #[arg(long, env = "AGENCY_PROXY_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agency_proxy=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = ProxyConfig {
        bind_addr: args.addr,
        port: args.port,
        endpoint_path: args.endpoint,
        fetch_timeout_secs: args.timeout_secs,
    };

    let handle = match start_proxy_server(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down proxy on port {}", handle.port());
    handle.shutdown();
    handle.join().await;
}
