use std::sync::Arc;

use clap::Parser;
use parley_broker::{Broker, MemoryChatStore};

mod config;
mod logging;
mod server;
mod state;

use config::ServerConfig;
use logging::init_logging;
use server::run_server;
use state::AppState;

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-server")]
#[command(about = "Parley chat broker server")]
#[command(version)]
struct Cli {
    /// Bind host (overrides config)
    #[arg(long, env = "PARLEY_HOST")]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(long, env = "PARLEY_PORT")]
    port: Option<u16>,

    /// Log level (overrides RUST_LOG default)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let mut config = ServerConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    // 内存存储: 生产部署时替换为数据库实现
    let store = Arc::new(MemoryChatStore::new());
    let broker = Arc::new(Broker::new(store));

    let state = AppState::new(broker, config);
    run_server(state).await
}
