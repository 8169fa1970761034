use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use gateway::{create_router, AppState};
use shared::{BrokerArgs, Publisher, SharedRpcClient};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(about = "HTTP gateway in front of the order, inventory and user services")]
struct Args {
    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::telemetry::init();
    let args = Args::parse();

    let broker = args.broker.broker("gateway");
    let rpc = Arc::new(SharedRpcClient::new(broker.clone()));
    let state = AppState {
        rpc: rpc.clone(),
        publisher: Arc::new(Publisher::new(broker)),
        rpc_timeout: args.broker.rpc_timeout(),
    };

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Gateway listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down gateway");
        })
        .await?;

    if let Err(e) = rpc.close().await {
        warn!("Failed to close RPC client: {}", e);
    }
    Ok(())
}
