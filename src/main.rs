use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use voice_bridge::http::install_crypto_provider;
use voice_bridge::prelude::*;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    install_crypto_provider();

    let config = Config::parse();
    let reconnector = config.reconnector();
    let ctx = Context::new();
    let hub = Arc::new(BroadcastHub::new(ctx.clone(), reconnector.clone()));

    let client = match Client::builder(config.client_id.clone(), hub.clone())
        .rpc_url(config.rpc_url.clone())
        .origin(config.origin.clone())
        .token_url(config.token_url.clone())
        .reconnector(reconnector)
        .context(ctx)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = hub.start(config.port, config.bind).await {
        error!("Failed to start WebSocket server: {}", e);
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let upstream_cancel = cancel.clone();
    tracker.spawn(async move { client.run(upstream_cancel).await });
    tracker.close();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    cancel.cancel();
    hub.stop().await;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait())
        .await
        .is_err()
    {
        warn!("Upstream client did not stop in time");
    }
}
