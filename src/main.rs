use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use listing_fetch_engine::api::telemetry::init_tracing;
use listing_fetch_engine::api::FetchService;
use listing_fetch_engine::config::ServiceConfig;
use listing_fetch_engine::server::ApiServer;
use listing_fetch_engine::store::JsonDirSink;

/// Config file path: first CLI argument, else `LISTING_FETCH_CONFIG`.
fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("LISTING_FETCH_CONFIG").map(PathBuf::from))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = config_path();
    let config = ServiceConfig::load(path.as_deref())?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow!("invalid listen address {}:{}: {}", config.host, config.port, e))?;
    let sink_dir = PathBuf::from(&config.state_dir).join("listings");

    let service = Arc::new(
        FetchService::builder(config)
            .result_sink(Arc::new(JsonDirSink::new(sink_dir)))
            .build()?,
    );
    let scheduler = service
        .start_scheduler()
        .await
        .context("starting scheduler")?;
    let server = ApiServer::start(Arc::clone(&service), addr).await?;
    info!("listing-fetchd ready on {}", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    server.shutdown().await;
    service.dispose().await;
    if let Err(e) = scheduler.await {
        warn!("scheduler task ended abnormally: {}", e);
    }
    info!("listing-fetchd stopped");
    Ok(())
}
