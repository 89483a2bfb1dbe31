use std::net::SocketAddr;
use tracing::{error, info, warn};

use doubleteam::api::{self, AppState};
use doubleteam::config::Config;
use doubleteam::wiring;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(config: Config, address: Option<SocketAddr>) -> Result<(), AnyError> {
    let address = address.unwrap_or(config.server.bind_addr);
    let pipeline = wiring::build(&config)?;

    let state = AppState::new(pipeline.app.clone(), &config.server);
    let served = api::serve(address, state).await;

    // Drain whatever was accepted before the listener stopped
    let timeout = config.server.shutdown_timeout.as_duration();
    info!(timeout_ms = timeout.as_millis() as u64, "Draining pipeline");
    match tokio::time::timeout(timeout, pipeline.app.close()).await {
        Ok(Ok(())) => info!("Pipeline drained"),
        Ok(Err(e)) => error!(error = %e, "Pipeline closed with errors"),
        Err(_) => warn!("Pipeline drain timed out, pending messages abandoned"),
    }

    let lost = pipeline.app.lost();
    if lost > 0 {
        warn!(lost, "Messages were lost during this run");
    }

    served
}
