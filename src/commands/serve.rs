use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::bot::Bot;
use crate::config::Config;
use crate::marker::RunningMarker;
use crate::platform::stdio::{StdioGateway, read_events};

/// Serve platform events from stdin until EOF, Ctrl-C or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let marker = RunningMarker::acquire(&config.data_dir)?;
    let platform = Arc::new(StdioGateway::stdout());
    let platform_rx = read_events(tokio::io::stdin());

    let (mut bot, runner_rx) = Bot::new(config, platform);
    info!("serving");
    bot.run(platform_rx, runner_rx, shutdown_signal()).await;

    // Only after every runner is gone.
    marker.release();
    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C stops the server");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
