//! `keel run`: the long-running plugin host.

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config_bridge;
use crate::theme::Theme;

pub(crate) async fn run_host(config: &Config) -> Result<()> {
    let service = Arc::new(config_bridge::loader_service(config)?);

    if config.scanner.scan_on_startup {
        match service.scan().await {
            Ok(report) => info!(
                added = report.added.len(),
                removed = report.removed.len(),
                "startup scan complete"
            ),
            Err(e) => warn!(error = %e, "startup scan failed"),
        }
    }

    let restored = service
        .restore_enabled()
        .await
        .context("failed to restore enabled plugins")?;
    println!(
        "{}",
        Theme::success(&format!(
            "Host running with {} active plugin(s); scanning every {}s",
            restored.len(),
            config.scanner.interval_secs
        ))
    );

    let cancel = CancellationToken::new();
    let scanner =
        Arc::clone(&service).spawn_periodic_scan(config.scanner.interval(), cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    println!("{}", Theme::info("Shutting down"));

    cancel.cancel();
    if let Err(e) = scanner.await {
        warn!(error = %e, "periodic scan task ended abnormally");
    }
    service.shutdown().await;
    Ok(())
}
