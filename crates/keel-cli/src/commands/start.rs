use anyhow::Context;
use tracing::{info, warn};

use keel_config::KeelConfig;
use keel_runtime::Core;

/// Run the host until Ctrl-C.
///
/// The stock binary registers no host services, so `get_storage_service`,
/// `get_network_service` and `get_ui_service` return null for every plugin
/// whatever its grant. Embedders offer services through
/// [`Core::with_services`]; capability queries and events work either way.
pub(super) async fn cmd_start(mut config: KeelConfig, headless: bool) -> anyhow::Result<i32> {
    config.runtime.headless |= headless;

    let mut core = Core::new(config);
    let report = core.initialize().context("failed to initialize core")?;

    for failure in &report.failures {
        warn!(path = ?failure.path, error = %failure.error, "plugin skipped");
    }
    if report.first_run {
        info!("first run on this machine");
    }
    println!(
        "keel running with {} plugin(s); press Ctrl-C to stop",
        report.initialized.len()
    );

    core.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C; stopping");
        }
    })
    .await?;

    core.shutdown()?;
    Ok(0)
}
