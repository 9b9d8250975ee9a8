use anyhow::Context;
use gatt_scout::domain::settings::SettingsService;
use gatt_scout::infrastructure::bluetooth::btleplug_backend::BtleplugAdapter;
use gatt_scout::infrastructure::bluetooth::scanner::known_services;
use gatt_scout::infrastructure::bluetooth::ScanController;
use gatt_scout::infrastructure::emit::StdoutSink;
use gatt_scout::infrastructure::logging::init_logger;
use std::sync::Arc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!(
        "Starting GATT scout (settings: {})",
        settings_service.path().display()
    );

    let adapter = BtleplugAdapter::new(settings.scan.adapter_index)
        .await
        .context("Failed to open Bluetooth adapter")?;

    let services = if settings.scan.restrict_to_known_services {
        known_services()
    } else {
        Vec::new()
    };

    let controller = ScanController::new(
        Arc::new(adapter),
        Arc::new(StdoutSink::new(settings.emit.pretty_json)),
        services,
        settings.scan.allow_duplicates,
    );
    controller.run().await?;

    Ok(())
}
