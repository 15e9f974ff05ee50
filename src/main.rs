use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use ble_client_lib::config::AppConfig;
use ble_client_lib::core::BluetoothManager;
use ble_client_lib::core::bluetooth::{BLUETOOTH_OPERATION_TIMEOUT_SECS, ConnectionSnapshot, ConnectionState};
use ble_client_lib::logging::{EventLogger, LogMessage};
use ble_client_lib::state::AppState;
use log::{Level, LevelFilter, info, warn};
use tokio::sync::{mpsc, watch};

const CONFIG_PATH_ENV: &str = "BLE_CLIENT_CONFIG";
const TARGET_ENV: &str = "BLE_CLIENT_TARGET";
const DEFAULT_CONFIG_PATH: &str = "ble-client.json";

#[tokio::main]
async fn main() -> Result<()> {
    let warnings = Arc::new(AtomicUsize::new(0));
    if let Some(receiver) = setup_logging() {
        tokio::spawn(count_warnings(receiver, warnings.clone()));
    }

    let config_path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load_config(&config_path).await?;
    if let Some(level) = config.log_level.as_deref() {
        match level.parse::<LevelFilter>() {
            Ok(filter) => log::set_max_level(filter),
            Err(_) => warn!("Unknown log level {:?} in config, keeping default", level),
        }
    }

    let state = AppState::new(&config)
        .await
        .context("Failed to initialize AppState with BluetoothManager")?;
    let manager_arc = state.get_bluetooth_manager_arc();
    let mut manager = manager_arc.lock().await;

    let target = env::var(TARGET_ENV).ok().map(|t| t.to_uppercase());
    let result = run(&mut manager, &config, target.as_deref()).await;
    manager.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&manager.snapshot())?);

    let count = warnings.load(Ordering::Relaxed);
    if count > 0 {
        eprintln!("Finished with {} warnings", count);
    }
    result
}

fn setup_logging() -> Option<mpsc::UnboundedReceiver<LogMessage>> {
    match EventLogger::init(Level::Info) {
        Ok(receiver) => Some(receiver),
        Err(_) => {
            // only fall back to env_logger when the event logger cannot be installed
            let _ = env_logger::builder()
                .filter_level(LevelFilter::Info)
                .try_init();
            None
        }
    }
}

async fn count_warnings(mut receiver: mpsc::UnboundedReceiver<LogMessage>, count: Arc<AtomicUsize>) {
    while let Some(message) = receiver.recv().await {
        if message.level == "WARN" || message.level == "ERROR" {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run(manager: &mut BluetoothManager, config: &AppConfig, target: Option<&str>) -> Result<()> {
    let scan_duration = Duration::from_secs(config.scan.scan_duration_secs);
    let mut scan = manager.subscribe_scan();

    manager.start_scan().await;
    info!("Scanning for {}s...", scan_duration.as_secs());
    // returns early once the target shows up, otherwise scans for the full duration
    let _ = tokio::time::timeout(
        scan_duration,
        scan.wait_for(|session| {
            target.is_some_and(|target| session.discovered.iter().any(|p| p.address == target))
        }),
    )
    .await;
    manager.stop_scan().await;

    let Some(target) = target else {
        for device in manager.snapshot().found_devices {
            println!("{}  {}", device.address, device.display_name());
        }
        return Ok(());
    };

    let device = manager
        .snapshot()
        .found_devices
        .into_iter()
        .find(|p| p.address == target)
        .ok_or_else(|| anyhow!("Device {} not found within {}s", target, scan_duration.as_secs()))?;

    manager.select_device(Some(device)).await;
    let mut connection = manager
        .subscribe_connection()
        .ok_or_else(|| anyhow!("No active device after selection"))?;

    manager.connect_active().await?;
    let snapshot = wait_settled(&mut connection).await?;
    if !snapshot.is_connected() {
        return Err(anyhow!("Could not connect to {}", target));
    }

    manager.discover_active_services().await?;
    wait_settled(&mut connection).await?;

    manager.read_password().await?;
    let snapshot = wait_settled(&mut connection).await?;
    match snapshot.last_read_value {
        Some(password) => info!("Password: {}", password),
        None => warn!("Password read failed: {:?}", snapshot.last_failure),
    }

    manager.write_name().await?;
    let snapshot = wait_settled(&mut connection).await?;
    info!("Name written {} times", snapshot.successful_write_count);
    Ok(())
}

/// Waits until no connect attempt or GATT operation is outstanding
async fn wait_settled(connection: &mut watch::Receiver<ConnectionSnapshot>) -> Result<ConnectionSnapshot> {
    let timeout = Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS + 1);
    let snapshot = tokio::time::timeout(
        timeout,
        connection.wait_for(|s| !s.is_busy() && s.state != ConnectionState::Connecting),
    )
    .await
    .context("Timed out waiting for the peripheral")?
    .context("Connection task ended")?
    .clone();
    Ok(snapshot)
}
