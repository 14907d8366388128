//! adc-batteryd - ADC fuel-gauge daemon.
//!
//! This daemon estimates battery state of charge from a resistor-divider
//! ADC channel, smooths it into a stable displayed percentage, and
//! publishes power-supply-style state to consumers.

mod charger;
mod config;
mod error;
mod estimator;
mod logging;
mod monitor;
mod sampler;
mod store;
mod supply;
mod table;

use charger::{ChargeSourceDetector, PlatformHooks, SysfsGpio, SysfsWakeLock};
use config::ConfigManager;
use estimator::CapacityEstimator;
use monitor::{BatteryMonitor, MonitorSettings};
use sampler::{SysfsAdc, VoltageSampler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use store::CapacityStore;
use supply::BatterySnapshot;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Graceful shutdown timeout in seconds
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Retry interval after a D-Bus connection failure in seconds
const SLEEP_WATCH_RETRY_SECS: u64 = 30;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with JSON format to both stderr and rotating file
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        e
    })?;

    info!("adc-batteryd starting...");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("adc-batteryd shut down gracefully"),
        Err(e) => error!("adc-batteryd error: {}", e),
    }

    result
}

/// Main daemon entry point.
async fn run_daemon() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config_path = ConfigManager::default_path();
    let config_manager = Arc::new(ConfigManager::load_or_default(&config_path)?);
    info!("Configuration loaded from {:?}", config_path);

    let config = config_manager.get();
    config.validate()?;
    let table = config.table()?;

    // Hardware bindings
    let adc = Arc::new(SysfsAdc::new(config.board.adc_path.clone()));
    let gpio = Arc::new(SysfsGpio::new());
    let mut hooks = PlatformHooks {
        power_off: Some(Box::new(orderly_poweroff)),
        ..Default::default()
    };
    if config.daemon.wake_lock {
        hooks.wake_lock = Some(Box::new(SysfsWakeLock::new("adc-batteryd")));
    }

    let sampler = VoltageSampler::new(adc, config.board.divider, config.daemon.window);
    let detector = ChargeSourceDetector::new(
        gpio,
        None,
        hooks,
        config.board.pins.clone(),
        config.daemon.usb_identify_ticks,
    );
    let estimator = CapacityEstimator::new(config.daemon.tuning);
    let store = config
        .board
        .save_capacity
        .then(|| CapacityStore::new(config.store_path(), config.board.store_format));

    let settings = MonitorSettings {
        low_voltage_protection_mv: config.board.low_voltage_protection_mv,
        save_capacity: config.board.save_capacity,
        resume_recompute_secs: config.daemon.resume_recompute_secs,
        ..Default::default()
    };

    let (snapshot_tx, snapshot_rx) = watch::channel(BatterySnapshot::default());
    let mut battery = BatteryMonitor::new(
        table, sampler, detector, estimator, store, settings, snapshot_tx,
    );

    // Cold-start priming burst, blocking and bounded, before any ticking.
    battery.power_on_check();
    let monitor = Arc::new(Mutex::new(battery));
    let suspended = Arc::new(AtomicBool::new(false));

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Set up signal handlers
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(shutdown_tx_clone).await {
            error!("Signal handler error: {}", e);
        }
    });

    // Spawn suspend/resume watcher
    let sleep_monitor = Arc::clone(&monitor);
    let sleep_suspended = Arc::clone(&suspended);
    let sleep_shutdown_rx = shutdown_rx.clone();
    let sleep_handle = tokio::spawn(async move {
        run_sleep_watcher(sleep_monitor, sleep_suspended, sleep_shutdown_rx).await;
    });

    // Spawn battery state change reporter
    let report_handle = tokio::spawn(run_change_reporter(snapshot_rx, shutdown_rx.clone()));

    // Spawn the periodic tick task
    let tick_monitor = Arc::clone(&monitor);
    let tick_suspended = Arc::clone(&suspended);
    let tick_shutdown_rx = shutdown_rx.clone();
    let tick_ms = config.daemon.tick_ms;
    let tick_handle = tokio::spawn(async move {
        run_tick_loop(tick_monitor, tick_suspended, tick_ms, tick_shutdown_rx).await;
    });

    info!("adc-batteryd initialized and running");

    // Wait for shutdown signal
    let mut shutdown_rx_main = shutdown_rx.clone();
    shutdown_rx_main.changed().await.ok();

    info!("Shutdown signal received, stopping tasks...");

    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(tick_handle, sleep_handle, report_handle);
    })
    .await;

    // Final unthrottled persist so the next boot seeds from current state.
    monitor.lock().await.shutdown_persist();

    info!("All tasks stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown.
/// Handles SIGTERM and SIGINT.
#[cfg(unix)]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Stub signal handler for non-Unix development hosts
#[cfg(not(unix))]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Periodic tick driver. The next tick is armed only after the current one
/// completes, so updates never overlap; suspend parks the loop entirely.
async fn run_tick_loop(
    monitor: Arc<Mutex<BatteryMonitor>>,
    suspended: Arc<AtomicBool>,
    tick_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = Duration::from_millis(tick_ms);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Tick loop shutting down");
                    break;
                }
            }
            _ = tokio::time::sleep(period) => {
                if suspended.load(Ordering::Acquire) {
                    continue;
                }
                let mut battery = monitor.lock().await;
                battery.tick(now_secs());
            }
        }
    }
}

/// Watch logind for suspend/resume transitions, reconnecting on D-Bus
/// failure.
async fn run_sleep_watcher(
    monitor: Arc<Mutex<BatteryMonitor>>,
    suspended: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Sleep watcher shutting down");
                    break;
                }
            }
            result = watch_sleep_signals(&monitor, &suspended) => {
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            "Sleep watcher error: {}, retrying in {} seconds",
                            e, SLEEP_WATCH_RETRY_SECS
                        );
                        tokio::time::sleep(Duration::from_secs(SLEEP_WATCH_RETRY_SECS)).await;
                    }
                }
            }
        }
    }
}

/// Subscribe to login1 PrepareForSleep and forward the boundary to the
/// monitor: snapshot on the way down, restore-or-recompute on the way up.
async fn watch_sleep_signals(
    monitor: &Arc<Mutex<BatteryMonitor>>,
    suspended: &Arc<AtomicBool>,
) -> Result<(), zbus::Error> {
    use zbus::export::futures_util::StreamExt;

    let connection = zbus::Connection::system().await?;
    let proxy = zbus::Proxy::new(
        &connection,
        "org.freedesktop.login1",
        "/org/freedesktop/login1",
        "org.freedesktop.login1.Manager",
    )
    .await?;
    let mut stream = proxy.receive_signal("PrepareForSleep").await?;
    info!("Watching logind for suspend/resume");

    while let Some(message) = stream.next().await {
        let entering_sleep: bool = message.body().deserialize()?;
        let mut battery = monitor.lock().await;
        if entering_sleep {
            suspended.store(true, Ordering::Release);
            battery.suspend(now_secs());
        } else {
            battery.resume(now_secs());
            suspended.store(false, Ordering::Release);
        }
    }

    Ok(())
}

/// Log battery state changes as they are published.
async fn run_change_reporter(
    mut snapshot_rx: watch::Receiver<BatterySnapshot>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *snapshot_rx.borrow_and_update();
                info!(
                    capacity = snapshot.capacity,
                    voltage_mv = snapshot.voltage_mv,
                    status = ?snapshot.status,
                    ac_online = snapshot.ac_online,
                    usb_online = snapshot.usb_online,
                    "battery state changed"
                );
            }
        }
    }
}

/// Hard low-voltage policy action: an orderly system power-off.
fn orderly_poweroff() {
    if let Err(e) = std::process::Command::new("systemctl")
        .arg("poweroff")
        .spawn()
    {
        error!("Failed to invoke poweroff: {}", e);
    }
}
