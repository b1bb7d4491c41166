// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tabgain Daemon - Per-tab volume control service.
//!
//! The daemon owns the controller state machine and the audio worker thread.
//! It consumes the browser bridge for tab access and capture, and exposes a
//! D-Bus interface the panel client connects to.

mod audio;
mod config;
mod dbus;
mod host;
mod service;

use dbus::DaemonDbusService;
use host::TabHost;
use service::SignalEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tabgain_ipc::{DBUS_NAME, DBUS_PATH};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info, warn};
use zbus::connection::Builder;

/// How often the domain-preference maintenance pass runs.
const MAINTENANCE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tabgain_daemon=debug".parse()?)
                .add_directive("zbus=warn".parse()?),
        )
        .init();

    info!("Tabgain Daemon starting...");

    // Load configuration
    let config_manager = config::ConfigManager::new()?;

    // Connect to the browser bridge
    let browser = Arc::new(host::BrowserHost::connect()?);
    let host: Arc<dyn TabHost> = browser.clone();

    // Start the audio worker thread
    let audio = audio::AudioThread::spawn(host.clone())?;

    // Create signal channel for D-Bus signal events
    let (signal_tx, signal_rx) = tokio_mpsc::unbounded_channel::<SignalEvent>();

    // Route browser tab events into the service
    let (host_event_tx, host_event_rx) = mpsc::channel();
    browser.subscribe_events(host_event_tx)?;

    // Create the coordinator service
    let mut coordinator = service::CoordinatorService::new(host, audio, config_manager);
    coordinator.set_signal_sender(signal_tx);
    coordinator.set_host_event_receiver(host_event_rx);

    // Recover controllers persisted by the previous run
    coordinator.restore_controllers();

    // Startup maintenance pass over the domain-preference store
    coordinator.run_domain_maintenance();

    // Wrap in Arc<Mutex> for D-Bus access
    let service = Arc::new(Mutex::new(coordinator));

    // Create D-Bus interface
    let dbus_service = DaemonDbusService::new(service.clone());

    // Build D-Bus connection
    let connection = Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, dbus_service)?
        .build()
        .await?;

    info!("D-Bus service registered at {}", DBUS_NAME);
    info!("Tabgain Daemon ready");

    // Shutdown flag for graceful termination
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    // Spawn event processing task
    let service_events = service.clone();
    let shutdown_flag_events = shutdown_flag.clone();
    let event_task = tokio::spawn(async move {
        while !shutdown_flag_events.load(Ordering::Relaxed) {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(mut svc) = service_events.lock() {
                svc.process_host_events();
            }
        }
    });

    // Spawn task to emit D-Bus signals from the signal channel
    let shutdown_flag_signals = shutdown_flag.clone();
    let signal_task = tokio::spawn(async move {
        let mut signal_rx = signal_rx;
        loop {
            tokio::select! {
                Some(event) = signal_rx.recv() => {
                    let object_server = connection.object_server();
                    let iface_ref = match object_server.interface::<_, DaemonDbusService>(DBUS_PATH).await {
                        Ok(iface) => iface,
                        Err(e) => {
                            warn!("Failed to get D-Bus interface for signal: {}", e);
                            continue;
                        }
                    };
                    let ctx = iface_ref.signal_context();
                    match event {
                        SignalEvent::TabsUpdated => {
                            if let Err(e) = dbus::emit_tabs_updated(ctx).await {
                                warn!("Failed to emit TabsUpdated signal: {}", e);
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                    if shutdown_flag_signals.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
    });

    // Periodic domain-preference maintenance
    let service_maintenance = service.clone();
    let shutdown_flag_maintenance = shutdown_flag.clone();
    let maintenance_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await; // the startup pass already ran
        while !shutdown_flag_maintenance.load(Ordering::Relaxed) {
            interval.tick().await;
            if let Ok(svc) = service_maintenance.lock() {
                svc.run_domain_maintenance();
            }
        }
    });

    // Handle shutdown signals
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    // Signal the tasks to stop
    shutdown_flag.store(true, Ordering::Relaxed);
    maintenance_task.abort();

    // Wait for tasks to finish (with timeout)
    let _ = tokio::time::timeout(tokio::time::Duration::from_secs(2), event_task).await;
    let _ = tokio::time::timeout(tokio::time::Duration::from_secs(1), signal_task).await;

    // Cleanup: persist state and release every captured stream
    match service.lock() {
        Ok(mut svc) => svc.shutdown(),
        Err(e) => error!("Could not lock service for shutdown: {}", e),
    }

    info!("Tabgain Daemon stopped");
    Ok(())
}
