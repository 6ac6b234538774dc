//! Background maintenance task — drains RAM pressure into the disk spool.
//!
//! ```text
//! producer ─┐
//! producer ─┤   wake (mpsc)
//! producer ─┼──────────────▶  maintenance task ──▶ spool files
//! ...       ┘        ▲              │
//!               interval tick       ▼
//!                              sector pool (freed sectors)
//! ```
//!
//! Producers `try_send` a wake whenever an append leaves the pool under
//! the free threshold; a periodic tick covers wakes lost to a full channel.
//! Each pass migrates head sectors from the fattest sensors until pressure
//! clears or the batch budget is spent. File I/O runs with no sensor lock
//! held; see `TelemetryStore::migrate_sensor_head`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MaintenanceConfig;
use crate::store::TelemetryStore;

/// Running maintenance task. Keep it alive for the life of the store;
/// call [`shutdown`](Self::shutdown) to wind it down cleanly.
pub struct MaintenanceHandle {
    tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Detach the wake channel from the store and wait for the task to
    /// finish its current pass and exit.
    pub async fn shutdown(self, store: &TelemetryStore) {
        store.clear_maintenance_waker();
        drop(self.tx);
        let _ = self.task.await;
    }
}

/// Spawn the maintenance task and wire its wake channel into the store.
/// Marks the store as running until shutdown.
pub fn spawn_maintenance(
    store: Arc<TelemetryStore>,
    config: MaintenanceConfig,
) -> MaintenanceHandle {
    let (tx, rx) = mpsc::channel::<()>(16);
    store.set_maintenance_waker(tx.clone());
    store.mark_running(true);

    let task = tokio::spawn(async move {
        maintenance_loop(store, rx, config).await;
    });

    MaintenanceHandle { tx, task }
}

async fn maintenance_loop(
    store: Arc<TelemetryStore>,
    mut rx: mpsc::Receiver<()>,
    config: MaintenanceConfig,
) {
    info!(
        interval_ms = config.interval_ms,
        batch = config.migration_batch,
        "Maintenance task started"
    );
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            wake = rx.recv() => {
                if wake.is_none() {
                    break;
                }
                // Coalesce a burst of wakes into one pass.
                while rx.try_recv().is_ok() {}
            }
        }

        if store.under_pressure() {
            let migrated = store.run_pressure_migration(config.migration_batch);
            if migrated > 0 {
                debug!(migrated, "Maintenance migrated sectors to spool");
            }
        }
    }

    store.mark_running(false);
    info!("Maintenance task shutting down (channel closed)");
}
