//! Control surface of the data-sync daemon.
//!
//! The replication machinery itself is a black box; this component can
//! trigger a full sync and wait for its verdict, switch background sync
//! off, and relay sync-health changes to whichever role handler cares.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rbmc_common::bus::{self, BusClient};
use rbmc_common::ipc::{property, Method, Signal};
use rbmc_common::paths;
use rbmc_common::types::{FullSyncStatus, Role, SyncEventsHealth};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::providers::{SyncControl, SyncHealthCallback};
use crate::shutdown::Shutdown;

/// The sync daemon can take a while to come up; finding it is a bounded
/// retry, not a hard failure.
const LOOKUP_RETRIES: usize = 200;
const LOOKUP_DELAY: Duration = Duration::from_millis(100);
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct SyncInterfaceImpl {
    full_sync_in_progress: Arc<AtomicBool>,
    callbacks: Arc<Mutex<HashMap<Role, SyncHealthCallback>>>,
    shutdown: Shutdown,
}

impl SyncInterfaceImpl {
    pub fn new(shutdown: Shutdown) -> Self {
        SyncInterfaceImpl {
            full_sync_in_progress: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }
}

/// Clears the in-progress flag on every exit path, including errors.
struct InProgressGuard(Arc<AtomicBool>);

impl InProgressGuard {
    fn arm(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        InProgressGuard(Arc::clone(flag))
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncControl for SyncInterfaceImpl {
    async fn init(&self) {
        let watcher = HealthWatcher {
            callbacks: Arc::clone(&self.callbacks),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(async move { watcher.run().await });
    }

    async fn do_full_sync(&self) -> Result<bool> {
        let mut client = BusClient::connect_with_retries(
            paths::SYNC_SOCKET,
            LOOKUP_RETRIES,
            LOOKUP_DELAY,
        )
        .await
        .context("looking up sync daemon")?;

        // Make sure background sync is enabled before asking for a full one.
        client
            .call(Method::SetDisableSync { disable: false })
            .await
            .context("enabling sync")?;

        // Subscribe before the status reads so a completion between the
        // read and the wait can't be missed.
        let mut events = bus::subscribe(paths::SYNC_SOCKET).await?;

        let _guard = InProgressGuard::arm(&self.full_sync_in_progress);

        let status = read_full_sync_status(&mut client).await?;
        if status != FullSyncStatus::InProgress {
            info!("Starting full sync and waiting for completion");
            client
                .call(Method::StartFullSync)
                .await
                .context("starting full sync")?;
        } else {
            info!("A full sync is already in progress, waiting for completion");
        }

        let mut status = read_full_sync_status(&mut client).await?;

        while status == FullSyncStatus::InProgress && !self.shutdown.is_triggered() {
            match events.recv().await {
                Some(Signal::PropertiesChanged { properties })
                | Some(Signal::InterfacesAdded { properties }) => {
                    if let Some(value) = properties.get(property::FULL_SYNC_STATUS) {
                        if let Ok(parsed) = serde_json::from_value(value.clone()) {
                            status = parsed;
                        }
                    }
                }
                Some(_) => {}
                None => bail!("sync daemon went away during full sync"),
            }
        }

        info!(status = %status, "Full sync completed");
        Ok(status == FullSyncStatus::Completed)
    }

    fn is_full_sync_in_progress(&self) -> bool {
        self.full_sync_in_progress.load(Ordering::SeqCst)
    }

    async fn disable_background_sync(&self) {
        let result = async {
            let mut client = BusClient::connect_with_retries(
                paths::SYNC_SOCKET,
                LOOKUP_RETRIES,
                LOOKUP_DELAY,
            )
            .await?;
            client.call(Method::SetDisableSync { disable: true }).await
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "Call to disable sync failed");
        }
    }

    fn add_sync_health_callback(&self, role: Role, callback: SyncHealthCallback) {
        self.callbacks.lock().unwrap().insert(role, callback);
    }

    fn clear_sync_health_callbacks(&self, role: Role) {
        self.callbacks.lock().unwrap().remove(&role);
    }
}

async fn read_full_sync_status(client: &mut BusClient) -> Result<FullSyncStatus> {
    let properties = client.get_properties().await?;
    let value = properties
        .get(property::FULL_SYNC_STATUS)
        .context("FullSyncStatus not published")?;
    serde_json::from_value(value.clone()).context("parsing FullSyncStatus")
}

struct HealthWatcher {
    callbacks: Arc<Mutex<HashMap<Role, SyncHealthCallback>>>,
    shutdown: Shutdown,
}

impl HealthWatcher {
    async fn run(&self) {
        while !self.shutdown.is_triggered() {
            let mut rx = match bus::subscribe(paths::SYNC_SOCKET).await {
                Ok(rx) => rx,
                Err(_) => {
                    sleep(WATCH_RECONNECT_DELAY).await;
                    continue;
                }
            };

            while let Some(signal) = rx.recv().await {
                if let Signal::PropertiesChanged { properties } = signal {
                    if let Some(value) = properties.get(property::SYNC_EVENTS_HEALTH) {
                        match serde_json::from_value::<SyncEventsHealth>(value.clone()) {
                            Ok(health) => self.dispatch(health),
                            Err(e) => {
                                error!(error = %e, "Unparseable SyncEventsHealth");
                            }
                        }
                    }
                }

                if self.shutdown.is_triggered() {
                    return;
                }
            }

            sleep(WATCH_RECONNECT_DELAY).await;
        }
    }

    fn dispatch(&self, health: SyncEventsHealth) {
        let callbacks: Vec<SyncHealthCallback> = {
            let guard = self.callbacks.lock().unwrap();
            guard.values().cloned().collect()
        };
        for callback in callbacks {
            callback(health);
        }
    }
}
