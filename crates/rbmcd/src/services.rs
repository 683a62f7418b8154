//! Local-system facade.
//!
//! Position and firmware identity come from the platform (u-boot
//! environment, os-release); unit control goes through systemctl; the host
//! and local BMC states come from their state objects on the bus.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rbmc_common::bus::{self, BusClient};
use rbmc_common::ipc::{property, Signal};
use rbmc_common::paths;
use rbmc_common::types::{BMCState, SystemState};
use rbmc_common::version;
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::providers::{Services, SystemStateCallback};
use crate::shutdown::Shutdown;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const UNIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ServicesImpl {
    system_state: Arc<RwLock<Option<SystemState>>>,
    callbacks: Arc<Mutex<Vec<SystemStateCallback>>>,
    fw_digest: OnceLock<String>,
    shutdown: Shutdown,
}

impl ServicesImpl {
    pub fn new(shutdown: Shutdown) -> Self {
        ServicesImpl {
            system_state: Arc::new(RwLock::new(None)),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            fw_digest: OnceLock::new(),
            shutdown,
        }
    }
}

#[async_trait]
impl Services for ServicesImpl {
    async fn init(&self) {
        // The initial read happens inline; the watch task owns updates
        // from then on.
        match read_host_state().await {
            Ok(state) => {
                debug!(state = %state, "Initial host state");
                *self.system_state.write().unwrap() = Some(state);
            }
            Err(_) => {
                // Host state object isn't on the bus yet; the watch task
                // will pick it up when it appears.
            }
        }

        let watcher = HostStateWatcher {
            system_state: Arc::clone(&self.system_state),
            callbacks: Arc::clone(&self.callbacks),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(async move { watcher.run().await });
    }

    fn bmc_position(&self) -> Result<u64> {
        rbmc_common::platform::read_bmc_position()
    }

    fn fw_version_digest(&self) -> String {
        self.fw_digest
            .get_or_init(version::fw_version_digest)
            .clone()
    }

    fn provisioned(&self) -> bool {
        // Plug point until a provisioning source exists.
        true
    }

    fn system_state(&self) -> Option<SystemState> {
        *self.system_state.read().unwrap()
    }

    fn add_system_state_callback(&self, callback: SystemStateCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    async fn unit_state(&self, unit: &str) -> String {
        query_unit_state(unit)
    }

    async fn start_unit(&self, unit: &str) -> Result<()> {
        info!(unit, "Starting unit");

        let output = Command::new("systemctl")
            .args(["start", "--no-block", unit])
            .output()
            .with_context(|| format!("running systemctl start {unit}"))?;

        if !output.status.success() {
            bail!(
                "systemctl start {unit} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut state = String::new();
        while state != "active" && state != "failed" {
            sleep(UNIT_POLL_INTERVAL).await;
            state = query_unit_state(unit);
        }

        info!(unit, state, "Finished waiting for unit to start");
        Ok(())
    }

    async fn bmc_state(&self) -> Result<BMCState> {
        let mut client = BusClient::connect(paths::BMC_STATE_SOCKET)
            .await
            .context("connecting to BMC state object")?;
        let properties = client.get_properties().await?;
        let value = properties
            .get(property::CURRENT_BMC_STATE)
            .context("CurrentBMCState not published")?;
        serde_json::from_value(value.clone()).context("parsing CurrentBMCState")
    }
}

struct HostStateWatcher {
    system_state: Arc<RwLock<Option<SystemState>>>,
    callbacks: Arc<Mutex<Vec<SystemStateCallback>>>,
    shutdown: Shutdown,
}

impl HostStateWatcher {
    async fn run(&self) {
        while !self.shutdown.is_triggered() {
            let mut rx = match bus::subscribe(paths::HOST_STATE_SOCKET).await {
                Ok(rx) => rx,
                Err(_) => {
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            // Re-read on every (re)attach; a change may have happened
            // while the object was away.
            if let Ok(state) = read_host_state().await {
                self.update(state);
            }

            while let Some(signal) = rx.recv().await {
                match signal {
                    Signal::InterfacesAdded { properties }
                    | Signal::PropertiesChanged { properties } => {
                        if let Some(value) = properties
                            .get(property::CURRENT_HOST_STATE)
                            .and_then(|v| v.as_str())
                        {
                            self.update(SystemState::from_host_state(value));
                        }
                    }
                    Signal::InterfacesRemoved | Signal::Heartbeat => {}
                }

                if self.shutdown.is_triggered() {
                    return;
                }
            }
        }
    }

    fn update(&self, state: SystemState) {
        let changed = {
            let mut current = self.system_state.write().unwrap();
            let changed = *current != Some(state);
            *current = Some(state);
            changed
        };

        if changed {
            debug!(state = %state, "Host state changed");
            let callbacks: Vec<SystemStateCallback> =
                self.callbacks.lock().unwrap().clone();
            for callback in callbacks {
                callback(state);
            }
        }
    }
}

async fn read_host_state() -> Result<SystemState> {
    let mut client = BusClient::connect(paths::HOST_STATE_SOCKET).await?;
    let properties = client.get_properties().await?;
    let value = properties
        .get(property::CURRENT_HOST_STATE)
        .and_then(|v| v.as_str())
        .context("CurrentHostState not published")?;
    Ok(SystemState::from_host_state(value))
}

fn query_unit_state(unit: &str) -> String {
    let output = match Command::new("systemctl")
        .args(["show", unit, "--property=ActiveState,LoadState"])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            error!(unit, error = %e, "Unable to query unit state, assuming inactive");
            return "inactive".to_string();
        }
    };

    if !output.status.success() {
        // A unit systemd has never heard of reads as inactive.
        debug!(unit, "systemctl show reported no such unit");
        return "inactive".to_string();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut active_state = String::new();
    let mut load_state = String::new();

    for line in stdout.lines() {
        if let Some((name, value)) = line.split_once('=') {
            match name {
                "ActiveState" => active_state = value.to_string(),
                "LoadState" => load_state = value.to_string(),
                _ => {}
            }
        }
    }

    if load_state == "not-found" {
        return "inactive".to_string();
    }

    if active_state.is_empty() {
        "inactive".to_string()
    } else {
        active_state
    }
}
