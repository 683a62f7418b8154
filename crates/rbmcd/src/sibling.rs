//! Cached view of the peer BMC.
//!
//! The peer publishes its redundancy, BMC-state, version, and heartbeat
//! interfaces as one object aggregate; the transport exposes it locally at
//! a well-known socket. This component keeps a cache of those properties,
//! driven by the signal stream, and collapses the whole view to "not there"
//! the moment the interfaces disappear, the heartbeat stops, or the peer's
//! service dies uncleanly.

use async_trait::async_trait;
use rbmc_common::bus::{self, BusClient};
use rbmc_common::ipc::{property, PropertyMap, Signal};
use rbmc_common::paths;
use rbmc_common::types::{BMCState, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::providers::{BmcStateCallback, BoolCallback, Sibling};
use crate::shutdown::Shutdown;

/// The unit that runs the peer-facing transport. If it isn't active the
/// sibling can never appear on the local bus.
pub const UNIT_NAME: &str = "rbmc-sibling.service";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ROLE_TIMEOUT: Duration = Duration::from_secs(10);
const STEADY_STATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const HEARTBEAT_CHANGE_PAUSE: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone)]
struct View {
    interface_present: bool,
    heartbeat: bool,
    role: Role,
    bmc_state: BMCState,
    redundancy_enabled: bool,
    failovers_allowed: bool,
    fw_version: String,
    position: u64,
    provisioned: bool,
    comms_ok: bool,
}

#[derive(Default)]
struct Callbacks {
    heartbeat: HashMap<Role, BoolCallback>,
    redundancy_enabled: HashMap<Role, BoolCallback>,
    failovers_allowed: HashMap<Role, BoolCallback>,
    bmc_state: HashMap<Role, BmcStateCallback>,
}

pub struct SiblingImpl {
    view: Arc<RwLock<View>>,
    callbacks: Arc<Mutex<Callbacks>>,
    shutdown: Shutdown,
    initialized: AtomicBool,
}

impl SiblingImpl {
    pub fn new(shutdown: Shutdown) -> Self {
        SiblingImpl {
            view: Arc::new(RwLock::new(View::default())),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            shutdown,
            initialized: AtomicBool::new(false),
        }
    }

    fn watcher(&self) -> Watcher {
        Watcher {
            view: Arc::clone(&self.view),
            callbacks: Arc::clone(&self.callbacks),
            shutdown: self.shutdown.clone(),
        }
    }

    /// True while the cached values may be acted on at all.
    fn view_valid(&self) -> bool {
        let view = self.view.read().unwrap();
        view.interface_present && view.heartbeat
    }

    fn valid_field<T>(&self, get: impl Fn(&View) -> T) -> Option<T> {
        let view = self.view.read().unwrap();
        (view.interface_present && view.heartbeat).then(|| get(&view))
    }
}

#[async_trait]
impl Sibling for SiblingImpl {
    async fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            info!("Sibling init called more than once");
            return;
        }

        let watcher = self.watcher();

        // The first attach happens inline so the manager's startup checks
        // see the real initial presence.
        let stream = match bus::subscribe(paths::SIBLING_SOCKET).await {
            Ok(stream) => {
                watcher.load_properties().await;
                Some(stream)
            }
            Err(_) => {
                watcher.view.write().unwrap().interface_present = false;
                None
            }
        };

        info!(
            present = self.interface_present(),
            "Sibling initialized"
        );

        tokio::spawn(async move { watcher.run(stream).await });
    }

    fn is_bmc_present(&self) -> bool {
        // Plug point until a presence source exists.
        true
    }

    fn interface_present(&self) -> bool {
        self.view.read().unwrap().interface_present
    }

    fn has_heartbeat(&self) -> bool {
        let view = self.view.read().unwrap();
        view.interface_present && view.heartbeat
    }

    fn role(&self) -> Option<Role> {
        self.valid_field(|v| v.role)
    }

    fn bmc_state(&self) -> Option<BMCState> {
        self.valid_field(|v| v.bmc_state)
    }

    fn redundancy_enabled(&self) -> Option<bool> {
        self.valid_field(|v| v.redundancy_enabled)
    }

    fn failovers_allowed(&self) -> Option<bool> {
        self.valid_field(|v| v.failovers_allowed)
    }

    fn fw_version(&self) -> Option<String> {
        self.valid_field(|v| v.fw_version.clone())
    }

    fn position(&self) -> Option<u64> {
        self.valid_field(|v| v.position)
    }

    fn provisioned(&self) -> Option<bool> {
        self.valid_field(|v| v.provisioned)
    }

    fn comms_ok(&self) -> Option<bool> {
        self.valid_field(|v| v.comms_ok)
    }

    fn last_known_redundancy_enabled(&self) -> bool {
        self.view.read().unwrap().redundancy_enabled
    }

    async fn wait_for_sibling_up(&self, timeout: Duration) {
        let start = Instant::now();
        let mut waiting = false;

        while !self.view_valid()
            && start.elapsed() < timeout
            && !self.shutdown.is_triggered()
        {
            if !waiting {
                info!(
                    timeout_secs = timeout.as_secs(),
                    present = self.interface_present(),
                    heartbeat = self.has_heartbeat(),
                    "Waiting for sibling interfaces and heartbeat"
                );
                waiting = true;
            }
            sleep(POLL_INTERVAL).await;
        }

        info!(
            present = self.interface_present(),
            heartbeat = self.has_heartbeat(),
            "Done waiting for sibling"
        );
    }

    async fn wait_for_role(&self) {
        let no_role = || self.role().unwrap_or(Role::Unknown) == Role::Unknown;

        if !self.has_heartbeat() || !no_role() {
            return;
        }

        info!(
            timeout_secs = ROLE_TIMEOUT.as_secs(),
            "Waiting for sibling role"
        );

        let start = Instant::now();
        while no_role() && start.elapsed() < ROLE_TIMEOUT && !self.shutdown.is_triggered() {
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_steady_state(&self) {
        // A dead sibling isn't worth waiting on.
        if !self.has_heartbeat() {
            return;
        }

        let steady = |state: BMCState| {
            state == BMCState::Ready || state == BMCState::Quiesced
        };
        let current = || self.view.read().unwrap().bmc_state;

        let start = Instant::now();
        let mut waiting = false;

        while !steady(current())
            && start.elapsed() < STEADY_STATE_TIMEOUT
            && !self.shutdown.is_triggered()
        {
            if !waiting {
                info!(
                    timeout_secs = STEADY_STATE_TIMEOUT.as_secs(),
                    "Waiting for sibling BMC steady state"
                );
                waiting = true;
            }
            sleep(POLL_INTERVAL).await;
        }

        info!(state = %current(), "Done waiting for sibling steady state");
    }

    async fn pause_for_heartbeat_change(&self) {
        sleep(HEARTBEAT_CHANGE_PAUSE).await;
    }

    fn add_heartbeat_callback(&self, role: Role, callback: BoolCallback) {
        self.callbacks.lock().unwrap().heartbeat.insert(role, callback);
    }

    fn add_redundancy_enabled_callback(&self, role: Role, callback: BoolCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .redundancy_enabled
            .insert(role, callback);
    }

    fn add_failovers_allowed_callback(&self, role: Role, callback: BoolCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .failovers_allowed
            .insert(role, callback);
    }

    fn add_bmc_state_callback(&self, role: Role, callback: BmcStateCallback) {
        self.callbacks.lock().unwrap().bmc_state.insert(role, callback);
    }

    fn clear_callbacks(&self, role: Role) {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.heartbeat.remove(&role);
        callbacks.redundancy_enabled.remove(&role);
        callbacks.failovers_allowed.remove(&role);
        callbacks.bmc_state.remove(&role);
    }
}

/// Change notifications gathered while the view lock is held, dispatched
/// after it is released so a callback can read the view again.
enum Change {
    Heartbeat(bool),
    RedundancyEnabled(bool),
    FailoversAllowed(bool),
    BmcState(BMCState),
}

struct Watcher {
    view: Arc<RwLock<View>>,
    callbacks: Arc<Mutex<Callbacks>>,
    shutdown: Shutdown,
}

impl Watcher {
    /// Consumes signal streams forever, reattaching when the peer's
    /// service comes and goes.
    async fn run(&self, first: Option<mpsc::Receiver<Signal>>) {
        let mut stream = first;

        while !self.shutdown.is_triggered() {
            let rx = match stream.take() {
                Some(rx) => rx,
                None => match bus::subscribe(paths::SIBLING_SOCKET).await {
                    Ok(rx) => {
                        info!("Sibling bus service appeared");
                        self.load_properties().await;
                        rx
                    }
                    Err(_) => {
                        sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            self.consume(rx).await;

            if !self.shutdown.is_triggered() {
                // Unclean service death: no InterfacesRemoved, the stream
                // just ended.
                info!("Sibling bus service lost");
                self.apply_owner_lost();
            }
        }
    }

    /// Reads the full property set after a (re)attach.
    async fn load_properties(&self) {
        match BusClient::connect(paths::SIBLING_SOCKET).await {
            Ok(mut client) => match client.get_properties().await {
                Ok(properties) => {
                    let changes = {
                        let mut view = self.view.write().unwrap();
                        view.interface_present = true;
                        apply_property_map(&mut view, &properties)
                    };
                    self.dispatch(changes);
                }
                Err(e) => {
                    error!(error = %e, "Failed reading sibling properties");
                    self.view.write().unwrap().interface_present = false;
                }
            },
            Err(e) => {
                error!(error = %e, "Failed connecting for sibling properties");
                self.view.write().unwrap().interface_present = false;
            }
        }
    }

    async fn consume(&self, mut rx: mpsc::Receiver<Signal>) {
        while let Some(signal) = rx.recv().await {
            match signal {
                Signal::InterfacesAdded { properties } => {
                    info!("Sibling interfaces added");
                    let changes = {
                        let mut view = self.view.write().unwrap();
                        view.interface_present = true;
                        apply_property_map(&mut view, &properties)
                    };
                    self.dispatch(changes);
                }
                Signal::InterfacesRemoved => {
                    info!("Sibling interfaces removed");
                    self.apply_owner_lost();
                }
                Signal::PropertiesChanged { properties } => {
                    let changes = {
                        let mut view = self.view.write().unwrap();
                        apply_property_map(&mut view, &properties)
                    };
                    self.dispatch(changes);
                }
                Signal::Heartbeat => {
                    // The aggregate carries heartbeat as a property; raw
                    // pulses on this stream are not part of the view.
                }
            }

            if self.shutdown.is_triggered() {
                return;
            }
        }
    }

    fn apply_owner_lost(&self) {
        let changes = {
            let mut view = self.view.write().unwrap();
            view.interface_present = false;
            let mut changes = Vec::new();
            if view.heartbeat {
                view.heartbeat = false;
                changes.push(Change::Heartbeat(false));
            }
            changes
        };
        self.dispatch(changes);
    }

    fn dispatch(&self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Heartbeat(value) => {
                    for callback in cloned_callbacks(&self.callbacks, |c| &c.heartbeat) {
                        callback(value);
                    }
                }
                Change::RedundancyEnabled(value) => {
                    for callback in
                        cloned_callbacks(&self.callbacks, |c| &c.redundancy_enabled)
                    {
                        callback(value);
                    }
                }
                Change::FailoversAllowed(value) => {
                    for callback in
                        cloned_callbacks(&self.callbacks, |c| &c.failovers_allowed)
                    {
                        callback(value);
                    }
                }
                Change::BmcState(value) => {
                    let callbacks: Vec<BmcStateCallback> = {
                        let guard = self.callbacks.lock().unwrap();
                        guard.bmc_state.values().cloned().collect()
                    };
                    for callback in callbacks {
                        callback(value);
                    }
                }
            }
        }
    }
}

fn cloned_callbacks(
    callbacks: &Mutex<Callbacks>,
    select: impl Fn(&Callbacks) -> &HashMap<Role, BoolCallback>,
) -> Vec<BoolCallback> {
    let guard = callbacks.lock().unwrap();
    select(&guard).values().cloned().collect()
}

/// Applies a property bag to the view, returning the observable changes.
fn apply_property_map(view: &mut View, properties: &PropertyMap) -> Vec<Change> {
    let mut changes = Vec::new();

    if let Some(position) = properties
        .get(property::BMC_POSITION)
        .and_then(|v| v.as_u64())
    {
        view.position = position;
    }

    if let Some(version) = properties.get(property::FW_VERSION).and_then(|v| v.as_str()) {
        view.fw_version = version.to_string();
    }

    if let Some(provisioned) = properties
        .get(property::PROVISIONED)
        .and_then(|v| v.as_bool())
    {
        view.provisioned = provisioned;
    }

    if let Some(comms_ok) = properties
        .get(property::COMMUNICATION_OK)
        .and_then(|v| v.as_bool())
    {
        view.comms_ok = comms_ok;
    }

    if let Some(role) = parse_enum::<Role>(properties.get(property::ROLE)) {
        view.role = role;
    }

    if let Some(enabled) = properties
        .get(property::REDUNDANCY_ENABLED)
        .and_then(|v| v.as_bool())
    {
        if view.redundancy_enabled != enabled {
            view.redundancy_enabled = enabled;
            changes.push(Change::RedundancyEnabled(enabled));
        }
    }

    if let Some(allowed) = properties
        .get(property::FAILOVERS_ALLOWED)
        .and_then(|v| v.as_bool())
    {
        if view.failovers_allowed != allowed {
            view.failovers_allowed = allowed;
            changes.push(Change::FailoversAllowed(allowed));
        }
    }

    if let Some(state) = parse_enum::<BMCState>(properties.get(property::BMC_STATE)) {
        if view.bmc_state != state {
            view.bmc_state = state;
            changes.push(Change::BmcState(state));
        }
    }

    if let Some(heartbeat) = properties
        .get(property::HEARTBEAT)
        .and_then(|v| v.as_bool())
    {
        if view.heartbeat != heartbeat {
            view.heartbeat = heartbeat;
            changes.push(Change::Heartbeat(heartbeat));
        }
    }

    changes
}

fn parse_enum<T: serde::de::DeserializeOwned>(value: Option<&serde_json::Value>) -> Option<T> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}
