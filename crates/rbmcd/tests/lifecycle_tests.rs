//! Role handler and manager behavior against mock providers.

use async_trait::async_trait;
use rbmc_common::store::{key, Store};
use rbmc_common::types::{BMCState, Role, SystemState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rbmcd::active_role_handler::ActiveRoleHandler;
use rbmcd::interface::RedundancyInterface;
use rbmcd::manager::Manager;
use rbmcd::passive_role_handler::PassiveRoleHandler;
use rbmcd::providers::{
    BmcStateCallback, BoolCallback, Providers, Services, Sibling, SyncControl,
    SyncHealthCallback, SystemStateCallback,
};
use rbmcd::redundancy_mgr::RedundancyMgr;
use rbmcd::shutdown::Shutdown;

const FW_DIGEST: &str = "CAFE0000";

#[derive(Clone)]
struct SiblingState {
    present: bool,
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

impl SiblingState {
    fn healthy_passive() -> Self {
        SiblingState {
            present: true,
            heartbeat: true,
            role: Role::Passive,
            bmc_state: BMCState::Ready,
            redundancy_enabled: false,
            failovers_allowed: false,
            fw_version: FW_DIGEST.to_string(),
            position: 1,
            provisioned: true,
            comms_ok: true,
        }
    }
}

#[derive(Default)]
struct SiblingCallbacks {
    heartbeat: HashMap<Role, BoolCallback>,
    redundancy_enabled: HashMap<Role, BoolCallback>,
    failovers_allowed: HashMap<Role, BoolCallback>,
    bmc_state: HashMap<Role, BmcStateCallback>,
}

struct MockSibling {
    state: Mutex<SiblingState>,
    callbacks: Mutex<SiblingCallbacks>,
}

impl MockSibling {
    fn new(state: SiblingState) -> Arc<Self> {
        Arc::new(MockSibling {
            state: Mutex::new(state),
            callbacks: Mutex::new(SiblingCallbacks::default()),
        })
    }

    fn set_heartbeat(&self, heartbeat: bool) {
        self.state.lock().unwrap().heartbeat = heartbeat;
        let callbacks: Vec<BoolCallback> = {
            let guard = self.callbacks.lock().unwrap();
            guard.heartbeat.values().cloned().collect()
        };
        for callback in callbacks {
            callback(heartbeat);
        }
    }

    fn set_redundancy_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().redundancy_enabled = enabled;
        let callbacks: Vec<BoolCallback> = {
            let guard = self.callbacks.lock().unwrap();
            guard.redundancy_enabled.values().cloned().collect()
        };
        for callback in callbacks {
            callback(enabled);
        }
    }

    fn set_failovers_allowed(&self, allowed: bool) {
        self.state.lock().unwrap().failovers_allowed = allowed;
        let callbacks: Vec<BoolCallback> = {
            let guard = self.callbacks.lock().unwrap();
            guard.failovers_allowed.values().cloned().collect()
        };
        for callback in callbacks {
            callback(allowed);
        }
    }

    fn set_role(&self, role: Role) {
        self.state.lock().unwrap().role = role;
    }

    fn valid(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.present && state.heartbeat
    }
}

#[async_trait]
impl Sibling for MockSibling {
    async fn init(&self) {}

    fn is_bmc_present(&self) -> bool {
        true
    }

    fn interface_present(&self) -> bool {
        self.state.lock().unwrap().present
    }

    fn has_heartbeat(&self) -> bool {
        self.valid()
    }

    fn role(&self) -> Option<Role> {
        self.valid().then(|| self.state.lock().unwrap().role)
    }

    fn bmc_state(&self) -> Option<BMCState> {
        self.valid().then(|| self.state.lock().unwrap().bmc_state)
    }

    fn redundancy_enabled(&self) -> Option<bool> {
        self.valid()
            .then(|| self.state.lock().unwrap().redundancy_enabled)
    }

    fn failovers_allowed(&self) -> Option<bool> {
        self.valid()
            .then(|| self.state.lock().unwrap().failovers_allowed)
    }

    fn fw_version(&self) -> Option<String> {
        self.valid()
            .then(|| self.state.lock().unwrap().fw_version.clone())
    }

    fn position(&self) -> Option<u64> {
        self.valid().then(|| self.state.lock().unwrap().position)
    }

    fn provisioned(&self) -> Option<bool> {
        self.valid().then(|| self.state.lock().unwrap().provisioned)
    }

    fn comms_ok(&self) -> Option<bool> {
        self.valid().then(|| self.state.lock().unwrap().comms_ok)
    }

    fn last_known_redundancy_enabled(&self) -> bool {
        self.state.lock().unwrap().redundancy_enabled
    }

    async fn wait_for_sibling_up(&self, _timeout: Duration) {}
    async fn wait_for_role(&self) {}
    async fn wait_for_steady_state(&self) {}
    async fn pause_for_heartbeat_change(&self) {}

    fn add_heartbeat_callback(&self, role: Role, callback: BoolCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .heartbeat
            .insert(role, callback);
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
        self.callbacks
            .lock()
            .unwrap()
            .bmc_state
            .insert(role, callback);
    }

    fn clear_callbacks(&self, role: Role) {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.heartbeat.remove(&role);
        callbacks.redundancy_enabled.remove(&role);
        callbacks.failovers_allowed.remove(&role);
        callbacks.bmc_state.remove(&role);
    }
}

struct MockServices {
    provisioned: bool,
    position: anyhow::Result<u64>,
    system_state: Mutex<Option<SystemState>>,
    callbacks: Mutex<Vec<SystemStateCallback>>,
    started_units: Mutex<Vec<String>>,
    sibling_unit_state: String,
}

impl MockServices {
    fn new() -> Arc<Self> {
        Arc::new(MockServices {
            provisioned: true,
            position: Ok(0),
            system_state: Mutex::new(Some(SystemState::Off)),
            callbacks: Mutex::new(Vec::new()),
            started_units: Mutex::new(Vec::new()),
            sibling_unit_state: "active".to_string(),
        })
    }

    fn unprovisioned() -> Arc<Self> {
        Arc::new(MockServices {
            provisioned: false,
            position: Ok(0),
            system_state: Mutex::new(Some(SystemState::Off)),
            callbacks: Mutex::new(Vec::new()),
            started_units: Mutex::new(Vec::new()),
            sibling_unit_state: "active".to_string(),
        })
    }
}

#[async_trait]
impl Services for MockServices {
    async fn init(&self) {}

    fn bmc_position(&self) -> anyhow::Result<u64> {
        match &self.position {
            Ok(position) => Ok(*position),
            Err(e) => Err(anyhow::anyhow!("{e}")),
        }
    }

    fn fw_version_digest(&self) -> String {
        FW_DIGEST.to_string()
    }

    fn provisioned(&self) -> bool {
        self.provisioned
    }

    fn system_state(&self) -> Option<SystemState> {
        *self.system_state.lock().unwrap()
    }

    fn add_system_state_callback(&self, callback: SystemStateCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    async fn unit_state(&self, _unit: &str) -> String {
        self.sibling_unit_state.clone()
    }

    async fn start_unit(&self, unit: &str) -> anyhow::Result<()> {
        self.started_units.lock().unwrap().push(unit.to_string());
        Ok(())
    }

    async fn bmc_state(&self) -> anyhow::Result<BMCState> {
        Ok(BMCState::Ready)
    }
}

struct MockSync {
    full_syncs: AtomicUsize,
    full_sync_result: Mutex<anyhow::Result<bool>>,
    in_progress: AtomicBool,
    disables: AtomicUsize,
    callbacks: Mutex<HashMap<Role, SyncHealthCallback>>,
}

impl MockSync {
    fn new() -> Arc<Self> {
        Arc::new(MockSync {
            full_syncs: AtomicUsize::new(0),
            full_sync_result: Mutex::new(Ok(true)),
            in_progress: AtomicBool::new(false),
            disables: AtomicUsize::new(0),
            callbacks: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl SyncControl for MockSync {
    async fn init(&self) {}

    async fn do_full_sync(&self) -> anyhow::Result<bool> {
        self.full_syncs.fetch_add(1, Ordering::SeqCst);
        match &*self.full_sync_result.lock().unwrap() {
            Ok(result) => Ok(*result),
            Err(e) => Err(anyhow::anyhow!("{e}")),
        }
    }

    fn is_full_sync_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    async fn disable_background_sync(&self) {
        self.disables.fetch_add(1, Ordering::SeqCst);
    }

    fn add_sync_health_callback(&self, role: Role, callback: SyncHealthCallback) {
        self.callbacks.lock().unwrap().insert(role, callback);
    }

    fn clear_sync_health_callbacks(&self, role: Role) {
        self.callbacks.lock().unwrap().remove(&role);
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Store,
    interface: Arc<RedundancyInterface>,
    sibling: Arc<MockSibling>,
    services: Arc<MockServices>,
    sync: Arc<MockSync>,
    providers: Providers,
}

fn fixture_with(sibling_state: SiblingState, services: Arc<MockServices>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::with_path(dir.path().join("data.json"));
    let interface = Arc::new(RedundancyInterface::new(store.clone()));
    let sibling = MockSibling::new(sibling_state);
    let sync = MockSync::new();

    let providers = Providers {
        sibling: sibling.clone(),
        services: services.clone(),
        sync: sync.clone(),
    };

    Fixture {
        _dir: dir,
        store,
        interface,
        sibling,
        services,
        sync,
        providers,
    }
}

fn fixture() -> Fixture {
    fixture_with(SiblingState::healthy_passive(), MockServices::new())
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn passive_mirrors_only_from_an_active_sibling() {
    let mut state = SiblingState::healthy_passive();
    state.role = Role::Active;
    let fixture = fixture_with(state, MockServices::new());

    fixture.interface.set_role(Role::Passive);
    let handler = PassiveRoleHandler::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
    );
    Arc::clone(&handler).start().await;
    settle().await;

    // Peer is active: its values land here.
    fixture.sibling.set_redundancy_enabled(true);
    fixture.sibling.set_failovers_allowed(true);
    settle().await;
    assert!(fixture.interface.redundancy_enabled());
    assert!(fixture.interface.failovers_allowed());

    // Peer no longer active: changes must not be mirrored.
    fixture.sibling.set_role(Role::Unknown);
    fixture.sibling.set_redundancy_enabled(false);
    fixture.sibling.set_failovers_allowed(false);
    settle().await;
    assert!(fixture.interface.redundancy_enabled());
    assert!(fixture.interface.failovers_allowed());

    // Active again: mirroring resumes.
    fixture.sibling.set_role(Role::Active);
    fixture.sibling.set_redundancy_enabled(false);
    settle().await;
    assert!(!fixture.interface.redundancy_enabled());
}

#[tokio::test]
async fn passive_syncs_when_the_pair_becomes_syncable() {
    let mut state = SiblingState::healthy_passive();
    state.role = Role::Active;
    state.redundancy_enabled = false;
    let fixture = fixture_with(state, MockServices::new());

    fixture.interface.set_role(Role::Passive);
    let handler = PassiveRoleHandler::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
    );
    Arc::clone(&handler).start().await;
    settle().await;

    // Not syncable yet: peer redundancy is off.
    assert_eq!(fixture.sync.full_syncs.load(Ordering::SeqCst), 0);

    fixture.sibling.set_redundancy_enabled(true);
    settle().await;
    assert_eq!(fixture.sync.full_syncs.load(Ordering::SeqCst), 1);

    // Repeated triggers don't re-sync once one has completed.
    fixture.sibling.set_heartbeat(true);
    settle().await;
    assert_eq!(fixture.sync.full_syncs.load(Ordering::SeqCst), 1);

    // Losing the peer winds sync down.
    fixture.sibling.set_heartbeat(false);
    settle().await;
    assert!(fixture.sync.disables.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn short_heartbeat_loss_keeps_redundancy() {
    let fixture = fixture();
    fixture.interface.set_role(Role::Active);

    let mgr = Arc::new(RedundancyMgr::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
    ));
    let handler = ActiveRoleHandler::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        mgr,
        fixture.store.clone(),
    );
    Arc::clone(&handler).start().await;
    settle().await;

    assert!(fixture.interface.redundancy_enabled());
    assert_eq!(fixture.sync.full_syncs.load(Ordering::SeqCst), 1);

    // Heartbeat lost, then restored before the five minute debounce.
    fixture.sibling.set_heartbeat(false);
    settle().await;
    tokio::time::advance(Duration::from_secs(4 * 60)).await;
    fixture.sibling.set_heartbeat(true);
    settle().await;

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    settle().await;

    assert!(
        fixture.interface.redundancy_enabled(),
        "a short heartbeat loss must not drop redundancy"
    );
}

#[tokio::test(start_paused = true)]
async fn sustained_heartbeat_loss_drops_redundancy() {
    let fixture = fixture();
    fixture.interface.set_role(Role::Active);

    let mgr = Arc::new(RedundancyMgr::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
    ));
    let handler = ActiveRoleHandler::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        mgr,
        fixture.store.clone(),
    );
    Arc::clone(&handler).start().await;
    settle().await;
    assert!(fixture.interface.redundancy_enabled());

    fixture.sibling.set_heartbeat(false);
    settle().await;
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    settle().await;

    assert!(
        !fixture.interface.redundancy_enabled(),
        "a sustained heartbeat loss must drop redundancy"
    );
}

#[tokio::test]
async fn unprovisioned_bmc_forces_passive_role() {
    let fixture = fixture_with(SiblingState::healthy_passive(), MockServices::unprovisioned());

    let manager = Manager::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
        Shutdown::new(),
    );
    Arc::clone(&manager).startup().await;
    settle().await;

    assert_eq!(fixture.interface.role(), Role::Passive);
    assert_eq!(fixture.store.read::<Role>(key::ROLE), Some(Role::Passive));
    assert_eq!(fixture.store.read::<bool>(key::PASSIVE_ERROR), Some(true));
    assert_eq!(
        fixture.store.read::<String>(key::ROLE_REASON),
        Some("BMC is not provisioned".to_string())
    );
}

#[tokio::test]
async fn manager_elects_active_over_a_passive_sibling() {
    let fixture = fixture();

    let manager = Manager::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
        Shutdown::new(),
    );
    Arc::clone(&manager).startup().await;
    settle().await;

    assert_eq!(fixture.interface.role(), Role::Active);
    assert_eq!(fixture.store.read::<Role>(key::ROLE), Some(Role::Active));
    assert_eq!(fixture.store.read::<bool>(key::PASSIVE_ERROR), Some(false));
    assert_eq!(
        fixture.store.read::<String>(key::ROLE_REASON),
        Some("Sibling is already passive".to_string())
    );

    // The active handler was spawned and started its target.
    assert!(fixture
        .services
        .started_units
        .lock()
        .unwrap()
        .contains(&"bmc-active.target".to_string()));
}

#[tokio::test]
async fn manager_rejects_override_before_a_handler_exists() {
    let fixture = fixture();

    let manager = Manager::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
        Shutdown::new(),
    );

    // No startup yet, so no handler.
    assert!(manager.disable_red_prop_changed(true).is_err());
}

#[tokio::test]
async fn passive_rejects_override_changes() {
    let mut state = SiblingState::healthy_passive();
    state.role = Role::Active;
    let fixture = fixture_with(state, MockServices::new());

    fixture.interface.set_role(Role::Passive);
    let handler = PassiveRoleHandler::new(
        fixture.providers.clone(),
        Arc::clone(&fixture.interface),
        fixture.store.clone(),
    );
    Arc::clone(&handler).start().await;
    settle().await;

    assert!(handler.disable_red_prop_changed(true).is_err());
}
