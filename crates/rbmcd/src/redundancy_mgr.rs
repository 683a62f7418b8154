//! Stateful redundancy policy.
//!
//! Wraps the pure evaluators with everything that has memory: the published
//! booleans, the persisted reason sets, the manual-disable override, the
//! sync-failed latch, and the redundancy-off-at-runtime latch that stops
//! redundancy from silently re-enabling mid-boot.

use rbmc_common::ipc::IpcError;
use rbmc_common::store::{key, Store};
use rbmc_common::types::{BMCState, Role, SystemState};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::interface::RedundancyInterface;
use crate::providers::Providers;
use crate::redundancy::{self, paused, NoRedundancyReasons};

struct MgrState {
    system_state: Option<SystemState>,
    redundancy_determined: bool,
    sync_failed: bool,
    manual_disable: bool,
}

pub struct RedundancyMgr {
    providers: Providers,
    interface: Arc<RedundancyInterface>,
    store: Store,
    state: Mutex<MgrState>,
}

impl RedundancyMgr {
    pub fn new(
        providers: Providers,
        interface: Arc<RedundancyInterface>,
        store: Store,
    ) -> Self {
        // Stale reason sets from the previous run would confuse anyone
        // reading them before the first evaluation.
        if let Err(e) = store.remove(key::NO_RED_DETAILS) {
            error!(error = %e, "Failed removing NoRedundancyDetails");
        }
        if let Err(e) = store.remove(key::FAILOVERS_PAUSED_REASONS) {
            error!(error = %e, "Failed removing FailoversPausedReasons");
        }

        let manual_disable = interface.disable_redundancy_override();

        RedundancyMgr {
            providers,
            interface,
            store,
            state: Mutex::new(MgrState {
                system_state: None,
                redundancy_determined: false,
                sync_failed: false,
                manual_disable,
            }),
        }
    }

    /// Evaluates and publishes the redundancy decision, then re-evaluates
    /// the failover gate. Newly disabled redundancy also turns background
    /// sync off.
    pub fn determine_and_set_redundancy(self: Arc<Self>) {
        let first_run = !self.state.lock().unwrap().redundancy_determined;
        if first_run {
            Arc::clone(&self).init_system_state();
        }

        let reasons = self.no_redundancy_reasons();
        let enable = reasons.is_empty();

        if enable {
            info!("Enabling redundancy");
        } else {
            info!("Redundancy must be disabled");
        }
        self.interface.set_redundancy_enabled(enable);

        self.state.lock().unwrap().redundancy_determined = true;

        self.determine_and_set_failovers_allowed();

        if !enable {
            let sync = Arc::clone(&self.providers.sync);
            tokio::spawn(async move {
                sync.disable_background_sync().await;
            });
        }
    }

    /// Determines redundancy, and if it came out enabled, runs a full
    /// sync. A failed sync re-runs the evaluation with the failure latched
    /// so the published state reflects it.
    pub async fn determine_redundancy_and_sync(self: Arc<Self>) {
        self.state.lock().unwrap().sync_failed = false;
        Arc::clone(&self).determine_and_set_redundancy();

        if !self.interface.redundancy_enabled() {
            return;
        }

        let failed = match self.providers.sync.do_full_sync().await {
            Ok(true) => false,
            Ok(false) => {
                error!("Disabling redundancy because full sync failed");
                true
            }
            Err(e) => {
                error!(error = %e, "Bus error during full sync");
                true
            }
        };

        if failed {
            self.state.lock().unwrap().sync_failed = true;
            Arc::clone(&self).determine_and_set_redundancy();
            self.state.lock().unwrap().sync_failed = false;
        }
    }

    /// A background sync failure reported while redundancy was up.
    pub fn handle_background_sync_failed(self: Arc<Self>) {
        self.state.lock().unwrap().sync_failed = true;
        Arc::clone(&self).determine_and_set_redundancy();
        self.state.lock().unwrap().sync_failed = false;
    }

    /// A request to change the manual disable override. Only legal with
    /// the system off and no full sync running; otherwise the request is
    /// rejected outright, never deferred.
    pub fn disable_red_prop_changed(self: Arc<Self>, disable: bool) -> Result<(), IpcError> {
        let system_state = self.state.lock().unwrap().system_state;
        if system_state.unwrap_or(SystemState::Other) != SystemState::Off {
            error!("Cannot modify DisableRedundancyOverride when powered on");
            return Err(IpcError::Unavailable(
                "system is not powered off".to_string(),
            ));
        }

        if self.providers.sync.is_full_sync_in_progress() {
            error!("Cannot modify DisableRedundancyOverride when full sync is in progress");
            return Err(IpcError::Unavailable(
                "a full sync is in progress".to_string(),
            ));
        }

        {
            let mut state = self.state.lock().unwrap();
            state.manual_disable = disable;

            if !state.redundancy_determined {
                // The first determination hasn't happened yet; it will
                // pick the new value up on its own.
                info!("Redundancy has not been determined yet, will not change redundancy now");
                return Ok(());
            }
        }

        if disable == !self.interface.redundancy_enabled() {
            info!("No change to redundancy necessary");
            return Ok(());
        }

        info!(disable, "Revisiting redundancy after manual override change");
        tokio::spawn(async move {
            self.determine_redundancy_and_sync().await;
        });

        Ok(())
    }

    fn init_system_state(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.providers
            .services
            .add_system_state_callback(Arc::new(move |state| {
                this.system_state_change(state);
            }));

        let state = match self.providers.services.system_state() {
            Some(state) => {
                info!(state = %state, "Initial system state");
                state
            }
            None => {
                error!("Could not get system state");
                SystemState::Other
            }
        };
        self.state.lock().unwrap().system_state = Some(state);

        // A stale runtime latch can't survive an AC loss.
        if state == SystemState::Off {
            self.clear_redundancy_off_at_runtime();
        }
    }

    fn system_state_change(&self, new_state: SystemState) {
        info!(state = %new_state, "System state change");

        if new_state == SystemState::Off {
            self.clear_redundancy_off_at_runtime();
        } else if new_state == SystemState::Runtime {
            // Lock in whether redundancy was off when this boot reached
            // runtime. Only the Off transition invalidates it, so a
            // recovered sibling can't flip redundancy back on mid-boot.
            if !self.redundancy_off_at_runtime().0 {
                let off = !self.interface.redundancy_enabled();
                info!(
                    enabled = !off,
                    "Locking in runtime redundancy enabled value"
                );
                self.set_redundancy_off_at_runtime(true, off);
            }
        }

        self.state.lock().unwrap().system_state = Some(new_state);

        self.determine_and_set_failovers_allowed();
    }

    fn no_redundancy_reasons(&self) -> NoRedundancyReasons {
        let (manual_disable, sync_failed) = {
            let state = self.state.lock().unwrap();
            (state.manual_disable, state.sync_failed)
        };

        let sibling = &self.providers.sibling;
        let services = &self.providers.services;

        let input = redundancy::Input {
            role: self.interface.role(),
            sibling_present: sibling.is_bmc_present(),
            sibling_heartbeat: sibling.has_heartbeat(),
            sibling_provisioned: sibling.provisioned().unwrap_or(false),
            sibling_has_sibling_comm: sibling.comms_ok().unwrap_or(false),
            sibling_role: sibling.role().unwrap_or(Role::Unknown),
            sibling_state: sibling.bmc_state().unwrap_or(BMCState::NotReady),
            code_versions_match: services.fw_version_digest()
                == sibling.fw_version().unwrap_or_default(),
            manual_disable,
            redundancy_off_at_runtime_start: self.is_redundancy_off_at_runtime(),
            sync_failed,
        };

        let reasons = redundancy::get_no_redundancy_reasons(&input);

        let details: BTreeMap<u8, String> = reasons
            .iter()
            .map(|&reason| {
                let desc = redundancy::description(reason);
                info!(reason = desc, "No redundancy");
                (reason as u8, desc.to_string())
            })
            .collect();

        if let Err(e) = self.store.write(key::NO_RED_DETAILS, &details) {
            error!(error = %e, "Failed serializing NoRedundancyDetails");
        }

        reasons
    }

    fn determine_and_set_failovers_allowed(&self) {
        let system_state = self
            .state
            .lock()
            .unwrap()
            .system_state
            .unwrap_or(SystemState::Other);

        let paused_reasons = paused::get_failovers_paused_reasons(system_state);

        let descriptions: Vec<String> = paused_reasons
            .iter()
            .map(|&reason| {
                let desc = paused::description(reason);
                info!(reason = desc, "Failovers paused");
                desc.to_string()
            })
            .collect();

        if let Err(e) = self
            .store
            .write(key::FAILOVERS_PAUSED_REASONS, &descriptions)
        {
            error!(error = %e, "Failed saving failovers paused descriptions");
        }

        let allowed = self.interface.redundancy_enabled() && paused_reasons.is_empty();
        if allowed && !self.interface.failovers_allowed() {
            info!("Changing failovers to allowed");
        }
        self.interface.set_failovers_allowed(allowed);
    }

    fn set_redundancy_off_at_runtime(&self, valid: bool, off: bool) {
        if let Err(e) = self
            .store
            .write(key::REDUNDANCY_OFF_AT_RUNTIME, &(valid, off))
        {
            error!(error = %e, "Failed serializing RedundancyOffAtRuntime");
        }
    }

    fn clear_redundancy_off_at_runtime(&self) {
        self.set_redundancy_off_at_runtime(false, false);
    }

    fn redundancy_off_at_runtime(&self) -> (bool, bool) {
        self.store
            .read::<(bool, bool)>(key::REDUNDANCY_OFF_AT_RUNTIME)
            .unwrap_or((false, false))
    }

    fn is_redundancy_off_at_runtime(&self) -> bool {
        let (valid, off) = self.redundancy_off_at_runtime();
        valid && off
    }
}
