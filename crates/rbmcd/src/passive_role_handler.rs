//! Passive-role lifecycle.
//!
//! The passive BMC starts the passive service target, mirrors the active
//! BMC's published redundancy booleans, and keeps its replica fresh by
//! running a full sync whenever the pair becomes syncable and stopping
//! background sync when it no longer is.

use rbmc_common::ipc::IpcError;
use rbmc_common::store::{key, Store};
use rbmc_common::types::{BMCState, Role, SyncEventsHealth};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::interface::RedundancyInterface;
use crate::providers::Providers;
use crate::redundancy::blocked;

pub const BMC_PASSIVE_TARGET: &str = "bmc-passive.target";

pub struct PassiveRoleHandler {
    providers: Providers,
    interface: Arc<RedundancyInterface>,
    store: Store,

    /// Whether a full sync has completed since sync was last stopped.
    /// Both the heartbeat and the enabled property trigger sync attempts;
    /// this keeps the attempts idempotent.
    full_sync_done: AtomicBool,
}

impl PassiveRoleHandler {
    pub fn new(
        providers: Providers,
        interface: Arc<RedundancyInterface>,
        store: Store,
    ) -> Arc<Self> {
        Arc::new(PassiveRoleHandler {
            providers,
            interface,
            store,
            full_sync_done: AtomicBool::new(false),
        })
    }

    pub async fn start(self: Arc<Self>) {
        if let Err(e) = self
            .providers
            .services
            .start_unit(BMC_PASSIVE_TARGET)
            .await
        {
            error!(error = %e, "Failed while starting BMC passive target");
        }

        Self::setup_sibling_red_enabled_watch(&self);
        Self::setup_sibling_failovers_allowed_watch(&self);
        Self::setup_sibling_hb_watch(&self);

        // Only the active BMC owns the persisted reason sets.
        if let Err(e) = self.store.remove(key::NO_RED_DETAILS) {
            error!(error = %e, "Failed removing NoRedundancyDetails");
        }
        if let Err(e) = self.store.remove(key::FAILOVERS_PAUSED_REASONS) {
            error!(error = %e, "Failed removing FailoversPausedReasons");
        }

        Arc::clone(&self).try_full_sync().await;
    }

    /// The override can only be changed on the active BMC.
    pub fn disable_red_prop_changed(&self, _disable: bool) -> Result<(), IpcError> {
        error!("DisableRedundancyOverride is not supported on the passive BMC");
        Err(IpcError::Unavailable(
            "not supported on the passive BMC".to_string(),
        ))
    }

    pub async fn failover_blocked_reason(&self, force: bool) -> blocked::Reason {
        let sibling = &self.providers.sibling;

        let state = match self.providers.services.bmc_state().await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Could not read local BMC state");
                BMCState::NotReady
            }
        };

        let input = blocked::Input {
            sibling_heartbeat: sibling.has_heartbeat(),
            sibling_state: sibling.bmc_state().unwrap_or(BMCState::NotReady),
            redundancy_enabled: self.interface.redundancy_enabled(),
            sync_in_progress: self.providers.sync.is_full_sync_in_progress(),
            state,
            failovers_not_allowed: !self.interface.failovers_allowed(),
            force_option: force,
            last_known_redundancy_enabled: sibling.last_known_redundancy_enabled(),
        };

        blocked::get_failover_blocked_reason(&input)
    }

    fn setup_sibling_red_enabled_watch(this: &Arc<Self>) {
        // Mirror the current value before watching for changes.
        if let Some(enabled) = this.providers.sibling.redundancy_enabled() {
            Arc::clone(this).sibling_red_enabled_changed(enabled);
        }

        let weak = Arc::downgrade(this);
        this.providers.sibling.add_redundancy_enabled_callback(
            Role::Passive,
            Arc::new(move |enabled| {
                if let Some(this) = weak.upgrade() {
                    this.sibling_red_enabled_changed(enabled);
                }
            }),
        );
    }

    fn setup_sibling_failovers_allowed_watch(this: &Arc<Self>) {
        if let Some(allowed) = this.providers.sibling.failovers_allowed() {
            this.sibling_failovers_allowed_changed(allowed);
        }

        let weak = Arc::downgrade(this);
        this.providers.sibling.add_failovers_allowed_callback(
            Role::Passive,
            Arc::new(move |allowed| {
                if let Some(this) = weak.upgrade() {
                    this.sibling_failovers_allowed_changed(allowed);
                }
            }),
        );
    }

    fn setup_sibling_hb_watch(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        this.providers.sibling.add_heartbeat_callback(
            Role::Passive,
            Arc::new(move |_heartbeat| {
                if let Some(this) = weak.upgrade() {
                    tokio::spawn(async move {
                        this.try_full_sync().await;
                    });
                }
            }),
        );
    }

    /// Mirror the active BMC's RedundancyEnabled, and see whether the new
    /// value makes the pair syncable.
    fn sibling_red_enabled_changed(self: Arc<Self>, enabled: bool) {
        if self.providers.sibling.role() == Some(Role::Active) {
            self.interface.set_redundancy_enabled(enabled);
        }

        tokio::spawn(async move {
            self.try_full_sync().await;
        });
    }

    fn sibling_failovers_allowed_changed(&self, allowed: bool) {
        if self.providers.sibling.role() == Some(Role::Active) {
            self.interface.set_failovers_allowed(allowed);
        }
    }

    /// Starts a full sync iff the peer is alive, active, and has
    /// redundancy enabled; otherwise winds syncing back down.
    async fn try_full_sync(self: Arc<Self>) {
        let sibling = &self.providers.sibling;
        let syncable = sibling.has_heartbeat()
            && sibling.redundancy_enabled() == Some(true)
            && sibling.role() == Some(Role::Active);

        if syncable {
            if !self.full_sync_done.load(Ordering::SeqCst) {
                Arc::clone(&self).start_sync().await;
            }
        } else if self.full_sync_done.load(Ordering::SeqCst) {
            Arc::clone(&self).stop_sync().await;
        }
    }

    async fn start_sync(self: Arc<Self>) {
        info!("Starting a full sync");

        let succeeded = match self.providers.sync.do_full_sync().await {
            Ok(true) => true,
            Ok(false) => {
                error!("Full sync did not complete");
                false
            }
            Err(e) => {
                error!(error = %e, "Bus error during full sync");
                false
            }
        };

        if !succeeded {
            Arc::clone(&self).stop_sync().await;
            return;
        }

        self.full_sync_done.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(&self);
        self.providers.sync.add_sync_health_callback(
            Role::Passive,
            Arc::new(move |health| {
                if health == SyncEventsHealth::Critical {
                    if let Some(this) = weak.upgrade() {
                        info!("Sync events health went critical");
                        tokio::spawn(async move {
                            this.stop_sync().await;
                        });
                    }
                }
            }),
        );
    }

    async fn stop_sync(self: Arc<Self>) {
        self.providers
            .sync
            .clear_sync_health_callbacks(Role::Passive);
        self.providers.sync.disable_background_sync().await;
        self.full_sync_done.store(false, Ordering::SeqCst);
    }
}

impl Drop for PassiveRoleHandler {
    fn drop(&mut self) {
        self.providers.sibling.clear_callbacks(Role::Passive);
        self.providers
            .sync
            .clear_sync_health_callbacks(Role::Passive);
    }
}
