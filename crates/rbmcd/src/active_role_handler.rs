//! Active-role lifecycle.
//!
//! The active BMC starts the active service target, waits for the sibling
//! to settle, owns the redundancy decision, and watches for the events
//! that can take redundancy away: the sibling quiescing, the sibling
//! heartbeat stopping, and background sync going critical. Heartbeat loss
//! is debounced so a short peer reboot doesn't drop redundancy.

use rbmc_common::ipc::IpcError;
use rbmc_common::store::{key, Store};
use rbmc_common::types::{BMCState, Role, SyncEventsHealth};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::interface::RedundancyInterface;
use crate::providers::Providers;
use crate::redundancy::blocked;
use crate::redundancy_mgr::RedundancyMgr;
use crate::timer::Timer;

pub const BMC_ACTIVE_TARGET: &str = "bmc-active.target";

/// How long a lost sibling heartbeat may stay lost before redundancy is
/// re-evaluated.
const HEARTBEAT_LOSS_DEBOUNCE: Duration = Duration::from_secs(5 * 60);

pub struct ActiveRoleHandler {
    providers: Providers,
    interface: Arc<RedundancyInterface>,
    redundancy_mgr: Arc<RedundancyMgr>,
    store: Store,
    heartbeat_loss_timer: Timer,
}

impl ActiveRoleHandler {
    pub fn new(
        providers: Providers,
        interface: Arc<RedundancyInterface>,
        redundancy_mgr: Arc<RedundancyMgr>,
        store: Store,
    ) -> Arc<Self> {
        let timer_mgr = Arc::clone(&redundancy_mgr);
        let heartbeat_loss_timer = Timer::new(move || {
            info!("Sibling heartbeat loss debounce expired");
            Arc::clone(&timer_mgr).determine_and_set_redundancy();
        });

        Arc::new(ActiveRoleHandler {
            providers,
            interface,
            redundancy_mgr,
            store,
            heartbeat_loss_timer,
        })
    }

    pub async fn start(self: Arc<Self>) {
        if let Err(e) = self.store.remove(key::NO_RED_DETAILS) {
            error!(error = %e, "Failed removing NoRedundancyDetails");
        }

        if let Err(e) = self
            .providers
            .services
            .start_unit(BMC_ACTIVE_TARGET)
            .await
        {
            error!(error = %e, "Failed while starting BMC active target");
        }

        if self.providers.sibling.has_heartbeat() {
            // The sibling needs time to get its role assigned, and
            // redundancy can only be enabled once it reaches Ready.
            tokio::join!(
                self.providers.sibling.wait_for_role(),
                self.providers.sibling.wait_for_steady_state()
            );
        }

        Arc::clone(&self.redundancy_mgr)
            .determine_redundancy_and_sync()
            .await;

        Self::install_watches(&self);
    }

    pub fn disable_red_prop_changed(&self, disable: bool) -> Result<(), IpcError> {
        Arc::clone(&self.redundancy_mgr).disable_red_prop_changed(disable)
    }

    /// The active BMC never accepts a failover request.
    pub fn failover_blocked_reason(&self, _force: bool) -> blocked::Reason {
        error!("A failover was requested on the active BMC");
        blocked::Reason::BmcNotPassive
    }

    fn install_watches(this: &Arc<Self>) {
        let sibling = &this.providers.sibling;

        let mgr = Arc::clone(&this.redundancy_mgr);
        sibling.add_bmc_state_callback(
            Role::Active,
            Arc::new(move |state| {
                if state == BMCState::Quiesced {
                    info!("Sibling BMC is quiesced");
                    Arc::clone(&mgr).determine_and_set_redundancy();
                }
            }),
        );

        let weak = Arc::downgrade(this);
        sibling.add_heartbeat_callback(
            Role::Active,
            Arc::new(move |heartbeat| {
                if let Some(this) = weak.upgrade() {
                    this.sibling_hb_change(heartbeat);
                }
            }),
        );

        let weak = Arc::downgrade(this);
        this.providers.sync.add_sync_health_callback(
            Role::Active,
            Arc::new(move |health| {
                if health == SyncEventsHealth::Critical {
                    if let Some(this) = weak.upgrade() {
                        tokio::spawn(async move {
                            this.sync_health_critical().await;
                        });
                    }
                }
            }),
        );
    }

    fn remove_watches(&self) {
        self.providers.sibling.clear_callbacks(Role::Active);
        self.providers
            .sync
            .clear_sync_health_callbacks(Role::Active);
    }

    fn sibling_hb_change(self: Arc<Self>, heartbeat: bool) {
        if heartbeat {
            info!("Sibling heartbeat started");
            self.heartbeat_loss_timer.stop();

            tokio::spawn(async move {
                self.sibling_hb_started().await;
            });
        } else if self.interface.redundancy_enabled() {
            info!(
                debounce_secs = HEARTBEAT_LOSS_DEBOUNCE.as_secs(),
                "Sibling heartbeat lost, starting debounce timer"
            );
            self.heartbeat_loss_timer.start(HEARTBEAT_LOSS_DEBOUNCE);
        }
    }

    /// The sibling came (back) to life. Let it settle, then redo the full
    /// redundancy determination with a fresh sync.
    async fn sibling_hb_started(self: Arc<Self>) {
        self.remove_watches();

        tokio::join!(
            self.providers.sibling.wait_for_role(),
            self.providers.sibling.wait_for_steady_state()
        );

        Arc::clone(&self.redundancy_mgr)
            .determine_redundancy_and_sync()
            .await;

        Self::install_watches(&self);
    }

    /// Background sync went critical. That happens as collateral of peer
    /// death too, in which case the heartbeat-loss path owns the decision.
    async fn sync_health_critical(self: Arc<Self>) {
        if !self.interface.redundancy_enabled() {
            return;
        }

        info!("Sync events health is critical, disabling background sync");
        self.providers.sync.disable_background_sync().await;

        self.providers.sibling.pause_for_heartbeat_change().await;

        if self.providers.sibling.has_heartbeat() {
            Arc::clone(&self.redundancy_mgr).handle_background_sync_failed();
        } else {
            info!("No sibling heartbeat, leaving the decision to the heartbeat loss path");
        }
    }
}

impl Drop for ActiveRoleHandler {
    fn drop(&mut self) {
        self.heartbeat_loss_timer.stop();
        self.remove_watches();
    }
}
