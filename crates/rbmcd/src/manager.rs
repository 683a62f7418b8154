//! Startup orchestration.
//!
//! The manager elects the local role, emits the heartbeat, and hands the
//! rest of the process lifetime to the role handler. Role election only
//! happens here; everything after startup reacts to events.

use rbmc_common::ipc::IpcError;
use rbmc_common::store::{key, Store};
use rbmc_common::types::Role;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::active_role_handler::ActiveRoleHandler;
use crate::handler::RoleHandler;
use crate::interface::RedundancyInterface;
use crate::passive_role_handler::PassiveRoleHandler;
use crate::providers::Providers;
use crate::redundancy::blocked;
use crate::redundancy_mgr::RedundancyMgr;
use crate::role_determination::{self, RoleInfo, RoleReason};
use crate::shutdown::Shutdown;
use crate::sibling;

/// How long to wait for a present sibling to publish its interfaces and
/// heartbeat before electing without it.
const SIBLING_UP_TIMEOUT: Duration = Duration::from_secs(6 * 60);

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Position value fed to the elector when the sibling never published one.
const UNKNOWN_POSITION: u64 = 0xFF;

pub struct Manager {
    providers: Providers,
    interface: Arc<RedundancyInterface>,
    redundancy_mgr: Arc<RedundancyMgr>,
    store: Store,
    shutdown: Shutdown,

    previous_role: Role,
    chose_passive_due_to_error: Mutex<bool>,
    handler: RwLock<Option<RoleHandler>>,
    heartbeat_started: AtomicBool,
}

impl Manager {
    pub fn new(
        providers: Providers,
        interface: Arc<RedundancyInterface>,
        store: Store,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let previous_role = store.read::<Role>(key::ROLE).unwrap_or(Role::Unknown);
        info!(role = %previous_role, "Previous role");

        let chose_passive_due_to_error =
            store.read::<bool>(key::PASSIVE_ERROR).unwrap_or(false);
        if chose_passive_due_to_error {
            info!("Was previously passive due to error");
        }

        let redundancy_mgr = Arc::new(RedundancyMgr::new(
            providers.clone(),
            Arc::clone(&interface),
            store.clone(),
        ));

        Arc::new(Manager {
            providers,
            interface,
            redundancy_mgr,
            store,
            shutdown,
            previous_role,
            chose_passive_due_to_error: Mutex::new(chose_passive_due_to_error),
            handler: RwLock::new(None),
            heartbeat_started: AtomicBool::new(false),
        })
    }

    pub async fn startup(self: Arc<Self>) {
        tokio::join!(
            self.providers.services.init(),
            self.providers.sibling.init(),
            self.providers.sync.init()
        );

        // A role that must be passive is set before the heartbeat starts
        // and before any waiting on the sibling.
        let forced_passive = self.determine_passive_role_if_required().await;
        if let Some(info) = forced_passive {
            self.update_role(info);
        }

        self.start_heartbeat();

        if forced_passive.is_none() {
            if self.providers.sibling.is_bmc_present() {
                self.providers
                    .sibling
                    .wait_for_sibling_up(SIBLING_UP_TIMEOUT)
                    .await;
            }

            // A previously passive BMC gives the previously active peer
            // first claim on the role.
            if self.previous_role == Role::Passive {
                self.providers.sibling.wait_for_role().await;
            }

            let info = self.determine_role();
            self.update_role(info);
        }

        self.spawn_role_handler();
    }

    /// Forwards an override change to the role handler. Before a handler
    /// exists there is nothing that can legally take the request.
    pub fn disable_red_prop_changed(&self, disable: bool) -> Result<(), IpcError> {
        let handler = self.handler.read().unwrap();
        match handler.as_ref() {
            Some(handler) => handler.disable_red_prop_changed(disable),
            None => {
                error!("DisableRedundancyOverride set before the role handler exists");
                Err(IpcError::Unavailable(
                    "role handler not ready".to_string(),
                ))
            }
        }
    }

    /// Evaluates a failover request against the current role.
    pub async fn failover_blocked_reason(
        &self,
        force: bool,
    ) -> Result<blocked::Reason, IpcError> {
        let handler = self.handler.read().unwrap().clone();
        match handler {
            Some(handler) => Ok(handler.failover_blocked_reason(force).await),
            None => Err(IpcError::Unavailable(
                "role handler not ready".to_string(),
            )),
        }
    }

    /// The error cases that force this BMC passive without an election:
    /// an unprovisioned BMC, or a sibling bus service that never came up.
    async fn determine_passive_role_if_required(&self) -> Option<RoleInfo> {
        if !self.providers.services.provisioned() {
            info!("Role = passive because BMC is not provisioned");
            return Some(RoleInfo {
                role: Role::Passive,
                reason: RoleReason::NotProvisioned,
            });
        }

        if !self.providers.sibling.interface_present() {
            let state = self
                .providers
                .services
                .unit_state(sibling::UNIT_NAME)
                .await;
            if state != "active" {
                info!("Role = passive because sibling BMC service is not running");
                return Some(RoleInfo {
                    role: Role::Passive,
                    reason: RoleReason::SiblingServiceNotRunning,
                });
            }
        }

        None
    }

    fn determine_role(&self) -> RoleInfo {
        let sibling = &self.providers.sibling;

        // An error-driven passive choice last boot must not latch itself
        // in through the resume-previous rules.
        let previous_role = if *self.chose_passive_due_to_error.lock().unwrap() {
            Role::Unknown
        } else {
            self.previous_role
        };

        let bmc_position = match self.providers.services.bmc_position() {
            Ok(position) => position,
            Err(e) => {
                error!(error = %e, "Error collecting elector inputs, role will have to be passive");
                return RoleInfo {
                    role: Role::Passive,
                    reason: RoleReason::Exception,
                };
            }
        };

        let input = role_determination::Input {
            bmc_position,
            previous_role,
            sibling_position: sibling.position().unwrap_or(UNKNOWN_POSITION),
            sibling_role: sibling.role().unwrap_or(Role::Unknown),
            sibling_heartbeat: sibling.has_heartbeat(),
            sibling_provisioned: sibling.provisioned().unwrap_or(false),
        };

        role_determination::determine_role(&input)
    }

    fn update_role(&self, info: RoleInfo) {
        let reason = role_determination::description(info.reason);
        info!(role = %info.role, reason, "Role assigned");

        self.interface.set_role(info.role);

        if let Err(e) = self.store.write(key::ROLE, &info.role) {
            error!(role = %info.role, error = %e, "Failed serializing the role");
        }
        if let Err(e) = self.store.write(key::ROLE_REASON, &reason.to_string()) {
            error!(error = %e, "Failed serializing the role reason");
        }

        let chose_passive_due_to_error = info.role == Role::Passive
            && role_determination::is_error_reason(info.reason);
        *self.chose_passive_due_to_error.lock().unwrap() = chose_passive_due_to_error;

        if let Err(e) = self
            .store
            .write(key::PASSIVE_ERROR, &chose_passive_due_to_error)
        {
            error!(error = %e, "Failed serializing the role error value");
        }
    }

    fn spawn_role_handler(&self) {
        let handler = match self.interface.role() {
            Role::Active => RoleHandler::Active(ActiveRoleHandler::new(
                self.providers.clone(),
                Arc::clone(&self.interface),
                Arc::clone(&self.redundancy_mgr),
                self.store.clone(),
            )),
            Role::Passive => RoleHandler::Passive(PassiveRoleHandler::new(
                self.providers.clone(),
                Arc::clone(&self.interface),
                self.store.clone(),
            )),
            Role::Unknown => {
                error!("Invalid role found when trying to create role handler");
                return;
            }
        };

        *self.handler.write().unwrap() = Some(handler.clone());

        tokio::spawn(async move {
            handler.start().await;
        });
    }

    fn start_heartbeat(&self) {
        if self.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Starting heartbeat");

        let interface = Arc::clone(&self.interface);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            while !shutdown.is_triggered() {
                interface.heartbeat();
                sleep(HEARTBEAT_PERIOD).await;
            }
        });
    }
}
