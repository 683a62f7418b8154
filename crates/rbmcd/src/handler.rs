//! Role handler dispatch.
//!
//! Exactly one handler exists once startup has elected a role; making the
//! handler a tagged variant keeps that structural. Dropping a variant runs
//! its teardown, which unregisters every callback it installed.

use rbmc_common::ipc::IpcError;
use std::sync::Arc;

use crate::active_role_handler::ActiveRoleHandler;
use crate::passive_role_handler::PassiveRoleHandler;
use crate::redundancy::blocked;

#[derive(Clone)]
pub enum RoleHandler {
    Active(Arc<ActiveRoleHandler>),
    Passive(Arc<PassiveRoleHandler>),
}

impl RoleHandler {
    pub async fn start(&self) {
        match self {
            RoleHandler::Active(handler) => Arc::clone(handler).start().await,
            RoleHandler::Passive(handler) => Arc::clone(handler).start().await,
        }
    }

    pub fn disable_red_prop_changed(&self, disable: bool) -> Result<(), IpcError> {
        match self {
            RoleHandler::Active(handler) => handler.disable_red_prop_changed(disable),
            RoleHandler::Passive(handler) => handler.disable_red_prop_changed(disable),
        }
    }

    pub async fn failover_blocked_reason(&self, force: bool) -> blocked::Reason {
        match self {
            RoleHandler::Active(handler) => handler.failover_blocked_reason(force),
            RoleHandler::Passive(handler) => handler.failover_blocked_reason(force).await,
        }
    }
}
