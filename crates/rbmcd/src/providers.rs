//! Seams between the policy code and the system.
//!
//! The managers and role handlers only ever see these traits; production
//! wires in the socket/subprocess implementations and the tests substitute
//! in-memory doubles.

use anyhow::Result;
use async_trait::async_trait;
use rbmc_common::types::{BMCState, Role, SyncEventsHealth, SystemState};
use std::sync::Arc;
use std::time::Duration;

pub type BoolCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type BmcStateCallback = Arc<dyn Fn(BMCState) + Send + Sync>;
pub type SystemStateCallback = Arc<dyn Fn(SystemState) + Send + Sync>;
pub type SyncHealthCallback = Arc<dyn Fn(SyncEventsHealth) + Send + Sync>;

/// The cached, event-driven view of the peer BMC.
///
/// The optional getters return a value only while the peer's interfaces are
/// visible *and* its heartbeat is active, so no caller can base a decision
/// on stale data from a dead peer. Callback registration is keyed by the
/// local role so a role handler can tear down exactly its own watches.
#[async_trait]
pub trait Sibling: Send + Sync {
    /// Subscribes to the peer's object and loads the initial view.
    async fn init(&self);

    /// Whether the sibling BMC is physically present.
    fn is_bmc_present(&self) -> bool;

    /// Whether all of the peer's interfaces are currently visible.
    fn interface_present(&self) -> bool;

    /// Whether the peer's heartbeat is currently active.
    fn has_heartbeat(&self) -> bool;

    fn role(&self) -> Option<Role>;
    fn bmc_state(&self) -> Option<BMCState>;
    fn redundancy_enabled(&self) -> Option<bool>;
    fn failovers_allowed(&self) -> Option<bool>;
    fn fw_version(&self) -> Option<String>;
    fn position(&self) -> Option<u64>;
    fn provisioned(&self) -> Option<bool>;
    fn comms_ok(&self) -> Option<bool>;

    /// The peer's RedundancyEnabled as last seen, regardless of whether the
    /// peer is still alive. Failover decisions against a dead active BMC
    /// run off this value.
    fn last_known_redundancy_enabled(&self) -> bool;

    /// Polls until the peer is up (interfaces + heartbeat) or the timeout
    /// elapses.
    async fn wait_for_sibling_up(&self, timeout: Duration);

    /// Polls up to 10 seconds for the peer to publish a non-Unknown role.
    async fn wait_for_role(&self);

    /// Polls up to 10 minutes for the peer to reach Ready or Quiesced.
    async fn wait_for_steady_state(&self);

    /// Sleeps long enough for a heartbeat-derived property to settle.
    async fn pause_for_heartbeat_change(&self);

    fn add_heartbeat_callback(&self, role: Role, callback: BoolCallback);
    fn add_redundancy_enabled_callback(&self, role: Role, callback: BoolCallback);
    fn add_failovers_allowed_callback(&self, role: Role, callback: BoolCallback);
    fn add_bmc_state_callback(&self, role: Role, callback: BmcStateCallback);

    /// Drops every callback registered under `role`.
    fn clear_callbacks(&self, role: Role);
}

/// Local-system facade: position, firmware digest, provisioning, host
/// state, and unit control.
#[async_trait]
pub trait Services: Send + Sync {
    /// Reads the host state and starts watching for changes.
    async fn init(&self);

    /// This BMC's position in the pair. Missing or garbage position data
    /// is a configuration error, not a default.
    fn bmc_position(&self) -> Result<u64>;

    /// Digest of the local firmware version.
    fn fw_version_digest(&self) -> String;

    /// Whether this BMC has completed factory provisioning.
    fn provisioned(&self) -> bool;

    /// The host system state, if it has been observed yet.
    fn system_state(&self) -> Option<SystemState>;

    fn add_system_state_callback(&self, callback: SystemStateCallback);

    /// The unit's ActiveState; a nonexistent unit reads as `inactive`.
    async fn unit_state(&self, unit: &str) -> String;

    /// Starts a unit and waits for it to go active or failed.
    async fn start_unit(&self, unit: &str) -> Result<()>;

    /// The local BMC state daemon's current state.
    async fn bmc_state(&self) -> Result<BMCState>;
}

/// Control surface of the data-sync daemon.
#[async_trait]
pub trait SyncControl: Send + Sync {
    /// Starts watching the sync daemon's health property.
    async fn init(&self);

    /// Runs a full sync to completion. `Ok(true)` only on a completed
    /// sync; bus failures surface as errors.
    async fn do_full_sync(&self) -> Result<bool>;

    /// Whether a full sync kicked off by this process is still running.
    fn is_full_sync_in_progress(&self) -> bool;

    /// Turns background sync off. Bus errors are logged and swallowed.
    async fn disable_background_sync(&self);

    fn add_sync_health_callback(&self, role: Role, callback: SyncHealthCallback);
    fn clear_sync_health_callbacks(&self, role: Role);
}

/// The system interfaces handed to every policy component.
#[derive(Clone)]
pub struct Providers {
    pub sibling: Arc<dyn Sibling>,
    pub services: Arc<dyn Services>,
    pub sync: Arc<dyn SyncControl>,
}
