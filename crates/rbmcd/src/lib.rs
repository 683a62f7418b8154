//! Redundant BMC manager.
//!
//! One instance of this daemon runs on each BMC of a redundant pair. It
//! elects the local role at startup, emits a liveness heartbeat, keeps the
//! published redundancy decision in sync with what the pair can actually
//! deliver, and drives the role-specific lifecycle: unit startup, peer-state
//! mirroring on the passive side, data replication on the active side, and
//! the gate on requested failovers.

pub mod active_role_handler;
pub mod handler;
pub mod interface;
pub mod manager;
pub mod passive_role_handler;
pub mod providers;
pub mod redundancy;
pub mod redundancy_mgr;
pub mod role_determination;
pub mod server;
pub mod services;
pub mod shutdown;
pub mod sibling;
pub mod sync_interface;
pub mod timer;
