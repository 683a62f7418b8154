//! Shared building blocks for the redundant-BMC manager.
//!
//! Everything the daemon (`rbmcd`) and the CLI (`rbmctool`) both need lives
//! here: the state enums, the socket protocol, the persistent JSON store,
//! and the firmware version digest.

pub mod bus;
pub mod ipc;
pub mod paths;
pub mod platform;
pub mod store;
pub mod types;
pub mod version;

pub use types::{BMCState, FullSyncStatus, Role, SyncEventsHealth, SystemState};
