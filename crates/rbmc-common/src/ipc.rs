//! Socket protocol between the RBMC daemons and their clients.
//!
//! Frames are newline-delimited JSON. A connection normally carries
//! request/response pairs; a `Subscribe` request upgrades it to a one-way
//! signal stream.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Property bag used by `GetProperties` and the change signals. Values are
/// left as raw JSON; the enums in [`crate::types`] parse straight out of the
/// integers they serialize to.
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// Request from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

/// Response to a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, IpcError>,
}

/// Methods understood by the redundancy object and, for the sync and state
/// objects, by their external daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Method {
    /// Read every property of the object.
    GetProperties,

    /// Set the manual redundancy-disable override. Rejected with
    /// [`IpcError::Unavailable`] unless the system is powered off and no
    /// full sync is running.
    SetDisableRedundancyOverride { disable: bool },

    /// Ask the passive BMC to take over. `force` overrides a paused
    /// failover gate.
    StartFailover { force: bool },

    /// Upgrade this connection to a signal stream.
    Subscribe,

    /// Sync daemon: enable or disable background sync.
    SetDisableSync { disable: bool },

    /// Sync daemon: start a one-shot full sync.
    StartFullSync,
}

/// Response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseData {
    /// Success with nothing else to say.
    Ok,

    /// Property bag for `GetProperties`.
    Properties(PropertyMap),

    /// Result of a `StartFailover` request.
    FailoverResult {
        allowed: bool,
        reason: Option<String>,
    },
}

/// Signal frames streamed after `Subscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Signal {
    /// The object (re)appeared with the given initial properties.
    InterfacesAdded { properties: PropertyMap },

    /// The object was cleanly taken down.
    InterfacesRemoved,

    /// One or more properties changed.
    PropertiesChanged { properties: PropertyMap },

    /// Liveness pulse, emitted once per second by a running manager.
    Heartbeat,
}

/// Errors carried back across the socket.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum IpcError {
    /// The operation is not possible in the current system state; the
    /// caller should retry later. Policy rejections are never queued.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Property names used on the wire.
pub mod property {
    pub const ROLE: &str = "Role";
    pub const REDUNDANCY_ENABLED: &str = "RedundancyEnabled";
    pub const FAILOVERS_ALLOWED: &str = "FailoversAllowed";
    pub const DISABLE_REDUNDANCY_OVERRIDE: &str = "DisableRedundancyOverride";
    pub const BMC_POSITION: &str = "BMCPosition";
    pub const PROVISIONED: &str = "Provisioned";
    pub const FW_VERSION: &str = "FWVersion";
    pub const BMC_STATE: &str = "BMCState";
    pub const CURRENT_BMC_STATE: &str = "CurrentBMCState";
    pub const CURRENT_HOST_STATE: &str = "CurrentHostState";
    pub const COMMUNICATION_OK: &str = "CommunicationOK";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const FULL_SYNC_STATUS: &str = "FullSyncStatus";
    pub const SYNC_EVENTS_HEALTH: &str = "SyncEventsHealth";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = Request {
            id: 7,
            method: Method::SetDisableRedundancyOverride { disable: true },
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 7);
        assert!(matches!(
            parsed.method,
            Method::SetDisableRedundancyOverride { disable: true }
        ));
    }

    #[test]
    fn error_is_typed_across_the_wire() {
        let response = Response {
            id: 1,
            result: Err(IpcError::Unavailable("powered on".into())),
        };
        let json = serde_json::to_string(&response).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.result.unwrap_err(),
            IpcError::Unavailable("powered on".into())
        );
    }
}
