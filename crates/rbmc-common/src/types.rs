//! Core state enums shared by the daemon and the CLI.
//!
//! All of these persist and travel on the wire as their underlying integer,
//! so the serde representation is pinned with `into`/`try_from` conversions
//! rather than variant names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether this BMC owns the active duties or stands by.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Role {
    #[default]
    Unknown,
    Active,
    Passive,
}

impl From<Role> for u8 {
    fn from(role: Role) -> u8 {
        role as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Unknown),
            1 => Ok(Role::Active),
            2 => Ok(Role::Passive),
            other => Err(format!("invalid Role value {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unknown => "Unknown",
            Role::Active => "Active",
            Role::Passive => "Passive",
        };
        write!(f, "{name}")
    }
}

/// State published by a BMC's state daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BMCState {
    #[default]
    NotReady,
    Ready,
    Quiesced,
}

impl From<BMCState> for u8 {
    fn from(state: BMCState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for BMCState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BMCState::NotReady),
            1 => Ok(BMCState::Ready),
            2 => Ok(BMCState::Quiesced),
            other => Err(format!("invalid BMCState value {other}")),
        }
    }
}

impl fmt::Display for BMCState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BMCState::NotReady => "NotReady",
            BMCState::Ready => "Ready",
            BMCState::Quiesced => "Quiesced",
        };
        write!(f, "{name}")
    }
}

/// The host system's power/boot progress, collapsed to the four states
/// the redundancy policy cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SystemState {
    Off,
    Booting,
    Runtime,
    Other,
}

impl SystemState {
    /// Maps the host-state object's `CurrentHostState` value.
    pub fn from_host_state(value: &str) -> SystemState {
        match value {
            "Off" => SystemState::Off,
            "Booting" | "TransitioningToRunning" => SystemState::Booting,
            "Running" => SystemState::Runtime,
            _ => SystemState::Other,
        }
    }
}

impl From<SystemState> for u8 {
    fn from(state: SystemState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for SystemState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SystemState::Off),
            1 => Ok(SystemState::Booting),
            2 => Ok(SystemState::Runtime),
            3 => Ok(SystemState::Other),
            other => Err(format!("invalid SystemState value {other}")),
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Off => "Off",
            SystemState::Booting => "Booting",
            SystemState::Runtime => "Runtime",
            SystemState::Other => "Other",
        };
        write!(f, "{name}")
    }
}

/// Status of the sync daemon's one-shot full replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FullSyncStatus {
    #[default]
    Unknown,
    InProgress,
    Completed,
    Failed,
}

impl From<FullSyncStatus> for u8 {
    fn from(status: FullSyncStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for FullSyncStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FullSyncStatus::Unknown),
            1 => Ok(FullSyncStatus::InProgress),
            2 => Ok(FullSyncStatus::Completed),
            3 => Ok(FullSyncStatus::Failed),
            other => Err(format!("invalid FullSyncStatus value {other}")),
        }
    }
}

impl fmt::Display for FullSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FullSyncStatus::Unknown => "Unknown",
            FullSyncStatus::InProgress => "InProgress",
            FullSyncStatus::Completed => "Completed",
            FullSyncStatus::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// Health of the sync daemon's background replication events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SyncEventsHealth {
    #[default]
    Ok,
    Degraded,
    Critical,
}

impl From<SyncEventsHealth> for u8 {
    fn from(health: SyncEventsHealth) -> u8 {
        health as u8
    }
}

impl TryFrom<u8> for SyncEventsHealth {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncEventsHealth::Ok),
            1 => Ok(SyncEventsHealth::Degraded),
            2 => Ok(SyncEventsHealth::Critical),
            other => Err(format!("invalid SyncEventsHealth value {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Role::Passive).unwrap(), "2");
        let role: Role = serde_json::from_str("1").unwrap();
        assert_eq!(role, Role::Active);
        assert!(serde_json::from_str::<Role>("9").is_err());
    }

    #[test]
    fn host_state_mapping() {
        assert_eq!(SystemState::from_host_state("Off"), SystemState::Off);
        assert_eq!(SystemState::from_host_state("Running"), SystemState::Runtime);
        assert_eq!(
            SystemState::from_host_state("TransitioningToRunning"),
            SystemState::Booting
        );
        assert_eq!(
            SystemState::from_host_state("DiagnosticMode"),
            SystemState::Other
        );
    }
}
