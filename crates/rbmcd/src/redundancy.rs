//! Redundancy and failover evaluation.
//!
//! Three pure evaluators: the reasons redundancy can't be enabled, the
//! reasons failovers are paused, and the single reason a *requested*
//! failover is blocked. All policy state is passed in; nothing here touches
//! the bus or the store.

use rbmc_common::types::{BMCState, Role, SystemState};
use std::collections::BTreeSet;
use tracing::info;

/// Inputs to [`get_no_redundancy_reasons`].
#[derive(Debug, Clone, Copy)]
pub struct Input {
    pub role: Role,
    pub sibling_present: bool,
    pub sibling_heartbeat: bool,
    pub sibling_provisioned: bool,
    pub sibling_has_sibling_comm: bool,
    pub sibling_role: Role,
    pub sibling_state: BMCState,
    pub code_versions_match: bool,
    pub manual_disable: bool,
    pub redundancy_off_at_runtime_start: bool,
    pub sync_failed: bool,
}

/// Reasons redundancy can't be enabled. Stored as integers, so the
/// discriminants are pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NoRedundancyReason {
    BmcNotActive = 1,
    ManuallyDisabled = 2,
    SiblingMissing = 3,
    NoSiblingHeartbeat = 4,
    SiblingNotProvisioned = 5,
    SiblingNotPassive = 6,
    SiblingNoCommunication = 7,
    CodeMismatch = 8,
    SiblingNotAtReady = 9,
    SystemHardwareConfigIssue = 10,
    RedundancyOffAtRuntimeStart = 11,
    SyncFailed = 12,
    Other = 13,
}

pub type NoRedundancyReasons = BTreeSet<NoRedundancyReason>;

/// Returns the reasons redundancy can't be enabled. Empty means it can be.
///
/// A missing sibling, or a sibling with no heartbeat, suppresses the finer
/// grained sibling checks so a dead peer reports one reason, not five.
pub fn get_no_redundancy_reasons(input: &Input) -> NoRedundancyReasons {
    use NoRedundancyReason::*;
    let mut reasons = NoRedundancyReasons::new();

    if input.role != Role::Active {
        reasons.insert(BmcNotActive);
    }

    if input.manual_disable {
        reasons.insert(ManuallyDisabled);
    }

    if !input.sibling_present {
        reasons.insert(SiblingMissing);
    } else if !input.sibling_heartbeat {
        reasons.insert(NoSiblingHeartbeat);
    } else {
        if !input.sibling_provisioned {
            reasons.insert(SiblingNotProvisioned);
        }

        if input.sibling_role != Role::Passive {
            reasons.insert(SiblingNotPassive);
        }

        if !input.sibling_has_sibling_comm {
            reasons.insert(SiblingNoCommunication);
        }

        if !input.code_versions_match {
            reasons.insert(CodeMismatch);
        }

        if input.sibling_state != BMCState::Ready {
            reasons.insert(SiblingNotAtReady);
        }

        if input.sync_failed {
            reasons.insert(SyncFailed);
        }
    }

    if input.redundancy_off_at_runtime_start {
        reasons.insert(RedundancyOffAtRuntimeStart);
    }

    reasons
}

/// The human readable description of a reason.
pub fn description(reason: NoRedundancyReason) -> &'static str {
    use NoRedundancyReason::*;
    match reason {
        BmcNotActive => "BMC is not active",
        ManuallyDisabled => "Manually disabled",
        SiblingMissing => "Sibling is missing",
        NoSiblingHeartbeat => "No sibling heartbeat",
        SiblingNotProvisioned => "Sibling is not provisioned",
        SiblingNotPassive => "Sibling is not passive",
        SiblingNoCommunication => "Sibling can't communicate with this BMC",
        CodeMismatch => "Firmware version mismatch",
        SiblingNotAtReady => "Sibling is not at ready state",
        SystemHardwareConfigIssue => "System hardware configuration issue",
        RedundancyOffAtRuntimeStart => "Redundancy was off upon reaching runtime",
        SyncFailed => "Data sync failed",
        Other => "Other",
    }
}

/// Failovers-paused evaluation.
pub mod paused {
    use super::*;

    /// Reasons failovers are paused while redundancy is otherwise enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum FailoversPausedReason {
        SystemState,
    }

    pub type FailoversPausedReasons = BTreeSet<FailoversPausedReason>;

    /// Failovers only run with the host fully off or fully booted.
    pub fn get_failovers_paused_reasons(system_state: SystemState) -> FailoversPausedReasons {
        let mut reasons = FailoversPausedReasons::new();

        if system_state != SystemState::Off && system_state != SystemState::Runtime {
            reasons.insert(FailoversPausedReason::SystemState);
        }

        reasons
    }

    pub fn description(reason: FailoversPausedReason) -> &'static str {
        match reason {
            FailoversPausedReason::SystemState => "System state is not off or runtime",
        }
    }
}

/// Blocked evaluation for a *requested* failover.
pub mod blocked {
    use super::*;

    /// Inputs to [`get_failover_blocked_reason`].
    #[derive(Debug, Clone, Copy)]
    pub struct Input {
        pub sibling_heartbeat: bool,
        pub sibling_state: BMCState,
        pub redundancy_enabled: bool,
        pub sync_in_progress: bool,
        pub state: BMCState,
        pub failovers_not_allowed: bool,
        pub force_option: bool,
        pub last_known_redundancy_enabled: bool,
    }

    /// Why a requested failover is blocked, or `None` if it may proceed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Reason {
        None,
        RedundancyNotEnabled,
        FullSyncInProgress,
        FailoversNotAllowed,
        SiblingDeadButRedundancyNotEnabled,
        NotAtReady,
        BmcNotPassive,
    }

    /// Evaluates a failover request on the passive BMC.
    pub fn get_failover_blocked_reason(input: &Input) -> Reason {
        if input.sibling_heartbeat {
            if !input.redundancy_enabled {
                return Reason::RedundancyNotEnabled;
            }

            if input.sync_in_progress {
                // This BMC is in the middle of its full sync.
                return Reason::FullSyncInProgress;
            }

            if input.failovers_not_allowed {
                if input.force_option {
                    // Trace it but don't block it.
                    info!("The failover 'Force' option is set while failovers are not allowed");
                } else if input.sibling_state == BMCState::Quiesced {
                    // A quiesced active BMC may be stuck with failovers
                    // paused, so don't block it, just trace it.
                    info!("The sibling BMC is quiesced while failovers are not allowed");
                } else {
                    return Reason::FailoversNotAllowed;
                }
            }
        } else {
            // The active BMC isn't responding. Use its last known value of
            // RedundancyEnabled, otherwise a dead active BMC and a live
            // passive BMC would be stuck with no way to fail over.
            if !input.last_known_redundancy_enabled {
                return Reason::SiblingDeadButRedundancyNotEnabled;
            }

            info!("There is no sibling heartbeat but redundancy was last known to be enabled");

            if input.failovers_not_allowed {
                // The value could have been latched by the active BMC
                // before it died, so still allow the failover.
                info!("In addition, failovers were previously not allowed");
            }
        }

        // A BMC that isn't at Ready has to be fixed before it can take
        // over as active.
        if input.state != BMCState::Ready {
            return Reason::NotAtReady;
        }

        Reason::None
    }

    pub fn description(reason: Reason) -> &'static str {
        match reason {
            Reason::None => "No reason",
            Reason::RedundancyNotEnabled => "Redundancy is not enabled",
            Reason::FullSyncInProgress => "Full sync is in progress",
            Reason::FailoversNotAllowed => "Failovers are not allowed",
            Reason::SiblingDeadButRedundancyNotEnabled => {
                "Sibling is dead but redundancy wasn't previously enabled"
            }
            Reason::NotAtReady => "This BMC is not at Ready state",
            Reason::BmcNotPassive => "This BMC is not passive",
        }
    }
}
