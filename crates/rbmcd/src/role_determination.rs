//! Role election.
//!
//! A pure, deterministic mapping from what this BMC knows about itself and
//! its sibling to the role it should claim. The caller is responsible for
//! presenting `previous_role = Unknown` when the last run chose passive for
//! an error reason, so an error never latches through the resume rules.

use rbmc_common::types::Role;

/// Inputs to [`determine_role`].
#[derive(Debug, Clone, Copy)]
pub struct Input {
    pub bmc_position: u64,
    pub previous_role: Role,
    pub sibling_position: u64,
    pub sibling_role: Role,
    pub sibling_heartbeat: bool,
    pub sibling_provisioned: bool,
}

/// Why the role is what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleReason {
    Unknown,
    NoSiblingHeartbeat,
    SamePositions,
    SiblingNotProvisioned,
    SiblingPassive,
    SiblingActive,
    ResumePrevious,
    PositionZero,
    PositionNonzero,
    NotProvisioned,
    SiblingServiceNotRunning,
    Exception,
}

/// The elected role and its reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleInfo {
    pub role: Role,
    pub reason: RoleReason,
}

/// Decides whether this BMC claims Active or Passive. First match wins.
pub fn determine_role(input: &Input) -> RoleInfo {
    // Must check this before any other sibling fields.
    let (role, reason) = if !input.sibling_heartbeat {
        (Role::Active, RoleReason::NoSiblingHeartbeat)
    } else if input.bmc_position == input.sibling_position {
        // Both BMCs claiming the same slot must not both go active.
        (Role::Passive, RoleReason::SamePositions)
    } else if !input.sibling_provisioned {
        (Role::Active, RoleReason::SiblingNotProvisioned)
    } else if input.sibling_role == Role::Passive {
        (Role::Active, RoleReason::SiblingPassive)
    } else if input.sibling_role == Role::Active {
        (Role::Passive, RoleReason::SiblingActive)
    } else if input.previous_role == Role::Active {
        (Role::Active, RoleReason::ResumePrevious)
    } else if input.previous_role == Role::Passive {
        (Role::Passive, RoleReason::ResumePrevious)
    } else if input.bmc_position == 0 {
        (Role::Active, RoleReason::PositionZero)
    } else {
        (Role::Passive, RoleReason::PositionNonzero)
    };

    RoleInfo { role, reason }
}

/// The human readable description, persisted alongside the role.
pub fn description(reason: RoleReason) -> &'static str {
    match reason {
        RoleReason::Unknown => "Unknown reason",
        RoleReason::NoSiblingHeartbeat => "No sibling heartbeat",
        RoleReason::SamePositions => "Both BMCs have the same position",
        RoleReason::SiblingNotProvisioned => "Sibling is not provisioned",
        RoleReason::SiblingPassive => "Sibling is already passive",
        RoleReason::SiblingActive => "Sibling is already active",
        RoleReason::ResumePrevious => "Resuming previous role",
        RoleReason::PositionZero => "BMC is position 0",
        RoleReason::PositionNonzero => "BMC is not position 0",
        RoleReason::NotProvisioned => "BMC is not provisioned",
        RoleReason::SiblingServiceNotRunning => "Sibling BMC service is not running",
        RoleReason::Exception => "Error encountered while determining role",
    }
}

/// True for the reasons that force a BMC passive as an error case.
pub fn is_error_reason(reason: RoleReason) -> bool {
    matches!(
        reason,
        RoleReason::SamePositions
            | RoleReason::NotProvisioned
            | RoleReason::SiblingServiceNotRunning
            | RoleReason::Exception
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> Input {
        Input {
            bmc_position: 0,
            previous_role: Role::Unknown,
            sibling_position: 1,
            sibling_role: Role::Unknown,
            sibling_heartbeat: true,
            sibling_provisioned: true,
        }
    }

    #[test]
    fn no_heartbeat_wins_over_everything() {
        let input = Input {
            sibling_heartbeat: false,
            sibling_role: Role::Active,
            previous_role: Role::Passive,
            ..base_input()
        };
        assert_eq!(
            determine_role(&input),
            RoleInfo {
                role: Role::Active,
                reason: RoleReason::NoSiblingHeartbeat
            }
        );
    }

    #[test]
    fn same_positions_is_a_passive_error() {
        let input = Input {
            bmc_position: 2,
            sibling_position: 2,
            ..base_input()
        };
        let info = determine_role(&input);
        assert_eq!(
            info,
            RoleInfo {
                role: Role::Passive,
                reason: RoleReason::SamePositions
            }
        );
        assert!(is_error_reason(info.reason));
    }

    #[test]
    fn unprovisioned_sibling_yields_active() {
        let input = Input {
            sibling_provisioned: false,
            sibling_role: Role::Active,
            ..base_input()
        };
        assert_eq!(
            determine_role(&input).reason,
            RoleReason::SiblingNotProvisioned
        );
        assert_eq!(determine_role(&input).role, Role::Active);
    }

    #[test]
    fn sibling_role_decides_before_history() {
        let passive_sibling = Input {
            sibling_role: Role::Passive,
            previous_role: Role::Passive,
            ..base_input()
        };
        assert_eq!(
            determine_role(&passive_sibling),
            RoleInfo {
                role: Role::Active,
                reason: RoleReason::SiblingPassive
            }
        );

        let active_sibling = Input {
            sibling_role: Role::Active,
            previous_role: Role::Active,
            ..base_input()
        };
        assert_eq!(
            determine_role(&active_sibling),
            RoleInfo {
                role: Role::Passive,
                reason: RoleReason::SiblingActive
            }
        );
    }

    #[test]
    fn previous_role_resumes_when_sibling_is_undecided() {
        let was_active = Input {
            previous_role: Role::Active,
            bmc_position: 1,
            sibling_position: 0,
            ..base_input()
        };
        assert_eq!(
            determine_role(&was_active),
            RoleInfo {
                role: Role::Active,
                reason: RoleReason::ResumePrevious
            }
        );

        // Previous passive beats the position-zero tiebreak.
        let was_passive = Input {
            previous_role: Role::Passive,
            ..base_input()
        };
        assert_eq!(
            determine_role(&was_passive),
            RoleInfo {
                role: Role::Passive,
                reason: RoleReason::ResumePrevious
            }
        );
    }

    #[test]
    fn position_breaks_the_tie_without_history() {
        assert_eq!(
            determine_role(&base_input()),
            RoleInfo {
                role: Role::Active,
                reason: RoleReason::PositionZero
            }
        );

        let nonzero = Input {
            bmc_position: 1,
            sibling_position: 0,
            ..base_input()
        };
        assert_eq!(
            determine_role(&nonzero),
            RoleInfo {
                role: Role::Passive,
                reason: RoleReason::PositionNonzero
            }
        );
    }

    #[test]
    fn error_reasons_are_exactly_the_forced_passive_set() {
        let error_reasons = [
            RoleReason::SamePositions,
            RoleReason::NotProvisioned,
            RoleReason::SiblingServiceNotRunning,
            RoleReason::Exception,
        ];
        let benign_reasons = [
            RoleReason::Unknown,
            RoleReason::NoSiblingHeartbeat,
            RoleReason::SiblingNotProvisioned,
            RoleReason::SiblingPassive,
            RoleReason::SiblingActive,
            RoleReason::ResumePrevious,
            RoleReason::PositionZero,
            RoleReason::PositionNonzero,
        ];

        for reason in error_reasons {
            assert!(is_error_reason(reason), "{reason:?}");
        }
        for reason in benign_reasons {
            assert!(!is_error_reason(reason), "{reason:?}");
        }
    }

    #[test]
    fn every_reason_has_a_description() {
        assert_eq!(
            description(RoleReason::NoSiblingHeartbeat),
            "No sibling heartbeat"
        );
        assert_eq!(
            description(RoleReason::SamePositions),
            "Both BMCs have the same position"
        );
    }
}
