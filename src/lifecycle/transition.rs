//! Status transition tables
//!
//! The single source of truth for which status writes are legal, keyed by
//! (current status, flow variant). Every mutating lifecycle operation must
//! consult these tables before writing; anything not listed fails closed.

use crate::error::LifecycleError;
use crate::lifecycle::model::{FlowType, InterestStatus, RequestStatus};

/// Statuses a request may move to in one step.
///
/// The flow variant does not currently distinguish request transitions, but
/// it is part of the key so that the table stays the one place to change if
/// a variant ever diverges.
pub fn request_allowed_next(current: RequestStatus, _flow: FlowType) -> &'static [RequestStatus] {
    match current {
        RequestStatus::Pending => &[RequestStatus::Confirmed, RequestStatus::Cancelled],
        RequestStatus::Confirmed => &[],
        RequestStatus::Cancelled => &[],
    }
}

/// Statuses a line may move to in one step under the given flow variant.
///
/// The online flow must pass through `CreatingLoanPackage` before a package
/// can exist; the offline flow already has an underwritten package and may
/// go straight to `LoanPackageCreated`.
pub fn interest_allowed_next(current: InterestStatus, flow: FlowType) -> &'static [InterestStatus] {
    match (current, flow) {
        (InterestStatus::Pending, FlowType::OfflineManual) => &[
            InterestStatus::LoanPackageCreated,
            InterestStatus::Cancelled,
        ],
        (InterestStatus::Pending, FlowType::OnlineAutomated) => &[
            InterestStatus::CreatingLoanPackage,
            InterestStatus::Cancelled,
        ],
        (InterestStatus::CreatingLoanPackage, _) => &[
            InterestStatus::LoanPackageCreated,
            InterestStatus::Cancelled,
        ],
        (InterestStatus::LoanPackageCreated, _) => &[],
        (InterestStatus::Cancelled, _) => &[],
    }
}

/// Validate a request transition, failing closed on anything unlisted.
pub fn check_request_transition(
    current: RequestStatus,
    target: RequestStatus,
    flow: FlowType,
) -> Result<(), LifecycleError> {
    if request_allowed_next(current, flow).contains(&target) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            from: format!("{current:?}"),
            to: format!("{target:?}"),
            flow,
        })
    }
}

/// Validate a line transition.
///
/// A line sitting in the in-flight `CreatingLoanPackage` status rejects new
/// transition *attempts* with [`LifecycleError::AlreadyCreating`] so callers
/// can tell a race from a programming error. Completing the in-flight step
/// (moving out of `CreatingLoanPackage` along the table) is still legal.
pub fn check_interest_transition(
    current: InterestStatus,
    target: InterestStatus,
    flow: FlowType,
) -> Result<(), LifecycleError> {
    if interest_allowed_next(current, flow).contains(&target) {
        return Ok(());
    }
    if current == InterestStatus::CreatingLoanPackage {
        return Err(LifecycleError::AlreadyCreating);
    }
    Err(LifecycleError::InvalidTransition {
        from: current.to_string(),
        to: target.to_string(),
        flow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_INTEREST: [InterestStatus; 4] = [
        InterestStatus::Pending,
        InterestStatus::CreatingLoanPackage,
        InterestStatus::LoanPackageCreated,
        InterestStatus::Cancelled,
    ];

    const ALL_FLOWS: [FlowType; 2] = [FlowType::OnlineAutomated, FlowType::OfflineManual];

    #[test]
    fn test_request_pending_moves() {
        for flow in ALL_FLOWS {
            assert!(check_request_transition(
                RequestStatus::Pending,
                RequestStatus::Confirmed,
                flow
            )
            .is_ok());
            assert!(check_request_transition(
                RequestStatus::Pending,
                RequestStatus::Cancelled,
                flow
            )
            .is_ok());
        }
    }

    #[test]
    fn test_request_terminals_closed() {
        for flow in ALL_FLOWS {
            for terminal in [RequestStatus::Confirmed, RequestStatus::Cancelled] {
                for target in [
                    RequestStatus::Pending,
                    RequestStatus::Confirmed,
                    RequestStatus::Cancelled,
                ] {
                    assert!(matches!(
                        check_request_transition(terminal, target, flow),
                        Err(LifecycleError::InvalidTransition { .. })
                    ));
                }
            }
        }
    }

    #[test]
    fn test_offline_pending_goes_straight_to_created() {
        assert!(check_interest_transition(
            InterestStatus::Pending,
            InterestStatus::LoanPackageCreated,
            FlowType::OfflineManual
        )
        .is_ok());
    }

    #[test]
    fn test_online_pending_cannot_skip_creating_step() {
        let err = check_interest_transition(
            InterestStatus::Pending,
            InterestStatus::LoanPackageCreated,
            FlowType::OnlineAutomated,
        )
        .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

        assert!(check_interest_transition(
            InterestStatus::Pending,
            InterestStatus::CreatingLoanPackage,
            FlowType::OnlineAutomated
        )
        .is_ok());
    }

    #[test]
    fn test_creating_completes_or_cancels() {
        for flow in ALL_FLOWS {
            assert!(check_interest_transition(
                InterestStatus::CreatingLoanPackage,
                InterestStatus::LoanPackageCreated,
                flow
            )
            .is_ok());
            assert!(check_interest_transition(
                InterestStatus::CreatingLoanPackage,
                InterestStatus::Cancelled,
                flow
            )
            .is_ok());
        }
    }

    #[test]
    fn test_creating_rejects_restart_as_already_creating() {
        // Attempting to start the creating step again is a race, not a bug
        for flow in ALL_FLOWS {
            let err = check_interest_transition(
                InterestStatus::CreatingLoanPackage,
                InterestStatus::CreatingLoanPackage,
                flow,
            )
            .unwrap_err();
            assert!(matches!(err, LifecycleError::AlreadyCreating));

            let err = check_interest_transition(
                InterestStatus::CreatingLoanPackage,
                InterestStatus::Pending,
                flow,
            )
            .unwrap_err();
            assert!(matches!(err, LifecycleError::AlreadyCreating));
        }
    }

    #[test]
    fn test_terminal_interest_statuses_closed() {
        for flow in ALL_FLOWS {
            for terminal in [InterestStatus::LoanPackageCreated, InterestStatus::Cancelled] {
                for target in ALL_INTEREST {
                    assert!(matches!(
                        check_interest_transition(terminal, target, flow),
                        Err(LifecycleError::InvalidTransition { .. })
                    ));
                }
            }
        }
    }

    #[test]
    fn test_closure_everything_unlisted_is_rejected() {
        // Exhaustive sweep: a transition either appears in the table or fails
        for flow in ALL_FLOWS {
            for current in ALL_INTEREST {
                for target in ALL_INTEREST {
                    let allowed = interest_allowed_next(current, flow).contains(&target);
                    let result = check_interest_transition(current, target, flow);
                    assert_eq!(allowed, result.is_ok(), "{current:?} -> {target:?} ({flow})");
                }
            }
        }
    }
}
