//! Pure transition function shared by every managed state machine.
//!
//! `decide` looks at a snapshot of a job and its bound unit of work and returns the
//! single step to take. It performs no I/O; the executor applies the step.

use crate::domain::{JobState, UnitOfWork, UowState, next_cursor};

use super::kind::TransitionPolicy;

/// Snapshot the transition function decides on
#[derive(Debug, Clone)]
pub struct TransitionInput<'a> {
    pub job_state: JobState,
    pub timeperiod: &'a str,
    /// Timeperiod containing "now" at the process's qualifier
    pub actual_timeperiod: &'a str,
    pub is_finalizable: bool,
    /// False when the timeperiod is grouped out
    pub is_aligned: bool,
    /// The job's related unit of work, if any
    pub uow: Option<&'a UnitOfWork>,
}

/// One step of a job's lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Grouped-out period: the job becomes noop with no unit of work
    MarkNoop,
    /// Create and publish a unit of work, then move the job to `job_state`
    Dispatch {
        start_id: String,
        end_id: String,
        job_state: JobState,
    },
    /// Publish the bound unit of work again
    Republish,
    /// Re-stamp the still-requested unit of work, then publish it again
    RefreshScope,
    /// Move the job to a terminal state
    Finalize(JobState),
    /// Nothing to do this tick
    Wait(String),
    /// The job is in a state this machine does not handle
    Unsupported(String),
}

/// Decide the next step for `manage_job`
pub fn decide(policy: TransitionPolicy, input: &TransitionInput<'_>) -> Transition {
    match input.job_state {
        JobState::Embryo if !input.is_aligned => Transition::MarkNoop,
        JobState::Embryo => Transition::Dispatch {
            start_id: "0".to_string(),
            end_id: "0".to_string(),
            job_state: JobState::InProgress,
        },
        JobState::InProgress => match input.uow {
            Some(uow) if policy.uses_final_run => continuous_in_progress(input, uow),
            Some(uow) => discrete_in_progress(policy, input, uow),
            None => Transition::Unsupported("job is in_progress without a unit of work".to_string()),
        },
        JobState::FinalRun if policy.uses_final_run => match input.uow {
            Some(uow) => final_run(uow),
            None => Transition::Unsupported("job is in final_run without a unit of work".to_string()),
        },
        JobState::FinalRun => Transition::Unsupported("final_run is not used by this state machine".to_string()),
        JobState::Processed | JobState::Skipped | JobState::Noop => {
            Transition::Wait(format!("job is already {}", input.job_state.as_str()))
        }
    }
}

/// Decide the shallow update applied on a completion message; never dispatches new work
pub fn decide_notification(policy: TransitionPolicy, input: &TransitionInput<'_>) -> Transition {
    let Some(uow) = input.uow else {
        return Transition::Wait("no unit of work to evaluate".to_string());
    };

    let step = if policy.uses_final_run {
        if input.job_state != JobState::FinalRun {
            return Transition::Wait(format!("job is {}, not final_run", input.job_state.as_str()));
        }
        final_run(uow)
    } else {
        if input.job_state != JobState::InProgress {
            return Transition::Wait(format!("job is {}, not in_progress", input.job_state.as_str()));
        }
        if input.timeperiod >= input.actual_timeperiod {
            return Transition::Wait("the working timeperiod has not finished yet".to_string());
        }
        if !input.is_finalizable {
            return Transition::Wait("the job is not finalizable".to_string());
        }
        discrete_finalizable(policy, uow)
    };

    match step {
        Transition::Finalize(_) | Transition::Wait(_) => step,
        _ => Transition::Wait(format!("unit of work {} is {}", uow.id, uow.state.as_str())),
    }
}

fn is_period_open(input: &TransitionInput<'_>) -> bool {
    input.timeperiod == input.actual_timeperiod || !input.is_finalizable
}

fn is_period_closed(input: &TransitionInput<'_>) -> bool {
    input.timeperiod < input.actual_timeperiod && input.is_finalizable
}

fn future_timeperiod(input: &TransitionInput<'_>) -> Transition {
    Transition::Unsupported(format!(
        "timeperiod {} is in the future of {}",
        input.timeperiod, input.actual_timeperiod
    ))
}

fn continuous_in_progress(input: &TransitionInput<'_>, uow: &UnitOfWork) -> Transition {
    if is_period_open(input) {
        match uow.state {
            UowState::Requested => Transition::RefreshScope,
            UowState::InProgress => Transition::Republish,
            UowState::Processed | UowState::Canceled | UowState::Noop | UowState::Invalid => {
                let cursor = next_cursor(&uow.end_id);
                Transition::Dispatch {
                    start_id: cursor.clone(),
                    end_id: cursor,
                    job_state: JobState::InProgress,
                }
            }
        }
    } else if is_period_closed(input) {
        let cursor = next_cursor(&uow.end_id);
        Transition::Dispatch {
            start_id: cursor.clone(),
            end_id: cursor,
            job_state: JobState::FinalRun,
        }
    } else {
        future_timeperiod(input)
    }
}

fn discrete_in_progress(policy: TransitionPolicy, input: &TransitionInput<'_>, uow: &UnitOfWork) -> Transition {
    if is_period_open(input) {
        match uow.state {
            UowState::Requested | UowState::InProgress => Transition::Republish,
            UowState::Invalid => left_to_gc(uow),
            UowState::Processed | UowState::Canceled | UowState::Noop => Transition::Dispatch {
                start_id: "0".to_string(),
                end_id: next_cursor(&uow.end_id),
                job_state: JobState::InProgress,
            },
        }
    } else if is_period_closed(input) {
        discrete_finalizable(policy, uow)
    } else {
        future_timeperiod(input)
    }
}

fn discrete_finalizable(policy: TransitionPolicy, uow: &UnitOfWork) -> Transition {
    match uow.state {
        UowState::Requested | UowState::InProgress => Transition::Republish,
        UowState::Invalid => left_to_gc(uow),
        UowState::Processed => Transition::Finalize(JobState::Processed),
        UowState::Canceled => Transition::Finalize(JobState::Skipped),
        UowState::Noop if policy.noop_uow_finalizes => Transition::Finalize(JobState::Noop),
        UowState::Noop => Transition::Wait(format!("unit of work {} is noop; nothing to finalize", uow.id)),
    }
}

fn final_run(uow: &UnitOfWork) -> Transition {
    match uow.state {
        UowState::Processed => Transition::Finalize(JobState::Processed),
        UowState::Canceled => Transition::Finalize(JobState::Skipped),
        UowState::Requested | UowState::InProgress => Transition::Republish,
        UowState::Invalid => left_to_gc(uow),
        UowState::Noop => Transition::Wait(format!("unit of work {} is noop in final_run", uow.id)),
    }
}

fn left_to_gc(uow: &UnitOfWork) -> Transition {
    Transition::Wait(format!(
        "unit of work {} is invalid; relying on the garbage collector",
        uow.id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UowType;
    use crate::state_machine::StateMachineKind;
    use chrono::{TimeZone, Utc};

    fn uow(state: UowState, end_id: &str) -> UnitOfWork {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut uow = UnitOfWork::new(
            "hourly", "2020010100", "2020010100", "2020010101", "0", end_id, UowType::Managed, now,
        );
        uow.state = state;
        uow
    }

    fn input<'a>(job_state: JobState, actual: &'a str, finalizable: bool, uow: Option<&'a UnitOfWork>) -> TransitionInput<'a> {
        TransitionInput {
            job_state,
            timeperiod: "2020010100",
            actual_timeperiod: actual,
            is_finalizable: finalizable,
            is_aligned: true,
            uow,
        }
    }

    const OPEN: &str = "2020010100";
    const CLOSED: &str = "2020010105";

    #[test]
    fn test_embryo_dispatches_or_goes_noop() {
        let policy = StateMachineKind::Discrete.policy();
        let embryo = input(JobState::Embryo, OPEN, false, None);
        assert!(matches!(
            decide(policy, &embryo),
            Transition::Dispatch { job_state: JobState::InProgress, .. }
        ));

        let grouped_out = TransitionInput { is_aligned: false, ..embryo };
        assert_eq!(decide(policy, &grouped_out), Transition::MarkNoop);
    }

    #[test]
    fn test_discrete_open_period() {
        let policy = StateMachineKind::Discrete.policy();

        let requested = uow(UowState::Requested, "0");
        assert_eq!(decide(policy, &input(JobState::InProgress, OPEN, false, Some(&requested))), Transition::Republish);

        let invalid = uow(UowState::Invalid, "0");
        assert!(matches!(
            decide(policy, &input(JobState::InProgress, OPEN, false, Some(&invalid))),
            Transition::Wait(_)
        ));

        let processed = uow(UowState::Processed, "4");
        assert_eq!(
            decide(policy, &input(JobState::InProgress, OPEN, false, Some(&processed))),
            Transition::Dispatch {
                start_id: "0".to_string(),
                end_id: "5".to_string(),
                job_state: JobState::InProgress,
            }
        );
    }

    #[test]
    fn test_discrete_closed_period_finalizes() {
        let policy = StateMachineKind::Discrete.policy();
        let cases = [
            (UowState::Processed, JobState::Processed),
            (UowState::Canceled, JobState::Skipped),
            (UowState::Noop, JobState::Noop),
        ];
        for (uow_state, job_state) in cases {
            let bound = uow(uow_state, "0");
            assert_eq!(
                decide(policy, &input(JobState::InProgress, CLOSED, true, Some(&bound))),
                Transition::Finalize(job_state)
            );
        }
    }

    #[test]
    fn test_simplified_discrete_ignores_noop_uow() {
        let policy = StateMachineKind::SimplifiedDiscrete.policy();
        let bound = uow(UowState::Noop, "0");
        assert!(matches!(
            decide(policy, &input(JobState::InProgress, CLOSED, true, Some(&bound))),
            Transition::Wait(_)
        ));

        let processed = uow(UowState::Processed, "0");
        assert_eq!(
            decide(policy, &input(JobState::InProgress, CLOSED, true, Some(&processed))),
            Transition::Finalize(JobState::Processed)
        );
    }

    #[test]
    fn test_closed_but_not_finalizable_keeps_working() {
        let policy = StateMachineKind::Discrete.policy();
        let processed = uow(UowState::Processed, "0");
        assert!(matches!(
            decide(policy, &input(JobState::InProgress, CLOSED, false, Some(&processed))),
            Transition::Dispatch { .. }
        ));
    }

    #[test]
    fn test_future_timeperiod_is_unsupported() {
        let policy = StateMachineKind::Discrete.policy();
        let bound = uow(UowState::Requested, "0");
        let future = TransitionInput {
            actual_timeperiod: "2019123123",
            ..input(JobState::InProgress, OPEN, true, Some(&bound))
        };
        assert!(matches!(decide(policy, &future), Transition::Unsupported(_)));
    }

    #[test]
    fn test_continuous_rearms_then_final_run() {
        let policy = StateMachineKind::Continuous.policy();

        let requested = uow(UowState::Requested, "0");
        assert_eq!(
            decide(policy, &input(JobState::InProgress, OPEN, false, Some(&requested))),
            Transition::RefreshScope
        );

        let invalid = uow(UowState::Invalid, "2");
        assert_eq!(
            decide(policy, &input(JobState::InProgress, OPEN, false, Some(&invalid))),
            Transition::Dispatch {
                start_id: "3".to_string(),
                end_id: "3".to_string(),
                job_state: JobState::InProgress,
            }
        );

        let in_progress = uow(UowState::InProgress, "2");
        assert!(matches!(
            decide(policy, &input(JobState::InProgress, CLOSED, true, Some(&in_progress))),
            Transition::Dispatch { job_state: JobState::FinalRun, .. }
        ));
    }

    #[test]
    fn test_final_run_resolution() {
        let policy = StateMachineKind::Continuous.policy();
        let processed = uow(UowState::Processed, "0");
        let canceled = uow(UowState::Canceled, "0");
        assert_eq!(
            decide(policy, &input(JobState::FinalRun, CLOSED, true, Some(&processed))),
            Transition::Finalize(JobState::Processed)
        );
        assert_eq!(
            decide(policy, &input(JobState::FinalRun, CLOSED, true, Some(&canceled))),
            Transition::Finalize(JobState::Skipped)
        );

        let discrete = StateMachineKind::Discrete.policy();
        assert!(matches!(
            decide(discrete, &input(JobState::FinalRun, CLOSED, true, Some(&processed))),
            Transition::Unsupported(_)
        ));
    }

    #[test]
    fn test_finished_job_waits() {
        let policy = StateMachineKind::Discrete.policy();
        assert!(matches!(
            decide(policy, &input(JobState::Processed, CLOSED, true, None)),
            Transition::Wait(_)
        ));
    }

    #[test]
    fn test_notification_never_dispatches() {
        let discrete = StateMachineKind::Discrete.policy();
        let requested = uow(UowState::Requested, "0");
        assert!(matches!(
            decide_notification(discrete, &input(JobState::InProgress, CLOSED, true, Some(&requested))),
            Transition::Wait(_)
        ));

        let processed = uow(UowState::Processed, "0");
        assert_eq!(
            decide_notification(discrete, &input(JobState::InProgress, CLOSED, true, Some(&processed))),
            Transition::Finalize(JobState::Processed)
        );
        assert!(matches!(
            decide_notification(discrete, &input(JobState::InProgress, OPEN, true, Some(&processed))),
            Transition::Wait(_)
        ));

        let continuous = StateMachineKind::Continuous.policy();
        assert!(matches!(
            decide_notification(continuous, &input(JobState::InProgress, CLOSED, true, Some(&processed))),
            Transition::Wait(_)
        ));
        assert_eq!(
            decide_notification(continuous, &input(JobState::FinalRun, CLOSED, true, Some(&processed))),
            Transition::Finalize(JobState::Processed)
        );
    }
}
