//! State machine variants and the policy flags that separate them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SchedulerError;

/// Which transition function drives a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMachineKind {
    /// Re-arms with fresh work while the period is open, then runs a final pass.
    Continuous,
    /// One unit of work per period; finalizes once dependencies are satisfied.
    Discrete,
    /// Discrete without noop mapping and without job status publication.
    SimplifiedDiscrete,
    /// Drives freerun schedulables outside the timetable.
    Freerun,
}

/// Behavioral switches for the shared transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Once the period is closed, dispatch a last unit of work and wait in `final_run`.
    pub uses_final_run: bool,
    /// A `noop` unit of work finalizes the job as `noop`.
    pub noop_uow_finalizes: bool,
    /// Publish a completion event to `q_job_status` when the job finishes.
    pub publish_job_status: bool,
}

impl StateMachineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateMachineKind::Continuous => "continuous",
            StateMachineKind::Discrete => "discrete",
            StateMachineKind::SimplifiedDiscrete => "simplified_discrete",
            StateMachineKind::Freerun => "freerun",
        }
    }

    /// Whether the machine may run on a timeperiod that is still open.
    ///
    /// Processes answering true self-trigger and are never woken by dependency broadcasts.
    pub fn run_on_active_timeperiod(&self) -> bool {
        match self {
            StateMachineKind::Continuous | StateMachineKind::Freerun => true,
            StateMachineKind::Discrete | StateMachineKind::SimplifiedDiscrete => false,
        }
    }

    pub fn policy(&self) -> TransitionPolicy {
        match self {
            StateMachineKind::Continuous => TransitionPolicy {
                uses_final_run: true,
                noop_uow_finalizes: false,
                publish_job_status: true,
            },
            StateMachineKind::Discrete => TransitionPolicy {
                uses_final_run: false,
                noop_uow_finalizes: true,
                publish_job_status: true,
            },
            StateMachineKind::SimplifiedDiscrete | StateMachineKind::Freerun => TransitionPolicy {
                uses_final_run: false,
                noop_uow_finalizes: false,
                publish_job_status: false,
            },
        }
    }

    /// Machines that can drive a timetable process
    pub fn is_managed(&self) -> bool {
        !matches!(self, StateMachineKind::Freerun)
    }
}

impl fmt::Display for StateMachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateMachineKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous" => Ok(StateMachineKind::Continuous),
            "discrete" => Ok(StateMachineKind::Discrete),
            "simplified_discrete" => Ok(StateMachineKind::SimplifiedDiscrete),
            "freerun" => Ok(StateMachineKind::Freerun),
            other => Err(SchedulerError::InvalidConfig(format!("unknown state machine: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "simplified_discrete".parse::<StateMachineKind>().unwrap(),
            StateMachineKind::SimplifiedDiscrete
        );
        assert!("batch".parse::<StateMachineKind>().is_err());
    }

    #[test]
    fn test_run_on_active_defaults() {
        assert!(StateMachineKind::Continuous.run_on_active_timeperiod());
        assert!(StateMachineKind::Freerun.run_on_active_timeperiod());
        assert!(!StateMachineKind::Discrete.run_on_active_timeperiod());
        assert!(!StateMachineKind::SimplifiedDiscrete.run_on_active_timeperiod());
    }

    #[test]
    fn test_discrete_and_simplified_policies_differ() {
        let discrete = StateMachineKind::Discrete.policy();
        let simplified = StateMachineKind::SimplifiedDiscrete.policy();
        assert!(discrete.noop_uow_finalizes && !simplified.noop_uow_finalizes);
        assert!(discrete.publish_job_status && !simplified.publish_job_status);
        assert!(!discrete.uses_final_run && !simplified.uses_final_run);
        assert!(StateMachineKind::Continuous.policy().uses_final_run);
    }
}
