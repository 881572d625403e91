//! State machines
//!
//! Every managed process is driven by one `StateMachine` executor; the process's
//! `StateMachineKind` selects the policy the shared transition function runs with.
//! Freerun schedulables have their own machine.

mod freerun;
mod kind;
mod managed;
mod transition;

pub use freerun::FreerunStateMachine;
pub use kind::{StateMachineKind, TransitionPolicy};
pub use managed::StateMachine;
pub use transition::{Transition, TransitionInput, decide, decide_notification};
