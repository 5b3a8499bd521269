//! Failure tracking and escalation for feedmon.

pub mod escalation;
pub mod tracker;

pub use escalation::{format_failure_duration, EscalationHandler, EscalationOutcome};
pub use tracker::{failure_window, EscalationMessage, FailureDecision, FailureTracker};
