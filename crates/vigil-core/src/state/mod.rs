//! Alert instance state tracking

pub mod machine;
mod manager;

pub use machine::{Outcome, Transition};
pub use manager::{StateManager, ALERTNAME_LABEL, RULE_UID_LABEL};
