//! Pure state transition function for one alert instance

use chrono::{DateTime, Utc};

use crate::models::{
    AlertInstance, AlertRule, ErrorPolicy, EvaluationEntry, NoDataPolicy, NotificationKind, State,
    StateReason, Verdict,
};

/// What an evaluation entry means for an instance once the rule's policies are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Counts toward (or continues) a breach episode
    Breach(StateReason),
    /// Ends any breach episode
    Healthy(StateReason),
    /// Leave the state untouched
    Keep,
    /// Move to a dedicated side state
    Side(State, StateReason),
}

impl Outcome {
    /// Whether this outcome should create an instance that does not exist yet
    pub fn creates_instance(self) -> bool {
        matches!(self, Self::Breach(_) | Self::Side(..))
    }
}

/// Map a verdict through the rule's no-data and error policies
pub fn outcome(rule: &AlertRule, verdict: Verdict) -> Outcome {
    match verdict {
        Verdict::Alerting => Outcome::Breach(StateReason::Condition),
        Verdict::Normal => Outcome::Healthy(StateReason::Condition),
        Verdict::NoData => match rule.no_data_state {
            NoDataPolicy::Alerting => Outcome::Breach(StateReason::NoData),
            NoDataPolicy::Ok => Outcome::Healthy(StateReason::NoData),
            NoDataPolicy::KeepLast => Outcome::Keep,
            NoDataPolicy::NoData => Outcome::Side(State::NoData, StateReason::NoData),
        },
        Verdict::Error => match rule.exec_err_state {
            ErrorPolicy::Alerting => Outcome::Breach(StateReason::Error),
            ErrorPolicy::Ok => Outcome::Healthy(StateReason::Error),
            ErrorPolicy::KeepLast => Outcome::Keep,
            ErrorPolicy::Error => Outcome::Side(State::Error, StateReason::Error),
        },
    }
}

/// A state change that produces a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before
    pub from: State,
    /// State after
    pub to: State,
    /// Notification to emit
    pub kind: NotificationKind,
}

/// Advance `instance` with one evaluation entry.
///
/// Returns the transition when the change must be notified: entering a firing
/// state emits `Firing`, leaving a firing state (or abandoning a pending
/// breach) emits `Resolved`.
pub fn apply(
    instance: &mut AlertInstance,
    rule: &AlertRule,
    entry: &EvaluationEntry,
    at: DateTime<Utc>,
) -> Option<Transition> {
    instance.last_evaluated_at = at;
    instance.last_value = entry.value;
    instance.last_error = match entry.verdict {
        Verdict::Error => entry.error.clone(),
        _ => None,
    };

    step(instance, rule, outcome(rule, entry.verdict), at)
}

/// Resolve an instance whose series disappeared from the result
pub fn apply_missing(instance: &mut AlertInstance, rule: &AlertRule, at: DateTime<Utc>) -> Option<Transition> {
    instance.last_evaluated_at = at;
    instance.last_value = None;
    step(instance, rule, Outcome::Healthy(StateReason::MissingSeries), at)
}

fn step(
    instance: &mut AlertInstance,
    rule: &AlertRule,
    outcome: Outcome,
    at: DateTime<Utc>,
) -> Option<Transition> {
    let from = instance.state;

    let (to, reason) = match outcome {
        Outcome::Keep => return None,
        Outcome::Breach(reason) => {
            if from == State::Alerting {
                (State::Alerting, reason)
            } else {
                let started = *instance.first_breach_at.get_or_insert(at);
                let sustained = (at - started).to_std().unwrap_or_default();
                if sustained >= rule.for_duration {
                    (State::Alerting, reason)
                } else {
                    (State::Pending, reason)
                }
            }
        }
        Outcome::Healthy(reason) => {
            instance.first_breach_at = None;
            (State::Normal, reason)
        }
        Outcome::Side(state, reason) => {
            instance.first_breach_at = None;
            (state, reason)
        }
    };

    instance.state_reason = reason;
    if to == from {
        return None;
    }

    instance.state = to;
    instance.last_transition_at = at;
    if to == State::Normal {
        instance.resolved_at = Some(at);
    }

    let kind = if to.is_firing() {
        NotificationKind::Firing
    } else if from.is_firing() || (from == State::Pending && to == State::Normal) {
        NotificationKind::Resolved
    } else {
        return None;
    };

    Some(Transition { from, to, kind })
}
