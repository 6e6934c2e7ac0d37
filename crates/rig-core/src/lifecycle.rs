//! Lifecycle phases and conditions shared by scenarios and their children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a scenario, action, or child job.
///
/// The valid transitions form a DAG:
/// Uninitialized -> (Pending)* -> (Running)* -> (Success | Failed).
/// Chaos is a managed-abnormal phase entered by deletion targets so their
/// controllers do not count the tear-down as a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    Pending,
    Running,
    Success,
    Failed,
    Chaos,
}

impl Phase {
    /// Returns true if the phase is terminal. Terminal phases are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Success | Phase::Failed)
    }

    /// Returns true if the phase counts as actively running. Chaos is a
    /// managed condition, so it counts as running rather than failed.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Running | Phase::Chaos)
    }

    pub fn is(&self, candidates: &[Phase]) -> bool {
        candidates.contains(self)
    }
}

pub fn is_transition_allowed(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Uninitialized, Pending | Running | Failed) => true,
        (Pending, Running | Success | Failed | Chaos) => true,
        (Running, Success | Failed | Chaos) => true,
        (Chaos, Success | Failed) => true,
        _ => false,
    }
}

/// Observed lifecycle of an object: phase plus the reason it got there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Lifecycle {
    pub fn new(phase: Phase, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
            message: message.into(),
            start_time: None,
            end_time: None,
        }
    }

    /// Apply a new lifecycle, keeping the original start time and stamping
    /// the end time when a terminal phase is entered.
    pub fn apply(&mut self, next: Lifecycle, at: DateTime<Utc>) {
        if self.phase.is_terminal() {
            return;
        }

        if self.start_time.is_none() && next.phase != Phase::Uninitialized {
            self.start_time = Some(at);
        }

        let start = self.start_time;
        *self = next;
        self.start_time = start.or(Some(at));

        if self.phase.is_terminal() {
            self.end_time = Some(at);
        }
    }
}

/// Condition types recorded on a scenario or group object status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    CrInitialized,
    AllJobsAreScheduled,
    AllJobsAreCompleted,
    JobUnexpectedTermination,
    AssertionError,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::CrInitialized => "CrInitialized",
            ConditionType::AllJobsAreScheduled => "AllJobsAreScheduled",
            ConditionType::AllJobsAreCompleted => "AllJobsAreCompleted",
            ConditionType::JobUnexpectedTermination => "JobUnexpectedTermination",
            ConditionType::AssertionError => "AssertionError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Set-once condition list. Conditions are monotonic: once a type is true it
/// stays true, and later writes for the same type are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn set(
        &mut self,
        condition_type: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        if self.is_true(condition_type) {
            return;
        }

        self.0.push(Condition {
            condition_type,
            status: true,
            reason: reason.into(),
            message: message.into(),
            at,
        });
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.0
            .iter()
            .any(|c| c.condition_type == condition_type && c.status)
    }

    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }
}
