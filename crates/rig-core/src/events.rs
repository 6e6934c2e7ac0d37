//! Events recorded while a scenario executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The plan passed static validation.
    ScenarioValidated,
    /// The plan failed static validation; the scenario never starts.
    ValidationFailed { reason: String },
    /// An action was dispatched to its executor.
    ActionDispatched { action: String },
    /// A fail-on predicate fired.
    AssertionFired { action: String, info: String },
    /// A cron run was missed past its starting deadline.
    ScheduleMisfire { action: String },
    /// A repeat-while predicate fired; no further instances are spawned.
    UntilSatisfied { action: String, info: String },
    /// A repeat-while action exhausted its instance budget.
    MaxInstancesReached { action: String, max: usize },
    /// The telemetry overlay was installed.
    TelemetryInstalled,
    /// The telemetry overlay was torn down during finalization.
    TelemetryTornDown,
    /// A child object was removed by a terminal-phase policy or a delete job.
    ChildDeleted { child: String },
    ScenarioSucceeded,
    ScenarioFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub scenario: String,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}
