//! Core types for the scenario testbed: the declarative plan and the objects
//! the controllers materialize from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::lifecycle::{Conditions, Lifecycle};

/// Labels authored on every child object.
pub const LABEL_SCENARIO: &str = "scenario";
pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_CREATED_BY: &str = "created-by";
pub const LABEL_INSTANCE: &str = "instance";
pub const LABEL_OWNER: &str = "owner";

/// Components are either part of the testbed itself (SYS) or part of the
/// system under test (SUT). SYS components are excluded from failure
/// accounting and from sidecar classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    Sys,
    Sut,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sys => "SYS",
            Component::Sut => "SUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Service,
    Cluster,
    Chaos,
    Cascade,
    Call,
    Delete,
    VirtualObject,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Service => "Service",
            ActionType::Cluster => "Cluster",
            ActionType::Chaos => "Chaos",
            ActionType::Cascade => "Cascade",
            ActionType::Call => "Call",
            ActionType::Delete => "Delete",
            ActionType::VirtualObject => "VirtualObject",
        }
    }
}

/// Reference to a stored template, optionally parameterized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

impl TemplateRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }
}

/// Dependencies of an action on other actions and on logical time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running: Vec<String>,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub after: Option<Duration>,
}

/// Fail-on predicate attached to an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
}

impl AssertSpec {
    pub fn is_zero(&self) -> bool {
        self.state.is_none() && self.metrics.is_none()
    }

    pub fn has_state_expr(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_metrics_expr(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Repeat-while predicate: the action re-fires until the condition fires or
/// the instance budget is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UntilSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<usize>,
}

impl UntilSpec {
    pub fn is_zero(&self) -> bool {
        self.state.is_none() && self.metrics.is_none()
    }
}

/// Time- or event-based firing authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<u64>,
}

/// Tolerance to partial failures of a grouped action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TolerateSpec {
    #[serde(default)]
    pub failed_jobs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub from_template: TemplateRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub from_template: TemplateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerate: Option<TolerateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UntilSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    Network,
    Pod,
    Io,
    Kernel,
    Time,
}

impl FaultType {
    /// The external fault kind materialized for this fault.
    pub fn kind(&self) -> &'static str {
        match self {
            FaultType::Network => "NetworkChaos",
            FaultType::Pod => "PodChaos",
            FaultType::Io => "IOChaos",
            FaultType::Kernel => "KernelChaos",
            FaultType::Time => "TimeChaos",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosSpec {
    pub fault: FaultType,
    pub from_template: TemplateRef,
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeSpec {
    pub fault: FaultType,
    pub from_template: TemplateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
}

impl Default for FaultType {
    fn default() -> Self {
        FaultType::Pod
    }
}

/// Expected output of a remote call, matched as regular expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSpec {
    /// Name of the callable declared by the target service template.
    pub callable: String,
    /// Target service instances, one call instance per entry.
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<MatchOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerate: Option<TolerateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UntilSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSpec {
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualObjectSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// One scheduling unit of a scenario plan. Exactly one embedded spec must be
/// present, and it must match `action`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub name: String,
    pub action: Option<ActionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<WaitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<AssertSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UntilSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerate: Option<TolerateSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade: Option<CascadeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<DeleteSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_object: Option<VirtualObjectSpec>,
}

impl Action {
    /// Returns true if the embedded spec matching `action` is present.
    pub fn has_matching_spec(&self) -> bool {
        match self.action {
            Some(ActionType::Service) => self.service.is_some(),
            Some(ActionType::Cluster) => self.cluster.is_some(),
            Some(ActionType::Chaos) => self.chaos.is_some(),
            Some(ActionType::Cascade) => self.cascade.is_some(),
            Some(ActionType::Call) => self.call.is_some(),
            Some(ActionType::Delete) => self.delete.is_some(),
            Some(ActionType::VirtualObject) => self.virtual_object.is_some(),
            None => false,
        }
    }

    /// Number of embedded specs present, regardless of the declared type.
    pub fn embedded_spec_count(&self) -> usize {
        [
            self.service.is_some(),
            self.cluster.is_some(),
            self.chaos.is_some(),
            self.cascade.is_some(),
            self.call.is_some(),
            self.delete.is_some(),
            self.virtual_object.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// The template reference this action resolves, if its type carries one.
    pub fn template_ref(&self) -> Option<&TemplateRef> {
        match self.action? {
            ActionType::Service => self.service.as_ref().map(|s| &s.from_template),
            ActionType::Cluster => self.cluster.as_ref().map(|s| &s.from_template),
            ActionType::Chaos => self.chaos.as_ref().map(|s| &s.from_template),
            ActionType::Cascade => self.cascade.as_ref().map(|s| &s.from_template),
            ActionType::Call | ActionType::Delete | ActionType::VirtualObject => None,
        }
    }

    /// The repeat-while predicate, regardless of where the manifest put it.
    pub fn until(&self) -> Option<&UntilSpec> {
        self.until
            .as_ref()
            .or_else(|| self.cluster.as_ref().and_then(|c| c.until.as_ref()))
            .or_else(|| self.call.as_ref().and_then(|c| c.until.as_ref()))
    }

    /// The failure tolerance, regardless of where the manifest put it.
    pub fn tolerate(&self) -> Option<&TolerateSpec> {
        self.tolerate
            .as_ref()
            .or_else(|| self.cluster.as_ref().and_then(|c| c.tolerate.as_ref()))
            .or_else(|| self.call.as_ref().and_then(|c| c.tolerate.as_ref()))
    }

    /// Maximum number of instances an until-bearing action may fire.
    pub fn max_instances(&self) -> Option<usize> {
        if let Some(until) = self.until() {
            if let Some(max) = until.max_instances {
                return Some(max);
            }
        }

        match self.action? {
            ActionType::Call => self.call.as_ref().map(|c| c.services.len()),
            ActionType::Cluster => self.cluster.as_ref().and_then(|c| c.instances),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDataSpec {
    pub claim_name: String,
}

/// Hints for exposing the telemetry stack outside the testbed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub use_ambassador: bool,
}

/// The declarative test plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_data: Option<TestDataSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_monitors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

impl ScenarioSpec {
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// What authorized the dispatch of an executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    Dependencies,
    Cron,
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredBy {
    pub kind: TriggerKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStatus {
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub conditions: Conditions,
    /// Journal of dispatched actions, written before the dispatch itself so
    /// a replayed reconcile does not double-create.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub executed: BTreeMap<String, TriggeredBy>,
    #[serde(default)]
    pub scheduled_jobs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana_endpoint: Option<String>,
}

/// Kinds of objects kept in the control-plane store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Scenario,
    Service,
    Cluster,
    Chaos,
    Cascade,
    Call,
    VirtualObject,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Scenario => "Scenario",
            ObjectKind::Service => "Service",
            ObjectKind::Cluster => "Cluster",
            ObjectKind::Chaos => "Chaos",
            ObjectKind::Cascade => "Cascade",
            ObjectKind::Call => "Call",
            ObjectKind::VirtualObject => "VirtualObject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub kind: ObjectKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// The scenario name doubles as the namespace of everything it owns.
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_requested: bool,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            owner: None,
            finalizers: Vec::new(),
            deletion_requested: false,
            creation_time: at,
            resource_version: 0,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub conditions: Conditions,
    /// Number of job instances prepared by a list-generator action.
    #[serde(default)]
    pub queued_jobs: usize,
    /// Index of the last dispatched instance; -1 before the first one.
    #[serde(default = "default_scheduled_jobs")]
    pub scheduled_jobs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    /// Captured output for call and virtual objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

fn default_scheduled_jobs() -> i64 {
    -1
}

/// A child object owned by a scenario action. The typed payload is kept as a
/// JSON document: child controllers, not the scenario, interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobObject {
    pub kind: ObjectKind,
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: JobStatus,
}

impl JobObject {
    pub fn new(kind: ObjectKind, meta: ObjectMeta) -> Self {
        Self {
            kind,
            meta,
            spec: serde_json::Value::Null,
            status: JobStatus {
                scheduled_jobs: -1,
                ..JobStatus::default()
            },
        }
    }
}

/// The top-level test plan object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub meta: ObjectMeta,
    pub spec: ScenarioSpec,
    #[serde(default)]
    pub status: ScenarioStatus,
}

impl Scenario {
    pub fn new(meta: ObjectMeta, spec: ScenarioSpec) -> Self {
        Self {
            meta,
            spec,
            status: ScenarioStatus::default(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }
}
