//! The scenario controller: one reconciliation round per call.
//!
//! Each round rebuilds the child view from the store, settles the scenario
//! lifecycle, and advances the schedule by dispatching every action whose
//! dependencies are met. All waits become requeue outcomes; the round itself
//! never blocks.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use rig_core::config::ControllerConfig;
use rig_core::events::{Event, EventKind};
use rig_core::lifecycle::{ConditionType, Lifecycle, Phase};
use rig_core::types::{
    Action, ActionType, Component, JobObject, ObjectKind, Scenario, TriggerKind, TriggeredBy,
    LABEL_COMPONENT, LABEL_SCENARIO,
};

use crate::alerts::AlertSource;
use crate::classifier::Classifier;
use crate::clock::Clock;
use crate::exec::ExecChannel;
use crate::executors::{
    child_kind, construct_call, construct_cascade, construct_chaos, construct_cluster,
    construct_delete_marker, construct_service, construct_virtual_object,
};
use crate::expressions::parse_state_expr;
use crate::registry::ClientRegistry;
use crate::schedule::{schedule_decision, ScheduleDecision};
use crate::scheduler::next_logical_jobs;
use crate::store::{ObjectStore, Propagation, StoreError};
use crate::template::{RenderCache, Scheme, TemplateError, TemplateResolver};
use crate::validate::validate_plan;

/// Finalizer attached to every scenario so telemetry and alert
/// registrations drain before the object goes away.
pub const FINALIZER: &str = "rig.io/teardown";

/// What the caller does after a round: stop and wait for a watch event,
/// requeue immediately, or requeue at a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stop,
    Requeue,
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("scenario {scenario}: {source}")]
    Store {
        scenario: String,
        #[source]
        source: StoreError,
    },
}

/// Recorder for scenario events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<Event>>,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for MemoryEvents {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct ScenarioReconciler<'a> {
    pub store: &'a dyn ObjectStore,
    pub templates: &'a dyn TemplateResolver,
    pub exec: &'a dyn ExecChannel,
    pub alerts: &'a dyn AlertSource,
    pub clock: &'a dyn Clock,
    pub events: &'a dyn EventSink,
    pub clients: &'a ClientRegistry,
    pub config: &'a ControllerConfig,
}

impl ScenarioReconciler<'_> {
    pub fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let now = self.clock.now();

        // 1: load the scenario by key.
        let mut scenario = match self.store.get_scenario(name) {
            Ok(scenario) => scenario,
            Err(StoreError::NotFound { .. }) => return Ok(Outcome::Stop),
            Err(source) => {
                return Err(ReconcileError::Store {
                    scenario: name.to_string(),
                    source,
                })
            }
        };

        debug!(
            scenario = name,
            phase = ?scenario.status.lifecycle.phase,
            version = scenario.meta.resource_version,
            "-> reconcile"
        );

        // 2: finalizer bookkeeping.
        if !scenario.meta.deletion_requested && !scenario.meta.has_finalizer(FINALIZER) {
            scenario.meta.finalizers.push(FINALIZER.to_string());
            return self.write(&scenario, Outcome::Stop);
        }

        if scenario.meta.deletion_requested {
            return self.finalize(scenario, now);
        }

        // 3: rebuild the child view.
        let mut view = match self.view_of(&scenario) {
            Ok(view) => view,
            Err(source) => {
                // Transient listing failures are always retried.
                warn!(scenario = name, error = %source, "child listing failed");
                return Ok(Outcome::Requeue);
            }
        };

        // A dispatched child that is no longer observed was removed by a
        // managed deletion; it counts as completed, not as missing work.
        for (executed, _) in scenario.status.executed.iter() {
            if view.get_job(executed).is_some() {
                continue;
            }
            let kind = scenario
                .spec
                .action(executed)
                .and_then(|action| action.action)
                .map(child_kind)
                .unwrap_or(ObjectKind::VirtualObject);
            let mut ghost = JobObject::new(
                kind,
                rig_core::types::ObjectMeta::new(executed, name, scenario.meta.creation_time),
            );
            ghost.status.lifecycle =
                Lifecycle::new(Phase::Success, "ManagedDeletion", "removed by a delete action");
            view.classify(executed, ghost);
        }

        // 4: first-visit initialization.
        if !scenario
            .status
            .conditions
            .is_true(ConditionType::CrInitialized)
        {
            return self.initialize(scenario, now);
        }

        // 5: settle the lifecycle.
        if scenario.status.lifecycle.phase.is_terminal() {
            // Terminal rounds already ran their cleanup; nothing to do.
            return Ok(Outcome::Stop);
        }

        if let Some(outcome) = self.check_assertions(&mut scenario, &view, now)? {
            return Ok(outcome);
        }

        let total_jobs = scenario.spec.actions.len();
        let reduction = crate::reducer::grouped_jobs(
            total_jobs,
            &view,
            &scenario.status.lifecycle,
            None,
        );
        let mut lifecycle = reduction.lifecycle;
        if lifecycle.phase == Phase::Failed {
            // Surface the most specific child failure as the scenario reason.
            if let Some(job) = view
                .failed_jobs()
                .into_iter()
                .find(|job| job.status.lifecycle.reason == "MaxInstancesReached")
            {
                lifecycle.reason = "MaxInstancesReached".to_string();
                self.record(
                    name,
                    EventKind::MaxInstancesReached {
                        action: job.meta.label(rig_core::types::LABEL_CREATED_BY)
                            .unwrap_or(&job.meta.name)
                            .to_string(),
                        max: job.status.queued_jobs,
                    },
                    now,
                );
            }
        }

        let phase_before = scenario.status.lifecycle.phase;
        scenario.status.lifecycle.apply(lifecycle, now);
        if let Some(condition) = reduction.condition {
            scenario.status.conditions.set(
                condition,
                scenario.status.lifecycle.reason.clone(),
                scenario.status.lifecycle.message.clone(),
                now,
            );
        }

        // 6: terminal policies.
        match scenario.status.lifecycle.phase {
            Phase::Success => {
                info!(scenario = name, "scenario succeeded");
                self.record(name, EventKind::ScenarioSucceeded, now);
                for job in view.successful_jobs() {
                    self.delete_child(name, job, now);
                }
                return self.write(&scenario, Outcome::Stop);
            }
            Phase::Failed => {
                info!(
                    scenario = name,
                    reason = %scenario.status.lifecycle.reason,
                    "scenario failed"
                );
                self.record(
                    name,
                    EventKind::ScenarioFailed {
                        reason: scenario.status.lifecycle.reason.clone(),
                    },
                    now,
                );
                // Keep the failed children for the postmortem.
                for job in view.pending_jobs().into_iter().chain(view.running_jobs()) {
                    self.delete_child(name, job, now);
                }
                return self.write(&scenario, Outcome::Stop);
            }
            _ => {}
        }

        // 7: advance the schedule.
        if scenario.is_suspended() {
            debug!(scenario = name, "suspended; not spawning new jobs");
            return self.write(&scenario, Outcome::Stop);
        }

        let (ready, next_deadline) = {
            let plan = next_logical_jobs(
                scenario.meta.creation_time,
                &scenario.spec.actions,
                &view,
                &scenario.status.executed,
                now,
            );
            let ready: Vec<Action> = plan.ready.into_iter().cloned().collect();
            (ready, plan.next_deadline)
        };

        let mut dispatched = 0usize;
        let mut cron_wake: Option<DateTime<Utc>> = None;
        let mut cache = RenderCache::new();
        for action in &ready {
            match self.authorize(&scenario, action, &view, now) {
                Authorization::Fire(kind) => {
                    if let Some(outcome) =
                        self.dispatch(&mut scenario, action, kind, &mut cache, now)?
                    {
                        return Ok(outcome);
                    }
                    dispatched += 1;
                }
                Authorization::Sleep(until) => {
                    cron_wake = match (cron_wake, until) {
                        (Some(current), Some(next)) => Some(current.min(next)),
                        (current, next) => current.or(next),
                    };
                }
                Authorization::Misfire => {
                    self.record(
                        name,
                        EventKind::ScheduleMisfire {
                            action: action.name.clone(),
                        },
                        now,
                    );
                    scenario.status.lifecycle.apply(
                        Lifecycle::new(
                            Phase::Failed,
                            "SchedulingViolation",
                            format!("action [{}]: scheduling violation", action.name),
                        ),
                        now,
                    );
                    scenario.status.conditions.set(
                        ConditionType::JobUnexpectedTermination,
                        "SchedulingViolation",
                        "cron run missed past its starting deadline",
                        now,
                    );
                    return self.write(&scenario, Outcome::Stop);
                }
            }
        }

        // 8: one status write per round, then decide how to come back.
        let phase_changed = scenario.status.lifecycle.phase != phase_before;
        let outcome = if dispatched > 0 {
            Outcome::Requeue
        } else {
            let wake = match (next_deadline, cron_wake) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake {
                Some(at) => Outcome::RequeueAfter((at - now).to_std().unwrap_or_default()),
                None => Outcome::Stop,
            }
        };

        if dispatched > 0 || phase_changed {
            return self.write(&scenario, outcome);
        }
        debug!(scenario = name, ?outcome, "<- reconcile (no status change)");
        Ok(outcome)
    }

    fn initialize(&self, mut scenario: Scenario, now: DateTime<Utc>) -> Result<Outcome, ReconcileError> {
        let name = scenario.meta.name.clone();

        if let Err(err) = validate_plan(&name, &scenario.spec.actions, self.templates) {
            warn!(scenario = %name, error = %err, "plan validation failed");
            self.record(
                &name,
                EventKind::ValidationFailed {
                    reason: err.to_string(),
                },
                now,
            );
            scenario
                .status
                .lifecycle
                .apply(Lifecycle::new(Phase::Failed, "ValidationError", err.to_string()), now);
            scenario.status.conditions.set(
                ConditionType::JobUnexpectedTermination,
                "ValidationError",
                err.to_string(),
                now,
            );
            return self.write(&scenario, Outcome::Stop);
        }
        self.record(&name, EventKind::ScenarioValidated, now);

        // Register the metrics alerts declared by asserts and repeat
        // predicates; they are released in finalize.
        for action in &scenario.spec.actions {
            let exprs = [
                action.assert.as_ref().and_then(|a| a.metrics.as_deref()),
                action.until().and_then(|u| u.metrics.as_deref()),
            ];
            for expr in exprs.into_iter().flatten() {
                if let Ok(rule) = crate::expressions::parse_alert_expr(expr) {
                    self.alerts.set_alert(&format!("{name}/{}", action.name), rule);
                }
            }
        }

        if let Err(err) = self.install_telemetry(&mut scenario, now) {
            warn!(scenario = %name, error = %err, "telemetry overlay skipped");
        }

        scenario.status.conditions.set(
            ConditionType::CrInitialized,
            "ScenarioAccepted",
            "plan validated, starting execution",
            now,
        );
        scenario
            .status
            .lifecycle
            .apply(Lifecycle::new(Phase::Pending, "ScenarioAccepted", "received scenario"), now);
        self.write(&scenario, Outcome::Requeue)
    }

    /// Install the telemetry overlay iff a referenced template declares
    /// telemetry agents.
    fn install_telemetry(
        &self,
        scenario: &mut Scenario,
        now: DateTime<Utc>,
    ) -> Result<(), TemplateError> {
        let name = scenario.meta.name.clone();
        let mut wants_telemetry = false;

        for action in &scenario.spec.actions {
            let Some(template) = action.template_ref() else {
                continue;
            };
            let scheme = Scheme {
                scenario: name.clone(),
                instance: action.name.clone(),
                inputs: template.inputs.clone(),
            };
            match self.templates.resolve(&name, &template.name, &scheme) {
                Ok(rendered) if !rendered.telemetry.is_empty() => {
                    wants_telemetry = true;
                    break;
                }
                _ => {}
            }
        }

        if !wants_telemetry {
            return Ok(());
        }

        let overlay = [
            ("prometheus", &self.config.telemetry.prometheus_template),
            ("grafana", &self.config.telemetry.grafana_template),
            ("dataviewer", &self.config.telemetry.dataviewer_template),
        ];
        for (instance, template) in overlay {
            let scheme = Scheme {
                scenario: name.clone(),
                instance: instance.to_string(),
                inputs: BTreeMap::new(),
            };
            let rendered = self.templates.resolve(&name, template, &scheme)?;

            let mut job = JobObject::new(
                ObjectKind::Service,
                rig_core::types::ObjectMeta::new(instance, &name, now),
            );
            job.spec = rendered.spec;
            crate::store::set_controller_reference(scenario, &mut job, instance);
            job.meta.labels.insert(
                LABEL_COMPONENT.to_string(),
                Component::Sys.as_str().to_string(),
            );
            let _ = self.store.create_job_unless_exists(&job);
        }

        let endpoint = format!("http://grafana.{name}:3000");
        self.clients.get_or_create(&name, &endpoint);
        scenario.status.grafana_endpoint = Some(endpoint);
        self.record(&name, EventKind::TelemetryInstalled, now);
        Ok(())
    }

    fn finalize(&self, mut scenario: Scenario, now: DateTime<Utc>) -> Result<Outcome, ReconcileError> {
        let name = scenario.meta.name.clone();
        if !scenario.meta.has_finalizer(FINALIZER) {
            return Ok(Outcome::Stop);
        }

        info!(scenario = %name, "finalizing");

        // Tear down the telemetry overlay. Idempotent: children may already
        // be gone.
        let selector = BTreeMap::from([
            (LABEL_SCENARIO.to_string(), name.clone()),
            (LABEL_COMPONENT.to_string(), Component::Sys.as_str().to_string()),
        ]);
        if let Ok(overlay) = self.store.list_jobs(&name, &selector) {
            for job in overlay {
                let _ = self.store.delete_job(
                    &job.meta.namespace,
                    job.kind,
                    &job.meta.name,
                    Propagation::Background,
                );
            }
            self.record(&name, EventKind::TelemetryTornDown, now);
        }

        // Release alert and client registrations.
        for action in &scenario.spec.actions {
            self.alerts.unset_alert(&format!("{name}/{}", action.name));
        }
        self.clients.remove(&name);

        scenario.meta.finalizers.retain(|f| f != FINALIZER);
        self.write(&scenario, Outcome::Stop)
    }

    fn view_of(&self, scenario: &Scenario) -> Result<Classifier, StoreError> {
        let name = &scenario.meta.name;
        let selector = BTreeMap::from([(LABEL_SCENARIO.to_string(), name.clone())]);
        let children = self.store.list_jobs(name, &selector)?;

        let mut view = Classifier::new();
        for child in children {
            let owned = child
                .meta
                .owner
                .as_ref()
                .is_some_and(|owner| owner.kind == ObjectKind::Scenario && &owner.name == name);
            if !owned {
                continue;
            }
            // The telemetry overlay is system plumbing, not part of the plan.
            if child.meta.label(LABEL_COMPONENT) == Some(Component::Sys.as_str()) {
                continue;
            }
            let key = child.meta.name.clone();
            view.classify(&key, child);
        }
        Ok(view)
    }

    fn check_assertions(
        &self,
        scenario: &mut Scenario,
        view: &Classifier,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>, ReconcileError> {
        let name = scenario.meta.name.clone();

        let mut failure: Option<(String, String, String)> = None;
        for action in &scenario.spec.actions {
            if !scenario.status.executed.contains_key(&action.name) {
                continue;
            }
            let Some(assert) = action.assert.as_ref() else {
                continue;
            };
            if assert.is_zero() {
                continue;
            }

            if let Some(expr) = assert.state.as_deref() {
                match parse_state_expr(expr) {
                    Err(err) => {
                        failure = Some((
                            action.name.clone(),
                            "StateQueryError".to_string(),
                            err.to_string(),
                        ));
                        break;
                    }
                    Ok(parsed) => {
                        let eval = parsed.eval(view);
                        if eval.fired {
                            failure = Some((
                                action.name.clone(),
                                "AssertionError".to_string(),
                                eval.info,
                            ));
                            break;
                        }
                    }
                }
            }

            if assert.metrics.is_some() {
                let (info, fired) = self.alerts.fired_alert(&format!("{name}/{}", action.name));
                if fired {
                    failure = Some((action.name.clone(), "AssertionError".to_string(), info));
                    break;
                }
            }
        }

        let Some((action, reason, info)) = failure else {
            return Ok(None);
        };

        self.record(
            &name,
            EventKind::AssertionFired {
                action: action.clone(),
                info: info.clone(),
            },
            now,
        );
        // Same terminal policy as a reduced failure: keep the failed
        // children, collect the rest.
        for job in view.pending_jobs().into_iter().chain(view.running_jobs()) {
            self.delete_child(&name, job, now);
        }
        scenario.status.lifecycle.apply(
            Lifecycle::new(Phase::Failed, reason.clone(), format!("action [{action}]: {info}")),
            now,
        );
        scenario
            .status
            .conditions
            .set(ConditionType::AssertionError, reason, info, now);
        self.write(scenario, Outcome::Stop).map(Some)
    }

    fn authorize(
        &self,
        scenario: &Scenario,
        action: &Action,
        view: &Classifier,
        now: DateTime<Utc>,
    ) -> Authorization {
        let Some(schedule) = action.schedule.as_ref() else {
            return Authorization::Fire(TriggerKind::Dependencies);
        };

        // Event-based authorization stands on its own; if both are present,
        // either path suffices.
        if let Some(event) = schedule.event.as_deref() {
            if let Ok(parsed) = parse_state_expr(event) {
                if parsed.eval(view).fired {
                    return Authorization::Fire(TriggerKind::Event);
                }
            }
        }

        if schedule.cron.is_none() {
            return Authorization::Sleep(None);
        }

        match schedule_decision(
            scenario.meta.creation_time,
            scenario.status.last_schedule_time,
            schedule,
            now,
        ) {
            Ok(ScheduleDecision::Fire { .. }) => Authorization::Fire(TriggerKind::Cron),
            Ok(ScheduleDecision::Sleep { until }) => Authorization::Sleep(until),
            Ok(ScheduleDecision::Misfire { .. }) => Authorization::Misfire,
            Err(_) => Authorization::Misfire,
        }
    }

    /// Dispatch one ready action. Returns an outcome only when dispatch
    /// terminates the round (construction failure is terminal).
    fn dispatch(
        &self,
        scenario: &mut Scenario,
        action: &Action,
        trigger: TriggerKind,
        cache: &mut RenderCache,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>, ReconcileError> {
        let name = scenario.meta.name.clone();

        let constructed = match action.action {
            Some(ActionType::Service) => {
                construct_service(scenario, action, self.templates, cache, now).map(Some)
            }
            Some(ActionType::Cluster) => {
                construct_cluster(scenario, action, self.templates, cache, now).map(Some)
            }
            Some(ActionType::Chaos) => {
                construct_chaos(scenario, action, self.templates, cache, now).map(Some)
            }
            Some(ActionType::Cascade) => {
                construct_cascade(scenario, action, self.templates, cache, now).map(Some)
            }
            Some(ActionType::Call) => construct_call(scenario, action, now).map(Some),
            Some(ActionType::VirtualObject) => {
                construct_virtual_object(scenario, action, now).map(Some)
            }
            Some(ActionType::Delete) => self.run_delete(scenario, action, now).map(Some),
            None => Ok(None),
        };

        let job = match constructed {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(err) => {
                // Template and construction failures are structural: the
                // action can never start, so the scenario fails now.
                warn!(scenario = %name, action = %action.name, error = %err, "dispatch failed");
                scenario
                    .status
                    .lifecycle
                    .apply(Lifecycle::new(Phase::Failed, "TemplateError", err.to_string()), now);
                scenario.status.conditions.set(
                    ConditionType::JobUnexpectedTermination,
                    "TemplateError",
                    err.to_string(),
                    now,
                );
                return self.write(scenario, Outcome::Stop).map(Some);
            }
        };

        if let Err(source) = self.store.create_job_unless_exists(&job) {
            if source.is_transient() {
                return Ok(Some(Outcome::RequeueAfter(
                    self.config.timeouts.conflict_backoff,
                )));
            }
            return Err(ReconcileError::Store {
                scenario: name,
                source,
            });
        }

        info!(scenario = %name, action = %action.name, kind = job.kind.as_str(), "dispatched");
        self.record(
            &name,
            EventKind::ActionDispatched {
                action: action.name.clone(),
            },
            now,
        );

        scenario.status.executed.insert(
            action.name.clone(),
            TriggeredBy { kind: trigger, at: now },
        );
        scenario.status.scheduled_jobs += 1;
        scenario.status.last_schedule_time = Some(now);
        Ok(None)
    }

    /// Flip every target into the managed Chaos phase, then remove it in the
    /// background, and author the completion marker.
    fn run_delete(
        &self,
        scenario: &Scenario,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<JobObject, crate::executors::ExecuteError> {
        let name = &scenario.meta.name;
        let mut deleted = Vec::new();

        if let Some(spec) = action.delete.as_ref() {
            for target in &spec.jobs {
                let kind = scenario
                    .spec
                    .action(target)
                    .and_then(|a| a.action)
                    .map(child_kind)
                    .unwrap_or(ObjectKind::Service);

                match self.store.get_job(name, kind, target) {
                    Ok(mut job) => {
                        // The Chaos phase tells the child's controller this
                        // termination is managed, not a failure.
                        job.status.lifecycle.apply(
                            Lifecycle::new(Phase::Chaos, "ManagedDeletion", "deleted by plan"),
                            now,
                        );
                        let _ = self.store.update_job_status(&job);
                        let _ = self.store.delete_job(name, kind, target, Propagation::Background);
                        self.record(
                            name,
                            EventKind::ChildDeleted {
                                child: target.clone(),
                            },
                            now,
                        );
                        deleted.push(target.clone());
                    }
                    Err(_) => {
                        debug!(scenario = %name, target = %target, "delete target already gone");
                    }
                }
            }
        }

        Ok(construct_delete_marker(scenario, action, &deleted, now))
    }

    fn delete_child(&self, scenario: &str, job: &JobObject, now: DateTime<Utc>) {
        let result = self.store.delete_job(
            &job.meta.namespace,
            job.kind,
            &job.meta.name,
            Propagation::Background,
        );
        if result.is_ok() {
            self.record(
                scenario,
                EventKind::ChildDeleted {
                    child: job.meta.name.clone(),
                },
                now,
            );
        }
    }

    fn record(&self, scenario: &str, kind: EventKind, at: DateTime<Utc>) {
        self.events.record(Event {
            scenario: scenario.to_string(),
            at,
            kind,
        });
    }

    /// Single status write per round. A conflict requeues quietly: the next
    /// round rebuilds everything from the store.
    fn write(&self, scenario: &Scenario, outcome: Outcome) -> Result<Outcome, ReconcileError> {
        match self.store.update_scenario_status(scenario) {
            Ok(_) => Ok(outcome),
            Err(source) if source.is_transient() => {
                Ok(Outcome::RequeueAfter(self.config.timeouts.conflict_backoff))
            }
            Err(source) => Err(ReconcileError::Store {
                scenario: scenario.meta.name.clone(),
                source,
            }),
        }
    }
}

enum Authorization {
    Fire(TriggerKind),
    Sleep(Option<DateTime<Utc>>),
    Misfire,
}
