//! Lifecycle calculation for group objects (clusters, calls, cascades).
//!
//! A group owns a pool of job instances. Without a repeat predicate the
//! group completes when its expected jobs do. With one, instances are spawned
//! until the predicate fires; the instance budget bounds the experiment so a
//! test that never converges fails instead of spinning forever.

use std::collections::BTreeMap;

use rig_core::lifecycle::{ConditionType, Lifecycle, Phase};
use rig_core::types::{JobObject, JobStatus, ObjectKind, ObjectMeta, TolerateSpec};

use crate::classifier::{Classifier, ClassifierReader};
use crate::clock::Clock;
use crate::exec::ExecChannel;
use crate::executors::{run_call_instance, CallInstance, GroupJobsSpec};
use crate::expressions::{parse_state_expr, Evaluation};
use crate::reconciler::Outcome;
use crate::reducer::{grouped_jobs, Reduction};
use crate::schedule::{schedule_decision, ScheduleDecision};
use crate::store::{ObjectStore, Propagation, StoreError};
use crate::alerts::AlertSource;

#[derive(Debug, Clone)]
pub struct GroupArgs<'a> {
    pub status: &'a JobStatus,
    /// Expected number of job instances when no repeat predicate is set.
    pub total_jobs: usize,
    /// Instance budget for a repeat predicate; None means unbounded.
    pub max_jobs: Option<usize>,
    /// Evaluation of the repeat predicate against the current view, when the
    /// group carries one.
    pub until: Option<Evaluation>,
    pub tolerate: Option<TolerateSpec>,
}

/// Status changes the caller applies to the group object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUpdate {
    pub changed: bool,
    pub lifecycle: Lifecycle,
    pub set_condition: Option<(ConditionType, String, String)>,
    pub suspend: bool,
}

impl GroupUpdate {
    fn unchanged(status: &JobStatus) -> Self {
        Self {
            changed: false,
            lifecycle: status.lifecycle.clone(),
            set_condition: None,
            suspend: false,
        }
    }

    fn from_reduction(reduction: Reduction) -> Self {
        let set_condition = reduction.condition.map(|condition| {
            (
                condition,
                reduction.lifecycle.reason.clone(),
                reduction.lifecycle.message.clone(),
            )
        });
        Self {
            changed: true,
            lifecycle: reduction.lifecycle,
            set_condition,
            suspend: false,
        }
    }
}

pub fn calculate_group_lifecycle(args: GroupArgs<'_>, view: &dyn ClassifierReader) -> GroupUpdate {
    let status = args.status;

    // Uninitialized groups are still constructing their job list; terminal
    // groups are settled.
    if status
        .lifecycle
        .phase
        .is(&[Phase::Uninitialized, Phase::Success, Phase::Failed])
    {
        return GroupUpdate::unchanged(status);
    }

    let dispatched = (status.scheduled_jobs + 1).max(0) as usize;

    if let Some(until) = args.until {
        if status
            .conditions
            .is_true(ConditionType::AllJobsAreScheduled)
        {
            // The predicate already fired; from here on the lifecycle tracks
            // the progress of the instances spawned so far.
            return GroupUpdate::from_reduction(grouped_jobs(
                dispatched,
                view,
                &status.lifecycle,
                args.tolerate,
            ));
        }

        if until.fired {
            return GroupUpdate {
                changed: true,
                lifecycle: Lifecycle::new(Phase::Running, "UntilCondition", until.info.clone()),
                set_condition: Some((
                    ConditionType::AllJobsAreScheduled,
                    "UntilCondition".to_string(),
                    until.info,
                )),
                suspend: true,
            };
        }

        if let Some(max) = args.max_jobs {
            if max > 0 && dispatched >= max {
                let message = format!(
                    "reached max instances ({max}) before the until condition was met; \
                     aborting the experiment as too flaky to accept"
                );
                return GroupUpdate {
                    changed: true,
                    lifecycle: Lifecycle::new(Phase::Failed, "MaxInstancesReached", message.clone()),
                    set_condition: Some((
                        ConditionType::JobUnexpectedTermination,
                        "MaxInstancesReached".to_string(),
                        message,
                    )),
                    suspend: true,
                };
            }
        }

        // Instances are reused as a pool until the predicate fires.
        return GroupUpdate {
            changed: true,
            lifecycle: Lifecycle::new(
                Phase::Pending,
                "SpawnUntilEvent",
                "the until condition is not yet satisfied",
            ),
            set_condition: None,
            suspend: false,
        };
    }

    GroupUpdate::from_reduction(grouped_jobs(
        args.total_jobs,
        view,
        &status.lifecycle,
        args.tolerate,
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("group {name}: bad job payload: {source}")]
    Payload {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One reconciliation round of a group object (cluster, call, or cascade).
///
/// Mirrors the scenario round at a smaller scale: classify owned instances,
/// settle the lifecycle, then dispatch the next instance if one is due.
pub struct GroupController<'a> {
    pub store: &'a dyn ObjectStore,
    pub exec: &'a dyn ExecChannel,
    pub alerts: &'a dyn AlertSource,
    pub clock: &'a dyn Clock,
}

impl GroupController<'_> {
    pub fn reconcile(
        &self,
        namespace: &str,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Outcome, GroupError> {
        let now = self.clock.now();

        let mut group = match self.store.get_job(namespace, kind, name) {
            Ok(group) => group,
            Err(StoreError::NotFound { .. }) => return Ok(Outcome::Stop),
            Err(err) => return Err(err.into()),
        };

        // Terminal groups already ran their cleanup round.
        if group.status.lifecycle.phase.is_terminal() {
            return Ok(Outcome::Stop);
        }

        let payload: GroupJobsSpec =
            serde_json::from_value(group.spec.clone()).map_err(|source| GroupError::Payload {
                name: name.to_string(),
                source,
            })?;

        let view = self.view_of(&group)?;

        if group.status.lifecycle.phase == Phase::Uninitialized {
            group.status.lifecycle.apply(
                Lifecycle::new(Phase::Pending, "JobPending", "submitting job requests"),
                now,
            );
            return self.write_status(group);
        }

        // Either path authorizes the repeat predicate: state or metrics.
        let until_eval = match payload.until.as_ref() {
            None => None,
            Some(until) => {
                let state_eval = match until.state.as_deref() {
                    None => None,
                    Some(expr) => match parse_state_expr(expr) {
                        Ok(parsed) => Some(parsed.eval(&view)),
                        Err(err) => {
                            return self.fail(group, "StateQueryError", err.to_string(), now);
                        }
                    },
                };
                let metrics_eval = until.metrics.as_ref().map(|_| {
                    let owner = format!("{namespace}/{name}");
                    let (info, fired) = self.alerts.fired_alert(&owner);
                    Evaluation { info, fired }
                });

                let fired = [&state_eval, &metrics_eval]
                    .into_iter()
                    .flatten()
                    .find(|eval| eval.fired);
                Some(match fired {
                    Some(eval) => eval.clone(),
                    None => state_eval.or(metrics_eval).unwrap_or(Evaluation {
                        info: "no predicate".to_string(),
                        fired: false,
                    }),
                })
            }
        };

        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &group.status,
                total_jobs: payload.jobs.len(),
                max_jobs: payload.max_instances.or(Some(payload.jobs.len())),
                until: until_eval,
                tolerate: payload.tolerate,
            },
            &view,
        );

        let mut suspended = payload.suspend.unwrap_or(false);
        if update.changed {
            group.status.lifecycle = update.lifecycle.clone();
            if let Some((condition, reason, message)) = update.set_condition.clone() {
                group.status.conditions.set(condition, reason, message, now);
            }
            if update.suspend {
                suspended = true;
                group = self.suspend_spec(group, payload.clone())?;
            }
        }

        if group.status.lifecycle.phase == Phase::Success {
            for job in view.successful_jobs() {
                self.delete_child(job)?;
            }
            return self.write_status(group).map(|_| Outcome::Stop);
        }

        if group.status.lifecycle.phase == Phase::Failed {
            // Keep failed instances for the postmortem.
            for job in view.pending_jobs().into_iter().chain(view.running_jobs()) {
                self.delete_child(job)?;
            }
            return self.write_status(group).map(|_| Outcome::Stop);
        }

        let outcome = self.write_status_keep(&mut group)?;
        if let Some(outcome) = outcome {
            return Ok(outcome);
        }

        if suspended {
            return Ok(Outcome::Stop);
        }

        if group.status.lifecycle.phase == Phase::Running {
            return Ok(Outcome::Stop);
        }

        let next_expected = group.status.scheduled_jobs + 1;
        if payload.until.is_none() && next_expected >= payload.jobs.len() as i64 {
            return Ok(Outcome::Stop);
        }
        if payload.jobs.is_empty() {
            return Ok(Outcome::Stop);
        }

        if let Some(schedule) = payload.schedule.as_ref() {
            match schedule_decision(
                group.meta.creation_time,
                group.status.last_schedule_time,
                schedule,
                now,
            ) {
                Ok(ScheduleDecision::Fire { .. }) => {}
                Ok(ScheduleDecision::Sleep { until: Some(next) }) => {
                    let wait = (next - now).to_std().unwrap_or_default();
                    return Ok(Outcome::RequeueAfter(wait));
                }
                Ok(ScheduleDecision::Sleep { until: None }) => return Ok(Outcome::Stop),
                Ok(ScheduleDecision::Misfire { .. }) => {
                    return self
                        .fail(group, "SchedulingViolation", "scheduling violation".to_string(), now)
                        .map(|_| Outcome::Stop);
                }
                Err(err) => {
                    return self
                        .fail(group, "SchedulingViolation", err.to_string(), now)
                        .map(|_| Outcome::Stop);
                }
            }
        }

        // Queued instances are reused as a pool under a repeat predicate.
        let slot = (next_expected as usize) % payload.jobs.len();
        let queued = &payload.jobs[slot];
        let instance_name = format!("{name}-{next_expected}");

        let mut child = match payload.job_kind {
            ObjectKind::VirtualObject => {
                let call: CallInstance = serde_json::from_value(queued.spec.clone()).map_err(
                    |source| GroupError::Payload {
                        name: name.to_string(),
                        source,
                    },
                )?;
                let (lifecycle, stdout, stderr) =
                    run_call_instance(namespace, &call, self.exec, now);
                let mut child = JobObject::new(
                    ObjectKind::VirtualObject,
                    ObjectMeta::new(&instance_name, namespace, now),
                );
                child.spec = queued.spec.clone();
                child.status.lifecycle = lifecycle;
                child.status.stdout = Some(stdout);
                child.status.stderr = Some(stderr);
                child
            }
            job_kind => {
                let mut child =
                    JobObject::new(job_kind, ObjectMeta::new(&instance_name, namespace, now));
                child.spec = queued.spec.clone();
                child
            }
        };

        child.meta.owner = Some(rig_core::types::OwnerRef {
            kind,
            name: name.to_string(),
        });
        child.meta.labels.insert(
            rig_core::types::LABEL_SCENARIO.to_string(),
            namespace.to_string(),
        );
        child
            .meta
            .labels
            .insert(rig_core::types::LABEL_OWNER.to_string(), name.to_string());
        child.meta.labels.insert(
            rig_core::types::LABEL_CREATED_BY.to_string(),
            name.to_string(),
        );
        child.meta.labels.insert(
            rig_core::types::LABEL_INSTANCE.to_string(),
            instance_name.clone(),
        );

        // The instance name is the lock: a replayed round will not create it
        // twice, and the status bump below is retried until it lands.
        self.store.create_job_unless_exists(&child)?;

        group.status.scheduled_jobs = next_expected;
        group.status.last_schedule_time = Some(now);
        match self.store.update_job_status(&group) {
            Ok(_) => Ok(Outcome::Requeue),
            Err(err) if err.is_transient() => Ok(Outcome::RequeueAfter(CONFLICT_BACKOFF)),
            Err(err) => Err(err.into()),
        }
    }

    fn view_of(&self, group: &JobObject) -> Result<Classifier, GroupError> {
        let children = self
            .store
            .list_jobs(&group.meta.namespace, &BTreeMap::new())?;
        let mut view = Classifier::new();
        for child in children {
            let owned = child
                .meta
                .owner
                .as_ref()
                .is_some_and(|owner| owner.kind == group.kind && owner.name == group.meta.name);
            if owned {
                view.classify(&child.meta.name.clone(), child);
            }
        }
        Ok(view)
    }

    fn suspend_spec(
        &self,
        mut group: JobObject,
        mut payload: GroupJobsSpec,
    ) -> Result<JobObject, GroupError> {
        payload.suspend = Some(true);
        group.spec = serde_json::to_value(&payload).map_err(|source| GroupError::Payload {
            name: group.meta.name.clone(),
            source,
        })?;
        Ok(group)
    }

    fn delete_child(&self, child: &JobObject) -> Result<(), GroupError> {
        match self.store.delete_job(
            &child.meta.namespace,
            child.kind,
            &child.meta.name,
            Propagation::Background,
        ) {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn fail(
        &self,
        mut group: JobObject,
        reason: &str,
        message: String,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Outcome, GroupError> {
        group
            .status
            .lifecycle
            .apply(Lifecycle::new(Phase::Failed, reason, message.clone()), now);
        group.status.conditions.set(
            ConditionType::JobUnexpectedTermination,
            reason,
            message,
            now,
        );
        self.write_status(group)
    }

    fn write_status(&self, group: JobObject) -> Result<Outcome, GroupError> {
        match self.store.update_job_status(&group) {
            Ok(_) => Ok(Outcome::Requeue),
            Err(err) if err.is_transient() => Ok(Outcome::RequeueAfter(CONFLICT_BACKOFF)),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the status if it drifted; refresh the handle on success. Returns
    /// an outcome only when a conflict forces the round to end early.
    fn write_status_keep(&self, group: &mut JobObject) -> Result<Option<Outcome>, GroupError> {
        match self.store.update_job_status(group) {
            Ok(updated) => {
                *group = updated;
                Ok(None)
            }
            Err(err) if err.is_transient() => Ok(Some(Outcome::RequeueAfter(CONFLICT_BACKOFF))),
            Err(err) => Err(err.into()),
        }
    }
}

const CONFLICT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testutil::job_in_phase;
    use crate::classifier::Classifier;
    use chrono::Utc;

    fn view(entries: &[(&str, Phase)]) -> Classifier {
        let mut classifier = Classifier::new();
        for (name, phase) in entries {
            classifier.classify(name, job_in_phase(name, *phase));
        }
        classifier
    }

    fn running_status(scheduled: i64) -> JobStatus {
        JobStatus {
            lifecycle: Lifecycle::new(Phase::Running, "AllJobsRunning", ""),
            scheduled_jobs: scheduled,
            ..JobStatus::default()
        }
    }

    fn eval(fired: bool) -> Evaluation {
        Evaluation {
            info: "successful() >= 1".to_string(),
            fired,
        }
    }

    #[test]
    fn plain_groups_reduce_over_the_expected_total() {
        let status = running_status(2);
        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &status,
                total_jobs: 3,
                max_jobs: None,
                until: None,
                tolerate: None,
            },
            &view(&[
                ("a", Phase::Success),
                ("b", Phase::Success),
                ("c", Phase::Success),
            ]),
        );

        assert!(update.changed);
        assert_eq!(update.lifecycle.phase, Phase::Success);
        assert!(!update.suspend);
    }

    #[test]
    fn fired_until_suspends_spawning_and_records_the_condition() {
        let status = running_status(1);
        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &status,
                total_jobs: 0,
                max_jobs: Some(3),
                until: Some(eval(true)),
                tolerate: None,
            },
            &view(&[("call-0", Phase::Success)]),
        );

        assert!(update.suspend);
        assert_eq!(update.lifecycle.reason, "UntilCondition");
        let (condition, reason, _) = update.set_condition.unwrap();
        assert_eq!(condition, ConditionType::AllJobsAreScheduled);
        assert_eq!(reason, "UntilCondition");
    }

    #[test]
    fn exhausted_instance_budget_fails_the_group() {
        // Three instances dispatched (indices 0..=2), predicate never fired.
        let status = running_status(2);
        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &status,
                total_jobs: 0,
                max_jobs: Some(3),
                until: Some(eval(false)),
                tolerate: None,
            },
            &view(&[
                ("call-0", Phase::Success),
                ("call-1", Phase::Success),
                ("call-2", Phase::Success),
            ]),
        );

        assert_eq!(update.lifecycle.phase, Phase::Failed);
        assert_eq!(update.lifecycle.reason, "MaxInstancesReached");
        assert!(update.suspend);
    }

    #[test]
    fn unfired_until_within_budget_keeps_spawning() {
        let status = running_status(0);
        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &status,
                total_jobs: 0,
                max_jobs: Some(3),
                until: Some(eval(false)),
                tolerate: None,
            },
            &view(&[("call-0", Phase::Running)]),
        );

        assert_eq!(update.lifecycle.phase, Phase::Pending);
        assert_eq!(update.lifecycle.reason, "SpawnUntilEvent");
        assert!(!update.suspend);
    }

    #[test]
    fn after_the_condition_fired_reduction_covers_dispatched_instances() {
        let mut status = running_status(1);
        status.conditions.set(
            ConditionType::AllJobsAreScheduled,
            "UntilCondition",
            "",
            Utc::now(),
        );

        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &status,
                total_jobs: 0,
                max_jobs: Some(5),
                until: Some(eval(true)),
                tolerate: None,
            },
            &view(&[("call-0", Phase::Success), ("call-1", Phase::Success)]),
        );

        assert_eq!(update.lifecycle.phase, Phase::Success);
    }

    #[test]
    fn terminal_groups_are_left_alone() {
        let status = JobStatus {
            lifecycle: Lifecycle::new(Phase::Failed, "MaxInstancesReached", ""),
            ..JobStatus::default()
        };
        let update = calculate_group_lifecycle(
            GroupArgs {
                status: &status,
                total_jobs: 1,
                max_jobs: None,
                until: None,
                tolerate: None,
            },
            &view(&[("a", Phase::Success)]),
        );
        assert!(!update.changed);
    }
}
