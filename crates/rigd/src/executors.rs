//! Constructors for the concrete child objects of each action type.
//!
//! Executors are pure: they build the desired object from the parent and the
//! action spec, and the controller separately creates it with
//! create-unless-exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use rig_core::lifecycle::{Lifecycle, Phase};
use rig_core::types::{
    Action, ActionType, JobObject, MatchOutput, ObjectKind, ObjectMeta, ScheduleSpec, Scenario,
    TolerateSpec, UntilSpec, LABEL_COMPONENT,
};

use crate::exec::{ExecChannel, ExecError};
use crate::store::set_controller_reference;
use crate::template::{RenderCache, Scheme, TemplateError, TemplateResolver};

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("action [{action}]: {source}")]
    Template {
        action: String,
        #[source]
        source: TemplateError,
    },
    #[error("action [{action}] is missing the spec for its type")]
    MissingSpec { action: String },
    #[error("action [{action}] carries a bad output pattern: {source}")]
    BadOutputPattern {
        action: String,
        #[source]
        source: regex::Error,
    },
    #[error("could not encode the job payload for action [{action}]: {source}")]
    Encode {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A prepared job instance of a list-generator action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub name: String,
    pub spec: serde_json::Value,
}

/// Payload of a group object: the instance pool plus its repeat and
/// tolerance policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupJobsSpec {
    pub job_kind: ObjectKind,
    pub jobs: Vec<QueuedJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UntilSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerate: Option<TolerateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

/// One remote invocation of a call group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInstance {
    pub callable: String,
    pub service: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<MatchOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosJobSpec {
    pub fault: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    pub spec: serde_json::Value,
}

/// The child object kind an action materializes.
pub fn child_kind(action_type: ActionType) -> ObjectKind {
    match action_type {
        ActionType::Service => ObjectKind::Service,
        ActionType::Cluster => ObjectKind::Cluster,
        ActionType::Chaos => ObjectKind::Chaos,
        ActionType::Cascade => ObjectKind::Cascade,
        ActionType::Call => ObjectKind::Call,
        // A delete action is tracked through its own synthetic marker.
        ActionType::Delete | ActionType::VirtualObject => ObjectKind::VirtualObject,
    }
}

pub fn construct_service(
    parent: &Scenario,
    action: &Action,
    resolver: &dyn TemplateResolver,
    cache: &mut RenderCache,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let spec = action.service.as_ref().ok_or_else(|| ExecuteError::MissingSpec {
        action: action.name.clone(),
    })?;

    let scheme = Scheme {
        scenario: parent.meta.name.clone(),
        instance: action.name.clone(),
        inputs: spec.from_template.inputs.clone(),
    };
    let rendered = cache
        .resolve(resolver, &parent.meta.name, &spec.from_template.name, &scheme)
        .map_err(|source| ExecuteError::Template {
            action: action.name.clone(),
            source,
        })?;

    let mut job = JobObject::new(
        ObjectKind::Service,
        ObjectMeta::new(&action.name, &parent.meta.name, now),
    );
    job.spec = rendered.spec;
    set_controller_reference(parent, &mut job, &action.name);
    job.meta.labels.insert(
        LABEL_COMPONENT.to_string(),
        rendered.component.as_str().to_string(),
    );
    Ok(job)
}

pub fn construct_cluster(
    parent: &Scenario,
    action: &Action,
    resolver: &dyn TemplateResolver,
    cache: &mut RenderCache,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let spec = action.cluster.as_ref().ok_or_else(|| ExecuteError::MissingSpec {
        action: action.name.clone(),
    })?;

    let input_sets = generate_inputs(&spec.from_template.inputs, &spec.inputs, spec.instances);
    let mut jobs = Vec::with_capacity(input_sets.len());
    for (index, inputs) in input_sets.into_iter().enumerate() {
        let name = format!("{}-{index}", action.name);
        let scheme = Scheme {
            scenario: parent.meta.name.clone(),
            instance: name.clone(),
            inputs,
        };
        let rendered = cache
            .resolve(resolver, &parent.meta.name, &spec.from_template.name, &scheme)
            .map_err(|source| ExecuteError::Template {
                action: action.name.clone(),
                source,
            })?;
        jobs.push(QueuedJob {
            name,
            spec: rendered.spec,
        });
    }

    let payload = GroupJobsSpec {
        job_kind: ObjectKind::Service,
        jobs,
        until: action.until().cloned(),
        tolerate: action.tolerate().cloned(),
        schedule: spec.schedule.clone(),
        max_instances: action.max_instances(),
        suspend: spec.suspend,
    };

    group_object(parent, action, ObjectKind::Cluster, payload, now)
}

pub fn construct_chaos(
    parent: &Scenario,
    action: &Action,
    resolver: &dyn TemplateResolver,
    cache: &mut RenderCache,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let spec = action.chaos.as_ref().ok_or_else(|| ExecuteError::MissingSpec {
        action: action.name.clone(),
    })?;

    let scheme = Scheme {
        scenario: parent.meta.name.clone(),
        instance: action.name.clone(),
        inputs: spec.from_template.inputs.clone(),
    };
    let rendered = cache
        .resolve(resolver, &parent.meta.name, &spec.from_template.name, &scheme)
        .map_err(|source| ExecuteError::Template {
            action: action.name.clone(),
            source,
        })?;

    let payload = ChaosJobSpec {
        fault: spec.fault.kind().to_string(),
        duration_secs: spec.duration.map(|d| d.as_secs()),
        spec: rendered.spec,
    };

    let mut job = JobObject::new(
        ObjectKind::Chaos,
        ObjectMeta::new(&action.name, &parent.meta.name, now),
    );
    job.spec = serde_json::to_value(&payload).map_err(|source| ExecuteError::Encode {
        action: action.name.clone(),
        source,
    })?;
    set_controller_reference(parent, &mut job, &action.name);
    Ok(job)
}

pub fn construct_cascade(
    parent: &Scenario,
    action: &Action,
    resolver: &dyn TemplateResolver,
    cache: &mut RenderCache,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let spec = action.cascade.as_ref().ok_or_else(|| ExecuteError::MissingSpec {
        action: action.name.clone(),
    })?;

    let input_sets = generate_inputs(&spec.from_template.inputs, &spec.inputs, spec.instances);
    let mut jobs = Vec::with_capacity(input_sets.len());
    for (index, inputs) in input_sets.into_iter().enumerate() {
        let name = format!("{}-{index}", action.name);
        let scheme = Scheme {
            scenario: parent.meta.name.clone(),
            instance: name.clone(),
            inputs,
        };
        let rendered = cache
            .resolve(resolver, &parent.meta.name, &spec.from_template.name, &scheme)
            .map_err(|source| ExecuteError::Template {
                action: action.name.clone(),
                source,
            })?;
        let payload = ChaosJobSpec {
            fault: spec.fault.kind().to_string(),
            duration_secs: None,
            spec: rendered.spec,
        };
        jobs.push(QueuedJob {
            name,
            spec: serde_json::to_value(&payload).map_err(|source| ExecuteError::Encode {
                action: action.name.clone(),
                source,
            })?,
        });
    }

    let payload = GroupJobsSpec {
        job_kind: ObjectKind::Chaos,
        jobs,
        until: None,
        tolerate: None,
        schedule: spec.schedule.clone(),
        max_instances: None,
        suspend: None,
    };

    group_object(parent, action, ObjectKind::Cascade, payload, now)
}

pub fn construct_call(
    parent: &Scenario,
    action: &Action,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let spec = action.call.as_ref().ok_or_else(|| ExecuteError::MissingSpec {
        action: action.name.clone(),
    })?;

    // Patterns are matched at dispatch time; reject bad ones up front.
    for expect in &spec.expect {
        for pattern in [expect.stdout.as_deref(), expect.stderr.as_deref()]
            .into_iter()
            .flatten()
        {
            regex::Regex::new(pattern).map_err(|source| ExecuteError::BadOutputPattern {
                action: action.name.clone(),
                source,
            })?;
        }
    }

    let mut jobs = Vec::with_capacity(spec.services.len());
    for (index, service) in spec.services.iter().enumerate() {
        let instance = CallInstance {
            callable: spec.callable.clone(),
            service: service.clone(),
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.callable.clone(),
            ],
            expect: spec.expect.get(index).cloned(),
        };
        jobs.push(QueuedJob {
            name: format!("{}-{index}", action.name),
            spec: serde_json::to_value(&instance).map_err(|source| ExecuteError::Encode {
                action: action.name.clone(),
                source,
            })?,
        });
    }

    let payload = GroupJobsSpec {
        job_kind: ObjectKind::VirtualObject,
        jobs,
        until: action.until().cloned(),
        tolerate: action.tolerate().cloned(),
        schedule: spec.schedule.clone(),
        max_instances: action.max_instances(),
        suspend: spec.suspend,
    };

    group_object(parent, action, ObjectKind::Call, payload, now)
}

/// A virtual object is a synthetic child with no backing resource; its
/// status is authored here, not derived.
pub fn construct_virtual_object(
    parent: &Scenario,
    action: &Action,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let spec = action
        .virtual_object
        .as_ref()
        .ok_or_else(|| ExecuteError::MissingSpec {
            action: action.name.clone(),
        })?;

    let mut job = JobObject::new(
        ObjectKind::VirtualObject,
        ObjectMeta::new(&action.name, &parent.meta.name, now),
    );
    job.spec = serde_json::to_value(&spec.parameters).map_err(|source| ExecuteError::Encode {
        action: action.name.clone(),
        source,
    })?;
    set_controller_reference(parent, &mut job, &action.name);

    job.status.lifecycle.apply(
        Lifecycle::new(Phase::Success, "VirtualResource", "authored by the parent"),
        now,
    );
    Ok(job)
}

/// Completion marker for a delete action, authored once its targets are
/// flipped and scheduled for removal.
pub fn construct_delete_marker(
    parent: &Scenario,
    action: &Action,
    deleted: &[String],
    now: DateTime<Utc>,
) -> JobObject {
    let mut job = JobObject::new(
        ObjectKind::VirtualObject,
        ObjectMeta::new(&action.name, &parent.meta.name, now),
    );
    job.spec = serde_json::json!({ "deleted": deleted });
    set_controller_reference(parent, &mut job, &action.name);
    job.status.lifecycle.apply(
        Lifecycle::new(
            Phase::Success,
            "AllJobsDeleted",
            format!("deleted jobs: {deleted:?}"),
        ),
        now,
    );
    job
}

/// Run one call instance through the exec channel and author the captured
/// output as a virtual object lifecycle.
pub fn run_call_instance(
    namespace: &str,
    instance: &CallInstance,
    exec: &dyn ExecChannel,
    now: DateTime<Utc>,
) -> (Lifecycle, String, String) {
    let outcome = exec.exec(namespace, &instance.service, "main", &instance.command);

    let (stdout, stderr, mut lifecycle) = match outcome {
        Ok(output) => {
            let lifecycle = Lifecycle::new(
                Phase::Success,
                "CallCompleted",
                format!("{} on {}", instance.callable, instance.service),
            );
            (output.stdout, output.stderr, lifecycle)
        }
        Err(ExecError::NonZeroExit { status, stderr, .. }) => (
            String::new(),
            stderr.clone(),
            Lifecycle::new(
                Phase::Failed,
                "CallFailed",
                format!("{} exited with status {status}", instance.callable),
            ),
        ),
        Err(err) => (
            String::new(),
            String::new(),
            Lifecycle::new(Phase::Failed, "CallFailed", err.to_string()),
        ),
    };

    if lifecycle.phase == Phase::Success {
        if let Some(expect) = &instance.expect {
            if let Some(mismatch) = match_output(expect, &stdout, &stderr) {
                lifecycle = Lifecycle::new(Phase::Failed, "OutputMismatch", mismatch);
            }
        }
    }

    lifecycle.start_time = Some(now);
    if lifecycle.phase.is_terminal() {
        lifecycle.end_time = Some(now);
    }
    (lifecycle, stdout, stderr)
}

fn match_output(expect: &MatchOutput, stdout: &str, stderr: &str) -> Option<String> {
    for (pattern, stream, name) in [
        (expect.stdout.as_deref(), stdout, "stdout"),
        (expect.stderr.as_deref(), stderr, "stderr"),
    ] {
        let Some(pattern) = pattern else { continue };
        // Patterns were vetted at construction time.
        let Ok(re) = regex::Regex::new(pattern) else {
            return Some(format!("invalid {name} pattern {pattern:?}"));
        };
        if !re.is_match(stream) {
            return Some(format!("{name} did not match {pattern:?}: {stream:?}"));
        }
    }
    None
}

fn group_object(
    parent: &Scenario,
    action: &Action,
    kind: ObjectKind,
    payload: GroupJobsSpec,
    now: DateTime<Utc>,
) -> Result<JobObject, ExecuteError> {
    let queued = payload.jobs.len();
    let mut job = JobObject::new(kind, ObjectMeta::new(&action.name, &parent.meta.name, now));
    job.spec = serde_json::to_value(&payload).map_err(|source| ExecuteError::Encode {
        action: action.name.clone(),
        source,
    })?;
    job.status.queued_jobs = queued;
    job.status.scheduled_jobs = -1;
    set_controller_reference(parent, &mut job, &action.name);
    Ok(job)
}

/// Expand a list-generator into per-instance input sets: `instances` copies,
/// one per explicit input map, or a single default set.
fn generate_inputs(
    base: &BTreeMap<String, String>,
    cartesian: &[BTreeMap<String, String>],
    instances: Option<usize>,
) -> Vec<BTreeMap<String, String>> {
    if !cartesian.is_empty() {
        return cartesian
            .iter()
            .map(|inputs| {
                let mut merged = base.clone();
                merged.extend(inputs.clone());
                merged
            })
            .collect();
    }

    let count = instances.unwrap_or(1);
    (0..count).map(|_| base.clone()).collect()
}
