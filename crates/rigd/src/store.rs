//! Control-plane object store consumed by the controllers.
//!
//! The store keeps scenarios and their child jobs. Writes are guarded by
//! optimistic concurrency: an update whose resource version does not match
//! the stored one fails with `Conflict`, and the caller requeues.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rig_core::types::{
    JobObject, ObjectKind, OwnerRef, Scenario, LABEL_CREATED_BY, LABEL_INSTANCE, LABEL_OWNER,
    LABEL_SCENARIO,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("conflicting write to {kind} {namespace}/{name}: stored version {stored}, submitted {submitted}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        stored: u64,
        submitted: u64,
    },
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Conflicts are transient: the next round rebuilds the view and retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// How children are handled when an object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Parent goes first, children are collected afterwards.
    Background,
    /// Owner references are ignored.
    Orphan,
}

pub trait ObjectStore: Send + Sync {
    fn get_scenario(&self, name: &str) -> Result<Scenario, StoreError>;
    fn list_scenarios(&self) -> Result<Vec<Scenario>, StoreError>;
    fn create_scenario(&self, scenario: &Scenario) -> Result<Scenario, StoreError>;
    fn update_scenario(&self, scenario: &Scenario) -> Result<Scenario, StoreError>;
    fn update_scenario_status(&self, scenario: &Scenario) -> Result<Scenario, StoreError>;
    /// Request deletion. With finalizers present this only flags the object;
    /// the final update that clears the finalizers removes it and its
    /// children per the Background propagation.
    fn delete_scenario(&self, name: &str) -> Result<(), StoreError>;

    fn get_job(&self, namespace: &str, kind: ObjectKind, name: &str)
        -> Result<JobObject, StoreError>;
    /// Children of `namespace`, filtered by label equality.
    fn list_jobs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JobObject>, StoreError>;
    fn create_job(&self, job: &JobObject) -> Result<JobObject, StoreError>;
    fn update_job(&self, job: &JobObject) -> Result<JobObject, StoreError>;
    fn update_job_status(&self, job: &JobObject) -> Result<JobObject, StoreError>;
    fn delete_job(
        &self,
        namespace: &str,
        kind: ObjectKind,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), StoreError>;

    /// Idempotent creation: an existing object with the same key is left in
    /// place and reported as not-created, so a replayed reconcile is a no-op.
    fn create_job_unless_exists(&self, job: &JobObject) -> Result<bool, StoreError> {
        match self.create_job(job) {
            Ok(_) => Ok(true),
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Stamp ownership labels and the controller reference on a child.
pub fn set_controller_reference(parent: &Scenario, child: &mut JobObject, created_by: &str) {
    child.meta.owner = Some(OwnerRef {
        kind: ObjectKind::Scenario,
        name: parent.meta.name.clone(),
    });
    child.meta.namespace = parent.meta.name.clone();
    child
        .meta
        .labels
        .insert(LABEL_SCENARIO.to_string(), parent.meta.name.clone());
    child
        .meta
        .labels
        .insert(LABEL_OWNER.to_string(), parent.meta.name.clone());
    child
        .meta
        .labels
        .insert(LABEL_CREATED_BY.to_string(), created_by.to_string());
    child
        .meta
        .labels
        .insert(LABEL_INSTANCE.to_string(), child.meta.name.clone());
}

#[derive(Debug, Default)]
struct MemoryInner {
    scenarios: BTreeMap<String, Scenario>,
    jobs: BTreeMap<(String, String, String), JobObject>,
}

/// In-memory store used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn job_key(namespace: &str, kind: ObjectKind, name: &str) -> (String, String, String) {
    (
        namespace.to_string(),
        kind.as_str().to_string(),
        name.to_string(),
    )
}

fn matches_selector(job: &JobObject, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| job.meta.label(key) == Some(value.as_str()))
}

impl ObjectStore for MemoryStore {
    fn get_scenario(&self, name: &str) -> Result<Scenario, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .scenarios
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Scenario",
                namespace: name.to_string(),
                name: name.to_string(),
            })
    }

    fn list_scenarios(&self) -> Result<Vec<Scenario>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.scenarios.values().cloned().collect())
    }

    fn create_scenario(&self, scenario: &Scenario) -> Result<Scenario, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.scenarios.contains_key(&scenario.meta.name) {
            return Err(StoreError::AlreadyExists {
                kind: "Scenario",
                namespace: scenario.meta.name.clone(),
                name: scenario.meta.name.clone(),
            });
        }

        let mut stored = scenario.clone();
        stored.meta.resource_version = 1;
        inner
            .scenarios
            .insert(stored.meta.name.clone(), stored.clone());
        Ok(stored)
    }

    fn update_scenario(&self, scenario: &Scenario) -> Result<Scenario, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let name = scenario.meta.name.clone();
        let stored = inner
            .scenarios
            .get(&name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "Scenario",
                namespace: name.clone(),
                name: name.clone(),
            })?;

        if stored.meta.resource_version != scenario.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: "Scenario",
                namespace: name.clone(),
                name,
                stored: stored.meta.resource_version,
                submitted: scenario.meta.resource_version,
            });
        }

        // The update that clears the finalizers of a deletion-flagged
        // scenario removes it, cascading over its children.
        if scenario.meta.deletion_requested && scenario.meta.finalizers.is_empty() {
            inner.scenarios.remove(&name);
            inner.jobs.retain(|(namespace, _, _), _| namespace != &name);
            let mut gone = scenario.clone();
            gone.meta.resource_version += 1;
            return Ok(gone);
        }

        let mut updated = scenario.clone();
        updated.meta.resource_version += 1;
        inner.scenarios.insert(name, updated.clone());
        Ok(updated)
    }

    fn update_scenario_status(&self, scenario: &Scenario) -> Result<Scenario, StoreError> {
        self.update_scenario(scenario)
    }

    fn delete_scenario(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stored) = inner.scenarios.get_mut(name) else {
            return Err(StoreError::NotFound {
                kind: "Scenario",
                namespace: name.to_string(),
                name: name.to_string(),
            });
        };

        if stored.meta.finalizers.is_empty() {
            inner.scenarios.remove(name);
            inner.jobs.retain(|(namespace, _, _), _| namespace != name);
        } else {
            stored.meta.deletion_requested = true;
            stored.meta.resource_version += 1;
        }
        Ok(())
    }

    fn get_job(
        &self,
        namespace: &str,
        kind: ObjectKind,
        name: &str,
    ) -> Result<JobObject, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .get(&job_key(namespace, kind, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.as_str(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn list_jobs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JobObject>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.meta.namespace == namespace && matches_selector(job, selector))
            .cloned()
            .collect())
    }

    fn create_job(&self, job: &JobObject) -> Result<JobObject, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = job_key(&job.meta.namespace, job.kind, &job.meta.name);
        if inner.jobs.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: job.kind.as_str(),
                namespace: job.meta.namespace.clone(),
                name: job.meta.name.clone(),
            });
        }

        let mut stored = job.clone();
        stored.meta.resource_version = 1;
        inner.jobs.insert(key, stored.clone());
        Ok(stored)
    }

    fn update_job(&self, job: &JobObject) -> Result<JobObject, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = job_key(&job.meta.namespace, job.kind, &job.meta.name);
        let stored = inner.jobs.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: job.kind.as_str(),
            namespace: job.meta.namespace.clone(),
            name: job.meta.name.clone(),
        })?;

        if stored.meta.resource_version != job.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: job.kind.as_str(),
                namespace: job.meta.namespace.clone(),
                name: job.meta.name.clone(),
                stored: stored.meta.resource_version,
                submitted: job.meta.resource_version,
            });
        }

        let mut updated = job.clone();
        updated.meta.resource_version += 1;
        inner.jobs.insert(key, updated.clone());
        Ok(updated)
    }

    fn update_job_status(&self, job: &JobObject) -> Result<JobObject, StoreError> {
        self.update_job(job)
    }

    fn delete_job(
        &self,
        namespace: &str,
        kind: ObjectKind,
        name: &str,
        _propagation: Propagation,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.remove(&job_key(namespace, kind, name)).is_none() {
            return Err(StoreError::NotFound {
                kind: kind.as_str(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        // Background propagation: sub-jobs owned by the removed job go next.
        inner
            .jobs
            .retain(|_, candidate| match &candidate.meta.owner {
                Some(owner) => !(owner.kind == kind && owner.name == name)
                    || candidate.meta.namespace != namespace,
                None => true,
            });
        Ok(())
    }
}
