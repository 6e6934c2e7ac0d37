//! Projection of a parent's owned children into lifecycle buckets.
//!
//! The view carries no history: it is rebuilt from the observed children on
//! every reconciliation round, so a controller restart cannot leave it stale.

use std::collections::BTreeMap;

use rig_core::lifecycle::Phase;
use rig_core::types::JobObject;

/// Read-side of the classifier, consumed by the expression engine and the
/// logical scheduler.
pub trait ClassifierReader {
    fn num_pending_jobs(&self) -> usize;
    fn num_running_jobs(&self) -> usize;
    fn num_successful_jobs(&self) -> usize;
    fn num_failed_jobs(&self) -> usize;

    fn is_successful(&self, name: &str) -> bool;
    fn is_running(&self, name: &str) -> bool;

    fn pending_list(&self) -> Vec<String>;
    fn running_list(&self) -> Vec<String>;
    fn successful_list(&self) -> Vec<String>;
    fn failed_list(&self) -> Vec<String>;

    fn num_all_jobs(&self) -> usize {
        self.num_pending_jobs()
            + self.num_running_jobs()
            + self.num_successful_jobs()
            + self.num_failed_jobs()
    }
}

/// Sorted, disjoint phase buckets over a parent's children. Every owned
/// child lands in exactly one bucket.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    pending: BTreeMap<String, JobObject>,
    running: BTreeMap<String, JobObject>,
    successful: BTreeMap<String, JobObject>,
    failed: BTreeMap<String, JobObject>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.running.clear();
        self.successful.clear();
        self.failed.clear();
    }

    /// Place a child into its bucket based on its own reported lifecycle.
    pub fn classify(&mut self, name: &str, job: JobObject) {
        let phase = job.status.lifecycle.phase;
        self.place(name, job, phase);
    }

    /// Place a child whose phase must be extracted by a caller-supplied
    /// adapter, used for third-party objects that do not carry our status.
    pub fn classify_external<F>(&mut self, name: &str, job: JobObject, adapter: F)
    where
        F: Fn(&JobObject) -> Phase,
    {
        let phase = adapter(&job);
        self.place(name, job, phase);
    }

    fn place(&mut self, name: &str, job: JobObject, phase: Phase) {
        match phase {
            Phase::Uninitialized | Phase::Pending => {
                self.pending.insert(name.to_string(), job);
            }
            // Chaos is a managed abnormal condition, not a failure.
            Phase::Running | Phase::Chaos => {
                self.running.insert(name.to_string(), job);
            }
            Phase::Success => {
                self.successful.insert(name.to_string(), job);
            }
            Phase::Failed => {
                self.failed.insert(name.to_string(), job);
            }
        }
    }

    pub fn pending_jobs(&self) -> Vec<&JobObject> {
        self.pending.values().collect()
    }

    pub fn running_jobs(&self) -> Vec<&JobObject> {
        self.running.values().collect()
    }

    pub fn successful_jobs(&self) -> Vec<&JobObject> {
        self.successful.values().collect()
    }

    pub fn failed_jobs(&self) -> Vec<&JobObject> {
        self.failed.values().collect()
    }

    pub fn get_job(&self, name: &str) -> Option<&JobObject> {
        self.pending
            .get(name)
            .or_else(|| self.running.get(name))
            .or_else(|| self.successful.get(name))
            .or_else(|| self.failed.get(name))
    }
}

impl ClassifierReader for Classifier {
    fn num_pending_jobs(&self) -> usize {
        self.pending.len()
    }

    fn num_running_jobs(&self) -> usize {
        self.running.len()
    }

    fn num_successful_jobs(&self) -> usize {
        self.successful.len()
    }

    fn num_failed_jobs(&self) -> usize {
        self.failed.len()
    }

    fn is_successful(&self, name: &str) -> bool {
        self.successful.contains_key(name)
    }

    fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    fn pending_list(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    fn running_list(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    fn successful_list(&self) -> Vec<String> {
        self.successful.keys().cloned().collect()
    }

    fn failed_list(&self) -> Vec<String> {
        self.failed.keys().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::Utc;
    use rig_core::lifecycle::{Lifecycle, Phase};
    use rig_core::types::{JobObject, ObjectKind, ObjectMeta};

    pub fn job_in_phase(name: &str, phase: Phase) -> JobObject {
        let mut job = JobObject::new(
            ObjectKind::Service,
            ObjectMeta::new(name, "demo", Utc::now()),
        );
        job.status.lifecycle = Lifecycle::new(phase, "", "");
        job
    }
}
