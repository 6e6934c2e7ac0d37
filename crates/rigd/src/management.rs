//! Test management calls used by the CLI: a test is a namespace holding
//! exactly one scenario, named after the test.

use chrono::{DateTime, Utc};
use std::time::Duration;

use rig_core::plan::Manifest;
use rig_core::types::{ObjectMeta, Scenario};

use crate::store::{ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ManagementError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("test {test:?} already exists")]
    AlreadyExists { test: String },
}

pub struct ManagementClient<'a> {
    store: &'a dyn ObjectStore,
    /// Budget for one management call; bounds remote transports.
    pub call_timeout: Duration,
}

impl<'a> ManagementClient<'a> {
    pub fn new(store: &'a dyn ObjectStore, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Return a single test by id, or None when it does not exist.
    pub fn get_test(&self, id: &str) -> Result<Option<Scenario>, ManagementError> {
        match self.store.get_scenario(id) {
            Ok(scenario) => Ok(Some(scenario)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list_tests(&self) -> Result<Vec<Scenario>, ManagementError> {
        Ok(self.store.list_scenarios()?)
    }

    /// Submit a manifest as a new test. The test name doubles as the
    /// namespace of everything the scenario owns.
    pub fn submit_test(
        &self,
        id: &str,
        manifest: &Manifest,
        now: DateTime<Utc>,
    ) -> Result<Scenario, ManagementError> {
        let scenario = Scenario::new(ObjectMeta::new(id, id, now), manifest.scenario.clone());
        match self.store.create_scenario(&scenario) {
            Ok(created) => Ok(created),
            Err(StoreError::AlreadyExists { .. }) => Err(ManagementError::AlreadyExists {
                test: id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub fn delete_test(&self, id: &str) -> Result<(), ManagementError> {
        Ok(self.store.delete_scenario(id)?)
    }

    /// Delete every test; returns the names that were removed.
    pub fn delete_tests(&self) -> Result<Vec<String>, ManagementError> {
        let mut deleted = Vec::new();
        for scenario in self.store.list_scenarios()? {
            self.store.delete_scenario(&scenario.meta.name)?;
            deleted.push(scenario.meta.name);
        }
        Ok(deleted)
    }
}
