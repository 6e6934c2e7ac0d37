//! SQLite-backed object store shared by the daemon and the CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use rig_core::types::{JobObject, ObjectKind, Scenario};

use crate::store::{ObjectStore, Propagation, StoreError};

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(format!("sqlite error: {err}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("object serialization error: {err}"))
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS scenarios (
    name TEXT PRIMARY KEY,
    resource_version INTEGER NOT NULL,
    doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    namespace TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    resource_version INTEGER NOT NULL,
    owner_kind TEXT,
    owner_name TEXT,
    doc TEXT NOT NULL,
    PRIMARY KEY (namespace, kind, name)
);

CREATE INDEX IF NOT EXISTS idx_jobs_namespace ON jobs(namespace);
CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(namespace, owner_kind, owner_name);
"#,
        )?;
        Ok(())
    }

    fn write_scenario(
        conn: &Connection,
        scenario: &Scenario,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut updated = scenario.clone();
        updated.meta.resource_version = version;
        conn.execute(
            "INSERT OR REPLACE INTO scenarios (name, resource_version, doc) VALUES (?1, ?2, ?3)",
            params![
                updated.meta.name,
                version as i64,
                serde_json::to_string(&updated)?
            ],
        )?;
        Ok(())
    }

    fn write_job(conn: &Connection, job: &JobObject, version: u64) -> Result<(), StoreError> {
        let mut updated = job.clone();
        updated.meta.resource_version = version;
        let (owner_kind, owner_name) = match &updated.meta.owner {
            Some(owner) => (Some(owner.kind.as_str()), Some(owner.name.clone())),
            None => (None, None),
        };
        conn.execute(
            "INSERT OR REPLACE INTO jobs \
             (namespace, kind, name, resource_version, owner_kind, owner_name, doc) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                updated.meta.namespace,
                updated.kind.as_str(),
                updated.meta.name,
                version as i64,
                owner_kind,
                owner_name,
                serde_json::to_string(&updated)?
            ],
        )?;
        Ok(())
    }

    fn stored_scenario_version(
        conn: &Connection,
        name: &str,
    ) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT resource_version FROM scenarios WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn remove_scenario_and_children(conn: &Connection, name: &str) -> Result<(), StoreError> {
        conn.execute("DELETE FROM scenarios WHERE name = ?1", params![name])?;
        conn.execute("DELETE FROM jobs WHERE namespace = ?1", params![name])?;
        Ok(())
    }
}

impl ObjectStore for SqliteStore {
    fn get_scenario(&self, name: &str) -> Result<Scenario, StoreError> {
        let conn = self.conn.lock().unwrap();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM scenarios WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(StoreError::NotFound {
                kind: "Scenario",
                namespace: name.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn list_scenarios(&self) -> Result<Vec<Scenario>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT doc FROM scenarios ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut scenarios = Vec::new();
        for doc in rows {
            scenarios.push(serde_json::from_str(&doc?)?);
        }
        Ok(scenarios)
    }

    fn create_scenario(&self, scenario: &Scenario) -> Result<Scenario, StoreError> {
        let conn = self.conn.lock().unwrap();
        if Self::stored_scenario_version(&conn, &scenario.meta.name)?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: "Scenario",
                namespace: scenario.meta.name.clone(),
                name: scenario.meta.name.clone(),
            });
        }

        Self::write_scenario(&conn, scenario, 1)?;
        let mut stored = scenario.clone();
        stored.meta.resource_version = 1;
        Ok(stored)
    }

    fn update_scenario(&self, scenario: &Scenario) -> Result<Scenario, StoreError> {
        let conn = self.conn.lock().unwrap();
        let name = scenario.meta.name.clone();
        let stored = Self::stored_scenario_version(&conn, &name)?.ok_or_else(|| {
            StoreError::NotFound {
                kind: "Scenario",
                namespace: name.clone(),
                name: name.clone(),
            }
        })?;

        if stored != scenario.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: "Scenario",
                namespace: name.clone(),
                name,
                stored,
                submitted: scenario.meta.resource_version,
            });
        }

        if scenario.meta.deletion_requested && scenario.meta.finalizers.is_empty() {
            Self::remove_scenario_and_children(&conn, &name)?;
            let mut gone = scenario.clone();
            gone.meta.resource_version += 1;
            return Ok(gone);
        }

        let next = stored + 1;
        Self::write_scenario(&conn, scenario, next)?;
        let mut updated = scenario.clone();
        updated.meta.resource_version = next;
        Ok(updated)
    }

    fn update_scenario_status(&self, scenario: &Scenario) -> Result<Scenario, StoreError> {
        self.update_scenario(scenario)
    }

    fn delete_scenario(&self, name: &str) -> Result<(), StoreError> {
        let mut scenario = self.get_scenario(name)?;

        if scenario.meta.finalizers.is_empty() {
            let conn = self.conn.lock().unwrap();
            return Self::remove_scenario_and_children(&conn, name);
        }

        scenario.meta.deletion_requested = true;
        self.update_scenario(&scenario).map(|_| ())
    }

    fn get_job(
        &self,
        namespace: &str,
        kind: ObjectKind,
        name: &str,
    ) -> Result<JobObject, StoreError> {
        let conn = self.conn.lock().unwrap();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM jobs WHERE namespace = ?1 AND kind = ?2 AND name = ?3",
                params![namespace, kind.as_str(), name],
                |row| row.get(0),
            )
            .optional()?;

        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(StoreError::NotFound {
                kind: kind.as_str(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn list_jobs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JobObject>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT doc FROM jobs WHERE namespace = ?1 ORDER BY kind, name")?;
        let rows = stmt.query_map(params![namespace], |row| row.get::<_, String>(0))?;

        let mut jobs = Vec::new();
        for doc in rows {
            let job: JobObject = serde_json::from_str(&doc?)?;
            let matches = selector
                .iter()
                .all(|(key, value)| job.meta.label(key) == Some(value.as_str()));
            if matches {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn create_job(&self, job: &JobObject) -> Result<JobObject, StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT resource_version FROM jobs WHERE namespace = ?1 AND kind = ?2 AND name = ?3",
                params![job.meta.namespace, job.kind.as_str(), job.meta.name],
                |row| row.get(0),
            )
            .optional()?;

        if exists.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: job.kind.as_str(),
                namespace: job.meta.namespace.clone(),
                name: job.meta.name.clone(),
            });
        }

        Self::write_job(&conn, job, 1)?;
        let mut stored = job.clone();
        stored.meta.resource_version = 1;
        Ok(stored)
    }

    fn update_job(&self, job: &JobObject) -> Result<JobObject, StoreError> {
        let conn = self.conn.lock().unwrap();
        let stored: Option<i64> = conn
            .query_row(
                "SELECT resource_version FROM jobs WHERE namespace = ?1 AND kind = ?2 AND name = ?3",
                params![job.meta.namespace, job.kind.as_str(), job.meta.name],
                |row| row.get(0),
            )
            .optional()?;

        let stored = stored.ok_or_else(|| StoreError::NotFound {
            kind: job.kind.as_str(),
            namespace: job.meta.namespace.clone(),
            name: job.meta.name.clone(),
        })? as u64;

        if stored != job.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: job.kind.as_str(),
                namespace: job.meta.namespace.clone(),
                name: job.meta.name.clone(),
                stored,
                submitted: job.meta.resource_version,
            });
        }

        let next = stored + 1;
        Self::write_job(&conn, job, next)?;
        let mut updated = job.clone();
        updated.meta.resource_version = next;
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
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM jobs WHERE namespace = ?1 AND kind = ?2 AND name = ?3",
            params![namespace, kind.as_str(), name],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound {
                kind: kind.as_str(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        conn.execute(
            "DELETE FROM jobs WHERE namespace = ?1 AND owner_kind = ?2 AND owner_name = ?3",
            params![namespace, kind.as_str(), name],
        )?;
        Ok(())
    }
}
