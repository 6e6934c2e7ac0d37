//! End-to-end scenario runs against the in-memory store.
//!
//! The engine under test drives scenarios and group objects; the test plays
//! the part of the out-of-scope runtime by flipping service and chaos
//! children between phases.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use rig_core::config::ControllerConfig;
use rig_core::events::EventKind;
use rig_core::lifecycle::{ConditionType, Lifecycle, Phase};
use rig_core::plan::parse_manifest;
use rig_core::types::{ObjectKind, ObjectMeta, Scenario};
use rigd::alerts::AlertRegistry;
use rigd::classifier::ClassifierReader;
use rigd::clock::ManualClock;
use rigd::exec::{ExecChannel, ExecError, ExecOutput};
use rigd::executors::ChaosJobSpec;
use rigd::group::GroupController;
use rigd::reconciler::{MemoryEvents, ScenarioReconciler, FINALIZER};
use rigd::registry::ClientRegistry;
use rigd::store::{MemoryStore, ObjectStore};
use rigd::template::{TemplateCatalog, TemplateDef};

struct OkExec {
    stdout: String,
    calls: Mutex<usize>,
}

impl OkExec {
    fn new(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl ExecChannel for OkExec {
    fn exec(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        _command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        *self.calls.lock().unwrap() += 1;
        Ok(ExecOutput {
            stdout: self.stdout.clone(),
            stderr: String::new(),
        })
    }
}

struct Harness {
    store: MemoryStore,
    templates: TemplateCatalog,
    alerts: AlertRegistry,
    clock: ManualClock,
    events: MemoryEvents,
    clients: ClientRegistry,
    config: ControllerConfig,
    exec: OkExec,
}

impl Harness {
    fn new() -> Self {
        let mut templates = TemplateCatalog::new();
        templates.insert("app/server", TemplateDef::new(r#"{"image": "server"}"#));
        templates.insert("app/worker", TemplateDef::new(r#"{"image": "worker"}"#));
        templates.insert(
            "fault/partition",
            TemplateDef::new(r#"{"target": "{{ .scenario }}"}"#),
        );

        Self {
            store: MemoryStore::new(),
            templates,
            alerts: AlertRegistry::new(),
            clock: ManualClock::at(t0()),
            events: MemoryEvents::new(),
            clients: ClientRegistry::new(),
            config: ControllerConfig::default(),
            exec: OkExec::new("ok"),
        }
    }

    fn submit(&self, name: &str, manifest: &str) {
        let manifest = parse_manifest(manifest).expect("manifest");
        let scenario = Scenario::new(
            ObjectMeta::new(name, name, self.clock_now()),
            manifest.scenario,
        );
        self.store.create_scenario(&scenario).expect("submit");
    }

    fn clock_now(&self) -> DateTime<Utc> {
        use rigd::clock::Clock;
        self.clock.now()
    }

    /// Run a fixed number of rounds over the scenario and its group
    /// children, the way the daemon loop does.
    fn run_rounds(&self, name: &str, rounds: usize) {
        for _ in 0..rounds {
            let reconciler = ScenarioReconciler {
                store: &self.store,
                templates: &self.templates,
                exec: &self.exec,
                alerts: &self.alerts,
                clock: &self.clock,
                events: &self.events,
                clients: &self.clients,
                config: &self.config,
            };
            reconciler.reconcile(name).expect("reconcile");

            let groups = GroupController {
                store: &self.store,
                exec: &self.exec,
                alerts: &self.alerts,
                clock: &self.clock,
            };
            let children = self
                .store
                .list_jobs(name, &BTreeMap::new())
                .expect("list children");
            for child in children {
                if matches!(
                    child.kind,
                    ObjectKind::Cluster | ObjectKind::Cascade | ObjectKind::Call
                ) {
                    groups
                        .reconcile(&child.meta.namespace, child.kind, &child.meta.name)
                        .expect("group reconcile");
                }
            }
        }
    }

    fn set_phase(&self, namespace: &str, kind: ObjectKind, name: &str, phase: Phase) {
        let mut job = self.store.get_job(namespace, kind, name).expect("get job");
        job.status.lifecycle = Lifecycle::new(phase, "", "");
        self.store.update_job_status(&job).expect("update job");
    }

    fn scenario(&self, name: &str) -> Scenario {
        self.store.get_scenario(name).expect("get scenario")
    }

    fn dispatch_order(&self, name: &str) -> Vec<String> {
        self.events
            .all()
            .into_iter()
            .filter(|event| event.scenario == name)
            .filter_map(|event| match event.kind {
                EventKind::ActionDispatched { action } => Some(action),
                _ => None,
            })
            .collect()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

#[test]
fn linear_chain_runs_in_dependency_order() {
    let h = Harness::new();
    h.submit(
        "chain",
        r#"
scenario:
  actions:
    - name: a
      action: Service
      service:
        fromTemplate:
          name: app/server
    - name: b
      action: Service
      depends:
        running: [a]
      service:
        fromTemplate:
          name: app/server
    - name: c
      action: VirtualObject
      depends:
        success: [b]
      virtualObject: {}
"#,
    );

    h.run_rounds("chain", 5);
    assert_eq!(h.dispatch_order("chain"), vec!["a"]);

    h.set_phase("chain", ObjectKind::Service, "a", Phase::Running);
    h.run_rounds("chain", 5);
    assert_eq!(h.dispatch_order("chain"), vec!["a", "b"]);

    h.set_phase("chain", ObjectKind::Service, "b", Phase::Success);
    h.run_rounds("chain", 5);
    assert_eq!(h.dispatch_order("chain"), vec!["a", "b", "c"]);

    // The virtual object completes on creation; finish the services.
    h.set_phase("chain", ObjectKind::Service, "a", Phase::Success);
    h.run_rounds("chain", 5);

    let scenario = h.scenario("chain");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Success);
    assert!(scenario
        .status
        .conditions
        .is_true(ConditionType::AllJobsAreCompleted));

    // Terminal policy: successful children are collected, the scenario is
    // retained for inspection.
    assert!(h
        .store
        .list_jobs("chain", &BTreeMap::new())
        .unwrap()
        .is_empty());

    // Terminal idempotence: more rounds change nothing.
    let before = h.scenario("chain");
    h.run_rounds("chain", 3);
    let after = h.scenario("chain");
    assert_eq!(before.status, after.status);
}

#[test]
fn tolerated_partial_failure_still_succeeds() {
    let h = Harness::new();
    h.submit(
        "tolerant",
        r#"
scenario:
  actions:
    - name: workers
      action: Cluster
      cluster:
        fromTemplate:
          name: app/worker
        instances: 3
        tolerate:
          failedJobs: 1
"#,
    );

    // Dispatch the cluster and let it spawn all three workers.
    h.run_rounds("tolerant", 8);
    let workers: Vec<String> = h
        .store
        .list_jobs("tolerant", &BTreeMap::new())
        .unwrap()
        .into_iter()
        .filter(|job| job.kind == ObjectKind::Service)
        .map(|job| job.meta.name)
        .collect();
    assert_eq!(workers.len(), 3, "cluster should spawn three workers");

    h.set_phase("tolerant", ObjectKind::Service, "workers-0", Phase::Failed);
    h.set_phase("tolerant", ObjectKind::Service, "workers-1", Phase::Success);
    h.set_phase("tolerant", ObjectKind::Service, "workers-2", Phase::Success);

    // One round settles the cluster within tolerance; its completion
    // message names both the successful and the failed members.
    h.run_rounds("tolerant", 1);
    let cluster = h
        .store
        .get_job("tolerant", ObjectKind::Cluster, "workers")
        .expect("cluster child");
    assert_eq!(cluster.status.lifecycle.phase, Phase::Success);
    assert_eq!(cluster.status.lifecycle.reason, "AllJobsCompleted");
    assert!(cluster.status.lifecycle.message.contains("workers-1"));
    assert!(cluster.status.lifecycle.message.contains("workers-0"));

    h.run_rounds("tolerant", 5);
    let scenario = h.scenario("tolerant");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Success);
    assert!(scenario
        .status
        .conditions
        .is_true(ConditionType::AllJobsAreCompleted));
}

#[test]
fn cron_wedge_fires_only_the_latest_missed_minute() {
    let h = Harness::new();
    h.submit(
        "cron",
        r#"
scenario:
  actions:
    - name: tick
      action: Service
      schedule:
        cron: "*/1 * * * *"
        startingDeadlineSeconds: 10
      service:
        fromTemplate:
          name: app/server
"#,
    );

    // Before the first boundary nothing fires.
    h.run_rounds("cron", 4);
    assert!(h.dispatch_order("cron").is_empty());

    // The controller wedges for five minutes and wakes just after a
    // boundary, within the starting deadline.
    h.clock.set(t0() + chrono::Duration::seconds(5 * 60 + 5));
    h.run_rounds("cron", 4);

    assert_eq!(h.dispatch_order("cron"), vec!["tick"]);
    let scenario = h.scenario("cron");
    assert_eq!(scenario.status.scheduled_jobs, 1);
    assert!(scenario.status.executed.contains_key("tick"));

    // Exactly one child exists despite the five missed boundaries.
    let children = h.store.list_jobs("cron", &BTreeMap::new()).unwrap();
    assert_eq!(children.len(), 1);
}

#[test]
fn until_loop_caps_at_max_instances() {
    let h = Harness::new();
    h.submit(
        "flaky",
        r#"
scenario:
  actions:
    - name: probe
      action: Call
      call:
        callable: report
        services: [a, b, c]
        until:
          state: "failed() >= 100"
"#,
    );

    h.run_rounds("flaky", 12);

    // Three instances were dispatched, then the budget ran out.
    assert_eq!(h.exec.calls(), 3);

    let scenario = h.scenario("flaky");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Failed);
    assert_eq!(scenario.status.lifecycle.reason, "MaxInstancesReached");
    assert!(h.events.all().iter().any(|event| matches!(
        &event.kind,
        EventKind::MaxInstancesReached { action, max: 3 } if action == "probe"
    )));
}

#[test]
fn chaos_duration_flows_through_the_classifier() {
    let h = Harness::new();
    h.submit(
        "faulty",
        r#"
scenario:
  actions:
    - name: partition
      action: Chaos
      chaos:
        fault: Network
        duration: 30s
        fromTemplate:
          name: fault/partition
"#,
    );

    h.run_rounds("faulty", 4);
    let chaos = h
        .store
        .get_job("faulty", ObjectKind::Chaos, "partition")
        .expect("chaos child");
    let payload: ChaosJobSpec = serde_json::from_value(chaos.spec).unwrap();
    assert_eq!(payload.fault, "NetworkChaos");
    assert_eq!(payload.duration_secs, Some(30));

    // The fault runtime injects the fault.
    h.set_phase("faulty", ObjectKind::Chaos, "partition", Phase::Running);
    h.run_rounds("faulty", 3);
    let scenario = h.scenario("faulty");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Running);

    // After the fault duration elapses the external object completes.
    h.clock.advance(chrono::Duration::seconds(30));
    h.set_phase("faulty", ObjectKind::Chaos, "partition", Phase::Success);
    h.run_rounds("faulty", 3);

    let scenario = h.scenario("faulty");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Success);
}

#[test]
fn delete_cycle_is_rejected_before_any_dispatch() {
    let h = Harness::new();
    h.submit(
        "cyclic",
        r#"
scenario:
  actions:
    - name: d1
      action: Delete
      delete:
        jobs: [d2]
    - name: d2
      action: Delete
      delete:
        jobs: [d1]
"#,
    );

    h.run_rounds("cyclic", 4);

    let scenario = h.scenario("cyclic");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Failed);
    assert_eq!(scenario.status.lifecycle.reason, "ValidationError");
    assert!(scenario.status.lifecycle.message.contains("cycle deletion"));
    assert!(scenario.status.executed.is_empty());
    assert!(h
        .store
        .list_jobs("cyclic", &BTreeMap::new())
        .unwrap()
        .is_empty());
    assert!(h.events.all().iter().any(|event| matches!(
        &event.kind,
        EventKind::ValidationFailed { .. }
    )));
}

#[test]
fn delete_action_flips_targets_to_chaos_then_removes_them() {
    let h = Harness::new();
    h.submit(
        "teardown",
        r#"
scenario:
  actions:
    - name: server
      action: Service
      service:
        fromTemplate:
          name: app/server
    - name: cleanup
      action: Delete
      depends:
        running: [server]
      delete:
        jobs: [server]
"#,
    );

    h.run_rounds("teardown", 5);
    h.set_phase("teardown", ObjectKind::Service, "server", Phase::Running);
    h.run_rounds("teardown", 5);

    // The target is gone and the delete marker completed.
    assert!(h.store.get_job("teardown", ObjectKind::Service, "server").is_err());
    let scenario = h.scenario("teardown");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Success);
    assert!(h.events.all().iter().any(|event| matches!(
        &event.kind,
        EventKind::ChildDeleted { child } if child == "server"
    )));
}

#[test]
fn finalizer_drains_registrations_before_removal() {
    let h = Harness::new();
    h.submit(
        "doomed",
        r#"
scenario:
  actions:
    - name: server
      action: Service
      assert:
        metrics: "avg() of query(latency, 1m, now) is above(500)"
      service:
        fromTemplate:
          name: app/server
"#,
    );

    h.run_rounds("doomed", 4);
    let scenario = h.scenario("doomed");
    assert!(scenario.meta.has_finalizer(FINALIZER));
    assert_eq!(h.alerts.len(), 1);

    h.store.delete_scenario("doomed").expect("request deletion");
    h.run_rounds("doomed", 3);

    assert!(h.store.get_scenario("doomed").is_err());
    assert!(h.alerts.is_empty());
    assert!(h.clients.get("doomed").is_none());
}

#[test]
fn assertion_failure_terminates_the_scenario() {
    let h = Harness::new();
    h.submit(
        "asserted",
        r#"
scenario:
  actions:
    - name: server
      action: Service
      assert:
        state: "failed() > 0"
      service:
        fromTemplate:
          name: app/server
"#,
    );

    h.run_rounds("asserted", 5);
    h.set_phase("asserted", ObjectKind::Service, "server", Phase::Failed);
    h.run_rounds("asserted", 3);

    let scenario = h.scenario("asserted");
    assert_eq!(scenario.status.lifecycle.phase, Phase::Failed);
    assert_eq!(scenario.status.lifecycle.reason, "AssertionError");
    assert!(scenario
        .status
        .conditions
        .is_true(ConditionType::AssertionError));
}

#[test]
fn classifier_view_is_rebuilt_from_the_store_each_round() {
    // A scenario whose child regresses in the store is re-observed as-is:
    // the view carries no history.
    let h = Harness::new();
    h.submit(
        "fresh",
        r#"
scenario:
  actions:
    - name: server
      action: Service
      service:
        fromTemplate:
          name: app/server
"#,
    );

    h.run_rounds("fresh", 4);
    h.set_phase("fresh", ObjectKind::Service, "server", Phase::Running);
    h.run_rounds("fresh", 2);
    assert_eq!(h.scenario("fresh").status.lifecycle.phase, Phase::Running);

    let mut view = rigd::classifier::Classifier::new();
    for job in h.store.list_jobs("fresh", &BTreeMap::new()).unwrap() {
        let name = job.meta.name.clone();
        view.classify(&name, job);
    }
    assert!(view.is_running("server"));
    assert_eq!(view.num_all_jobs(), 1);
}
