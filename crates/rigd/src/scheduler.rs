//! Logical scheduling: which actions are ready to run right now.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use rig_core::types::{Action, TriggeredBy};

use crate::classifier::ClassifierReader;

/// Result of one scheduling pass.
///
/// `next_deadline` is the earliest `after` deadline among the actions still
/// blocked on logical time. A view change triggers the next reconcile by
/// itself, but a pure time dependency does not, so the caller requeues at
/// this deadline to avoid missing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPlan<'a> {
    pub ready: Vec<&'a Action>,
    pub next_deadline: Option<DateTime<Utc>>,
}

/// Return the unexecuted actions whose dependencies are met, preserving
/// declaration order.
///
/// An action is ready when every `depends.success` entry is successful in
/// the view, every `depends.running` entry is running, and the `after`
/// offset from the scenario timebase has expired.
pub fn next_logical_jobs<'a>(
    timebase: DateTime<Utc>,
    all: &'a [Action],
    view: &dyn ClassifierReader,
    executed: &BTreeMap<String, TriggeredBy>,
    now: DateTime<Utc>,
) -> LogicalPlan<'a> {
    let mut ready = Vec::new();
    let mut next_deadline: Option<DateTime<Utc>> = None;

    for action in all {
        if executed.contains_key(&action.name) {
            continue;
        }

        let Some(deps) = action.depends.as_ref() else {
            ready.push(action);
            continue;
        };

        let success_ok = deps.success.iter().all(|dep| view.is_successful(dep));
        let running_ok = deps.running.iter().all(|dep| view.is_running(dep));

        let time_ok = match deps.after {
            None => true,
            Some(after) => {
                let deadline = timebase
                    + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
                if deadline <= now {
                    true
                } else {
                    next_deadline = match next_deadline {
                        Some(current) if current <= deadline => Some(current),
                        _ => Some(deadline),
                    };
                    false
                }
            }
        };

        if success_ok && running_ok && time_ok {
            ready.push(action);
        }
    }

    LogicalPlan {
        ready,
        next_deadline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testutil::job_in_phase;
    use crate::classifier::Classifier;
    use chrono::TimeZone;
    use rig_core::lifecycle::Phase;
    use rig_core::types::{TriggerKind, WaitSpec};
    use std::time::Duration;

    fn timebase() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn action(name: &str, depends: Option<WaitSpec>) -> Action {
        Action {
            name: name.to_string(),
            depends,
            ..Action::default()
        }
    }

    fn view(entries: &[(&str, Phase)]) -> Classifier {
        let mut classifier = Classifier::new();
        for (name, phase) in entries {
            classifier.classify(name, job_in_phase(name, *phase));
        }
        classifier
    }

    fn executed(names: &[&str]) -> BTreeMap<String, TriggeredBy> {
        names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    TriggeredBy {
                        kind: TriggerKind::Dependencies,
                        at: timebase(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn actions_without_dependencies_are_immediately_ready() {
        let actions = vec![action("a", None), action("b", None)];
        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[]),
            &BTreeMap::new(),
            timebase(),
        );

        let names: Vec<&str> = plan.ready.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(plan.next_deadline, None);
    }

    #[test]
    fn executed_actions_are_skipped() {
        let actions = vec![action("a", None), action("b", None)];
        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[]),
            &executed(&["a"]),
            timebase(),
        );

        let names: Vec<&str> = plan.ready.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn success_and_running_dependencies_gate_readiness() {
        let actions = vec![
            action(
                "b",
                Some(WaitSpec {
                    running: vec!["a".to_string()],
                    ..WaitSpec::default()
                }),
            ),
            action(
                "c",
                Some(WaitSpec {
                    success: vec!["b".to_string()],
                    ..WaitSpec::default()
                }),
            ),
        ];

        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[("a", Phase::Running)]),
            &BTreeMap::new(),
            timebase(),
        );
        let names: Vec<&str> = plan.ready.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);

        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[("a", Phase::Running), ("b", Phase::Success)]),
            &executed(&["b"]),
            timebase(),
        );
        let names: Vec<&str> = plan.ready.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn time_dependency_blocks_until_the_offset_expires() {
        let actions = vec![action(
            "late",
            Some(WaitSpec {
                after: Some(Duration::from_secs(120)),
                ..WaitSpec::default()
            }),
        )];

        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[]),
            &BTreeMap::new(),
            timebase() + chrono::Duration::seconds(60),
        );
        assert!(plan.ready.is_empty());
        assert_eq!(
            plan.next_deadline,
            Some(timebase() + chrono::Duration::seconds(120))
        );

        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[]),
            &BTreeMap::new(),
            timebase() + chrono::Duration::seconds(120),
        );
        assert_eq!(plan.ready.len(), 1);
        assert_eq!(plan.next_deadline, None);
    }

    #[test]
    fn earliest_pending_deadline_wins() {
        let actions = vec![
            action(
                "slow",
                Some(WaitSpec {
                    after: Some(Duration::from_secs(300)),
                    ..WaitSpec::default()
                }),
            ),
            action(
                "soon",
                Some(WaitSpec {
                    after: Some(Duration::from_secs(30)),
                    ..WaitSpec::default()
                }),
            ),
        ];

        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[]),
            &BTreeMap::new(),
            timebase(),
        );
        assert!(plan.ready.is_empty());
        assert_eq!(
            plan.next_deadline,
            Some(timebase() + chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn mixed_dependencies_require_all_predicates() {
        let actions = vec![action(
            "gated",
            Some(WaitSpec {
                success: vec!["done".to_string()],
                running: vec!["live".to_string()],
                after: Some(Duration::from_secs(10)),
            }),
        )];

        // Dependencies met but time not yet expired.
        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[("done", Phase::Success), ("live", Phase::Running)]),
            &BTreeMap::new(),
            timebase(),
        );
        assert!(plan.ready.is_empty());

        // Everything met.
        let plan = next_logical_jobs(
            timebase(),
            &actions,
            &view(&[("done", Phase::Success), ("live", Phase::Running)]),
            &BTreeMap::new(),
            timebase() + chrono::Duration::seconds(10),
        );
        assert_eq!(plan.ready.len(), 1);
    }

    #[test]
    fn repeated_calls_return_the_same_plan() {
        let actions = vec![
            action("a", None),
            action(
                "b",
                Some(WaitSpec {
                    after: Some(Duration::from_secs(60)),
                    ..WaitSpec::default()
                }),
            ),
        ];
        let view = view(&[]);
        let executed = BTreeMap::new();
        let now = timebase() + chrono::Duration::seconds(30);

        let first = next_logical_jobs(timebase(), &actions, &view, &executed, now);
        let second = next_logical_jobs(timebase(), &actions, &view, &executed, now);
        assert_eq!(first, second);
    }
}
