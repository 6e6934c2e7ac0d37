//! Lifecycle reduction for a parent over its grouped jobs.

use rig_core::lifecycle::{ConditionType, Lifecycle, Phase};
use rig_core::types::TolerateSpec;

use crate::classifier::ClassifierReader;

/// Outcome of one reduction: the parent's new lifecycle plus the condition
/// the caller should record, if the row carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    pub lifecycle: Lifecycle,
    pub condition: Option<ConditionType>,
}

/// Map (expected jobs, view, tolerance) to the parent lifecycle.
///
/// Rows are evaluated in order, first match wins:
///
/// | predicate                                   | phase   | reason                |
/// |---------------------------------------------|---------|-----------------------|
/// | failed > tolerate                           | Failed  | UnexpectedTermination |
/// | successful + failed == total                | Success | AllJobsCompleted      |
/// | running+successful+failed == total          | Running | AllJobsRunning        |
/// | previous Running and 0 < failed <= tolerate | Running | Tolerating            |
/// | otherwise                                   | Pending | JobPending            |
///
/// The first row screens out intolerable failures, so completion counts the
/// tolerated ones as done. The reducer never leaves a terminal phase.
pub fn grouped_jobs(
    total_jobs: usize,
    view: &dyn ClassifierReader,
    prev: &Lifecycle,
    tolerate: Option<TolerateSpec>,
) -> Reduction {
    if prev.phase.is_terminal() {
        return Reduction {
            lifecycle: prev.clone(),
            condition: None,
        };
    }

    let tolerate = tolerate.map(|t| t.failed_jobs).unwrap_or(0);
    let failed = view.num_failed_jobs();
    let successful = view.num_successful_jobs();
    let running = view.num_running_jobs();

    if failed > tolerate {
        return Reduction {
            lifecycle: Lifecycle::new(
                Phase::Failed,
                "UnexpectedTermination",
                format!(
                    "failed jobs: {:?}, tolerated: {tolerate}",
                    view.failed_list()
                ),
            ),
            condition: Some(ConditionType::JobUnexpectedTermination),
        };
    }

    if successful + failed == total_jobs {
        return Reduction {
            lifecycle: Lifecycle::new(
                Phase::Success,
                "AllJobsCompleted",
                format!(
                    "successful jobs: {:?}, failed jobs: {:?}",
                    view.successful_list(),
                    view.failed_list()
                ),
            ),
            condition: Some(ConditionType::AllJobsAreCompleted),
        };
    }

    if running + successful + failed == total_jobs {
        return Reduction {
            lifecycle: Lifecycle::new(
                Phase::Running,
                "AllJobsRunning",
                format!(
                    "running jobs: {:?}, successful jobs: {:?}",
                    view.running_list(),
                    view.successful_list()
                ),
            ),
            condition: Some(ConditionType::AllJobsAreScheduled),
        };
    }

    if prev.phase == Phase::Running && failed > 0 {
        return Reduction {
            lifecycle: Lifecycle::new(
                Phase::Running,
                "Tolerating",
                format!(
                    "tolerating failed jobs: {:?} ({failed} of {tolerate})",
                    view.failed_list()
                ),
            ),
            condition: None,
        };
    }

    Reduction {
        lifecycle: Lifecycle::new(
            Phase::Pending,
            "JobPending",
            format!(
                "pending jobs: {:?}, running jobs: {:?}",
                view.pending_list(),
                view.running_list()
            ),
        ),
        condition: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testutil::job_in_phase;
    use crate::classifier::Classifier;

    fn view(pending: usize, running: usize, successful: usize, failed: usize) -> Classifier {
        let mut classifier = Classifier::new();
        let mut n = 0;
        let mut feed = |count: usize, phase: Phase, classifier: &mut Classifier| {
            for _ in 0..count {
                let name = format!("job-{n}");
                classifier.classify(&name, job_in_phase(&name, phase));
                n += 1;
            }
        };
        feed(pending, Phase::Pending, &mut classifier);
        feed(running, Phase::Running, &mut classifier);
        feed(successful, Phase::Success, &mut classifier);
        feed(failed, Phase::Failed, &mut classifier);
        classifier
    }

    fn running_lifecycle() -> Lifecycle {
        Lifecycle::new(Phase::Running, "AllJobsRunning", "")
    }

    #[test]
    fn failures_beyond_tolerance_terminate_the_parent() {
        let reduction = grouped_jobs(
            3,
            &view(0, 1, 0, 2),
            &running_lifecycle(),
            Some(TolerateSpec { failed_jobs: 1 }),
        );
        assert_eq!(reduction.lifecycle.phase, Phase::Failed);
        assert_eq!(reduction.lifecycle.reason, "UnexpectedTermination");
        assert_eq!(
            reduction.condition,
            Some(ConditionType::JobUnexpectedTermination)
        );
    }

    #[test]
    fn failure_row_wins_even_when_everything_else_completed() {
        // Row order matters: 3 successful of 3 total, but a fourth job failed.
        let reduction = grouped_jobs(3, &view(0, 0, 3, 1), &running_lifecycle(), None);
        assert_eq!(reduction.lifecycle.phase, Phase::Failed);
    }

    #[test]
    fn all_successful_completes_the_parent() {
        let reduction = grouped_jobs(3, &view(0, 0, 3, 0), &running_lifecycle(), None);
        assert_eq!(reduction.lifecycle.phase, Phase::Success);
        assert_eq!(reduction.lifecycle.reason, "AllJobsCompleted");
        assert_eq!(reduction.condition, Some(ConditionType::AllJobsAreCompleted));
    }

    #[test]
    fn tolerated_failures_still_allow_success() {
        // Three expected, two succeeded, one failed within tolerance.
        let reduction = grouped_jobs(
            3,
            &view(0, 0, 2, 1),
            &running_lifecycle(),
            Some(TolerateSpec { failed_jobs: 1 }),
        );
        assert_eq!(reduction.lifecycle.phase, Phase::Success);
        assert_eq!(reduction.lifecycle.reason, "AllJobsCompleted");
        // The completion message names both the successful and failed members.
        assert!(reduction.lifecycle.message.contains("job-0"));
        assert!(reduction.lifecycle.message.contains("job-2"));
    }

    #[test]
    fn fully_scheduled_group_reports_running() {
        let reduction = grouped_jobs(
            3,
            &view(0, 3, 0, 0),
            &Lifecycle::new(Phase::Pending, "JobPending", ""),
            None,
        );
        assert_eq!(reduction.lifecycle.phase, Phase::Running);
        assert_eq!(reduction.condition, Some(ConditionType::AllJobsAreScheduled));
    }

    #[test]
    fn running_parent_keeps_running_while_tolerating() {
        // One failed within tolerance, one still pending: neither the
        // completed row nor the all-scheduled row matches.
        let reduction = grouped_jobs(
            3,
            &view(1, 1, 0, 1),
            &running_lifecycle(),
            Some(TolerateSpec { failed_jobs: 1 }),
        );
        assert_eq!(reduction.lifecycle.phase, Phase::Running);
        assert_eq!(reduction.lifecycle.reason, "Tolerating");
        assert_eq!(reduction.condition, None);
    }

    #[test]
    fn otherwise_the_parent_is_pending() {
        let reduction = grouped_jobs(
            3,
            &view(2, 1, 0, 0),
            &Lifecycle::default(),
            None,
        );
        assert_eq!(reduction.lifecycle.phase, Phase::Pending);
        assert_eq!(reduction.lifecycle.reason, "JobPending");
    }

    #[test]
    fn terminal_phases_are_never_left() {
        let failed = Lifecycle::new(Phase::Failed, "UnexpectedTermination", "done");
        let reduction = grouped_jobs(3, &view(0, 0, 3, 0), &failed, None);
        assert_eq!(reduction.lifecycle, failed);
        assert_eq!(reduction.condition, None);

        let success = Lifecycle::new(Phase::Success, "AllJobsCompleted", "done");
        let reduction = grouped_jobs(3, &view(0, 0, 0, 3), &success, None);
        assert_eq!(reduction.lifecycle, success);
    }

    #[test]
    fn default_tolerance_is_zero() {
        let reduction = grouped_jobs(2, &view(0, 1, 0, 1), &running_lifecycle(), None);
        assert_eq!(reduction.lifecycle.phase, Phase::Failed);
    }
}
