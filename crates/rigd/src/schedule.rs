//! Time-based firing decisions: the most recent missed run, the next run,
//! and the starting-deadline misfire policy.

use chrono::{DateTime, Duration, Utc};

use rig_core::types::ScheduleSpec;

use crate::cron::{CronError, CronSchedule};

/// Guard against wedged clocks: a controller that wakes up to thousands of
/// missed starts must not enumerate them all.
const MAX_MISSED_RUNS: usize = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error(transparent)]
    Cron(#[from] CronError),
    #[error(
        "too many missed start times (> {MAX_MISSED_RUNS}); set or decrease \
         startingDeadlineSeconds, or check for clock skew"
    )]
    TooManyMissedRuns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTimes {
    /// The most recent activation that should have fired but has not.
    pub missed: Option<DateTime<Utc>>,
    /// The next activation after `now`, used to requeue the reconcile.
    pub next: Option<DateTime<Utc>>,
}

/// What the caller should do about a cron schedule right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Fire one instance for the missed activation, requeue at `next`.
    Fire {
        missed: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
    /// Nothing due; sleep until `next` (or forever if the schedule is over).
    Sleep { until: Option<DateTime<Utc>> },
    /// The missed run is past its starting deadline. The caller transitions
    /// to Failed with reason "scheduling violation".
    Misfire { missed: DateTime<Utc> },
}

/// Compute the most recent missed activation and the next one.
///
/// Counting starts from the last observed run, or from the object's creation
/// when no run was recorded yet. When a starting deadline is set, activations
/// older than the deadline are not worth replaying and are skipped wholesale.
pub fn next_schedule_time(
    creation: DateTime<Utc>,
    last_schedule: Option<DateTime<Utc>>,
    spec: &ScheduleSpec,
    now: DateTime<Utc>,
) -> Result<ScheduleTimes, ScheduleError> {
    let Some(cron) = spec.cron.as_deref() else {
        // No cron: fire immediately, no future activation.
        return Ok(ScheduleTimes {
            missed: Some(now),
            next: None,
        });
    };

    let schedule = CronSchedule::parse(cron)?;

    let mut earliest = last_schedule.unwrap_or(creation);

    if let Some(deadline) = spec.starting_deadline_seconds {
        let horizon = now - Duration::seconds(deadline as i64);
        if horizon > earliest {
            earliest = horizon;
        }
    }

    if earliest > now {
        return Ok(ScheduleTimes {
            missed: None,
            next: schedule.next_after(now),
        });
    }

    let mut missed = None;
    let mut starts = 0usize;
    let mut t = schedule.next_after(earliest);
    while let Some(candidate) = t {
        if candidate > now {
            break;
        }
        missed = Some(candidate);
        starts += 1;
        if starts > MAX_MISSED_RUNS {
            return Err(ScheduleError::TooManyMissedRuns);
        }
        t = schedule.next_after(candidate);
    }

    Ok(ScheduleTimes {
        missed,
        next: schedule.next_after(now),
    })
}

/// Apply the misfire policy on top of `next_schedule_time`.
pub fn schedule_decision(
    creation: DateTime<Utc>,
    last_schedule: Option<DateTime<Utc>>,
    spec: &ScheduleSpec,
    now: DateTime<Utc>,
) -> Result<ScheduleDecision, ScheduleError> {
    let times = next_schedule_time(creation, last_schedule, spec, now)?;

    let Some(missed) = times.missed else {
        return Ok(ScheduleDecision::Sleep { until: times.next });
    };

    if let Some(deadline) = spec.starting_deadline_seconds {
        if missed + Duration::seconds(deadline as i64) < now {
            return Ok(ScheduleDecision::Misfire { missed });
        }
    }

    Ok(ScheduleDecision::Fire {
        missed,
        next: times.next,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, mi, s).unwrap()
    }

    fn every_minute(deadline: Option<u64>) -> ScheduleSpec {
        ScheduleSpec {
            cron: Some("*/1 * * * *".to_string()),
            event: None,
            starting_deadline_seconds: deadline,
        }
    }

    #[test]
    fn no_cron_fires_immediately() {
        let spec = ScheduleSpec::default();
        let times = next_schedule_time(at(10, 0, 0), None, &spec, at(10, 5, 0)).unwrap();
        assert_eq!(times.missed, Some(at(10, 5, 0)));
        assert_eq!(times.next, None);
    }

    #[test]
    fn missed_run_is_the_latest_one_before_now() {
        let spec = every_minute(None);
        let times =
            next_schedule_time(at(10, 0, 0), Some(at(10, 2, 0)), &spec, at(10, 4, 30)).unwrap();
        assert_eq!(times.missed, Some(at(10, 4, 0)));
        assert_eq!(times.next, Some(at(10, 5, 0)));
    }

    #[test]
    fn early_in_the_schedule_sleeps_until_next() {
        let spec = every_minute(None);
        let times =
            next_schedule_time(at(10, 0, 0), Some(at(10, 4, 0)), &spec, at(10, 4, 10)).unwrap();
        assert_eq!(times.missed, None);
        assert_eq!(times.next, Some(at(10, 5, 0)));

        let decision =
            schedule_decision(at(10, 0, 0), Some(at(10, 4, 0)), &spec, at(10, 4, 10)).unwrap();
        assert_eq!(
            decision,
            ScheduleDecision::Sleep {
                until: Some(at(10, 5, 0))
            }
        );
    }

    #[test]
    fn deadline_bounds_the_replay_window_after_a_wedge() {
        // Controller wedged for 5 minutes with a 10-second deadline. Runs
        // older than the deadline are not worth replaying: waking within the
        // window fires the latest missed minute, waking outside it sleeps to
        // the next boundary.
        let spec = every_minute(Some(10));

        let decision =
            schedule_decision(at(10, 0, 0), Some(at(10, 0, 0)), &spec, at(10, 5, 5)).unwrap();
        assert_eq!(
            decision,
            ScheduleDecision::Fire {
                missed: at(10, 5, 0),
                next: Some(at(10, 6, 0)),
            }
        );

        let decision =
            schedule_decision(at(10, 0, 0), Some(at(10, 0, 0)), &spec, at(10, 5, 30)).unwrap();
        assert_eq!(
            decision,
            ScheduleDecision::Sleep {
                until: Some(at(10, 6, 0))
            }
        );
    }

    #[test]
    fn missed_run_within_deadline_fires() {
        let spec = every_minute(Some(30));
        let decision =
            schedule_decision(at(10, 0, 0), Some(at(10, 4, 0)), &spec, at(10, 5, 20)).unwrap();
        assert_eq!(
            decision,
            ScheduleDecision::Fire {
                missed: at(10, 5, 0),
                next: Some(at(10, 6, 0)),
            }
        );
    }

    #[test]
    fn unbounded_wedge_hits_the_missed_run_guard() {
        // Two hours of every-minute activations with no deadline.
        let spec = every_minute(None);
        let result = next_schedule_time(at(8, 0, 0), Some(at(8, 0, 0)), &spec, at(10, 0, 0));
        assert_eq!(result, Err(ScheduleError::TooManyMissedRuns));
    }

    #[test]
    fn exactly_one_hundred_missed_runs_is_still_fine() {
        let spec = every_minute(None);
        // 100 activations between 8:00 and 9:40.
        let times =
            next_schedule_time(at(8, 0, 0), Some(at(8, 0, 0)), &spec, at(9, 40, 30)).unwrap();
        assert_eq!(times.missed, Some(at(9, 40, 0)));
    }

    #[test]
    fn bad_cron_is_not_retryable_noise() {
        let spec = ScheduleSpec {
            cron: Some("not a cron".to_string()),
            event: None,
            starting_deadline_seconds: None,
        };
        let result = next_schedule_time(at(10, 0, 0), None, &spec, at(10, 1, 0));
        assert!(matches!(result, Err(ScheduleError::Cron(_))));
    }
}
