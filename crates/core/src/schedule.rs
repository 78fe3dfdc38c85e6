use chrono::{DateTime, Duration, Months, Utc};

use crate::model::{BackupJob, Frequency};

/// Decides whether `job` is due at `now`.
///
/// Once a job has run, `next_run_at` is authoritative. The elapsed-hours
/// fallback only applies to rows that have a last run but no next run.
pub fn should_run(job: &BackupJob, now: DateTime<Utc>) -> bool {
    if !job.enabled {
        return false;
    }
    let Some(last_run) = job.last_run_at else {
        return true;
    };
    if let Some(next_run) = job.next_run_at {
        return now >= next_run;
    }

    let Some(frequency) = Frequency::parse(&job.frequency) else {
        return false;
    };
    let elapsed_hours = (now - last_run).num_milliseconds() as f64 / 3_600_000.0;
    elapsed_hours >= frequency.threshold_hours()
}

/// Next run time for `frequency` counted from `now`.
///
/// Monthly uses calendar months and clamps to the last day of a shorter
/// month. An unparseable frequency yields `now` itself.
pub fn compute_next_run(frequency: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(frequency) = Frequency::parse(frequency) else {
        return now;
    };
    match frequency {
        Frequency::Hourly => now + Duration::hours(1),
        Frequency::Every6Hours => now + Duration::hours(6),
        Frequency::Every12Hours => now + Duration::hours(12),
        Frequency::Daily => now + Duration::days(1),
        Frequency::Every3Days => now + Duration::days(3),
        Frequency::Weekly => now + Duration::days(7),
        Frequency::Monthly => now
            .checked_add_months(Months::new(1))
            .unwrap_or(now + Duration::days(30)),
        Frequency::Hours(hours) => now
            .checked_add_signed(Duration::hours(i64::from(hours)))
            .unwrap_or(now),
    }
}
