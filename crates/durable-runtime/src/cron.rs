//! Host-supplied cron driver interface (§6 expansion). The core never
//! parses cron strings itself; with the `cron` feature enabled, jobs
//! can instead name a standard cron expression and get a
//! [`cron::Schedule`]-backed implementation for free. `run_loop` is the
//! part of the core that *does* belong here: ticking each job's
//! schedule and triggering it is orchestration, not cron-string syntax.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

use crate::queue::QueueInner;

pub trait CronSchedule: Send + Sync {
    /// The next fire time strictly after `after`, if the schedule has one.
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Turns one job's `cron` option string into a live [`CronSchedule`].
/// The crate never parses cron syntax itself (§1); [`cron_feature_factory`]
/// is the default used when the `cron` feature is enabled, wiring in the
/// `cron` crate's own parser. A host without that feature can still
/// supply its own factory via `QueueConfig::cron_factory`.
pub type CronFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn CronSchedule>, String> + Send + Sync>;

#[cfg(feature = "cron")]
pub struct CronExpression(pub cron::Schedule);

#[cfg(feature = "cron")]
impl CronSchedule for CronExpression {
    fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.0.after(&after).next()
    }
}

#[cfg(feature = "cron")]
impl std::str::FromStr for CronExpression {
    type Err = cron::error::Error;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        Ok(Self(expr.parse()?))
    }
}

#[cfg(feature = "cron")]
pub fn cron_feature_factory() -> CronFactory {
    Arc::new(|expr: &str| {
        expr.parse::<CronExpression>()
            .map(|schedule| Arc::new(schedule) as Arc<dyn CronSchedule>)
            .map_err(|error| error.to_string())
    })
}

/// One task per `Queue` with at least one cron-scheduled job: sleeps
/// until the earliest next fire time across every job's schedule, then
/// triggers whichever job(s) came due. `fired_at` rides along in the
/// trigger input so each firing gets its own `(queue, job, key)` row
/// instead of colliding with the previous one under the task dedup
/// invariant (§3).
pub(crate) async fn run_loop(inner: Arc<QueueInner>) {
    let mut next_fire: HashMap<String, DateTime<Utc>> = HashMap::new();

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let now = Utc::now();
        let mut sleep_until: Option<DateTime<Utc>> = None;

        for (job_id, schedule) in inner.cron_schedules.iter() {
            let due = *next_fire
                .entry(job_id.clone())
                .or_insert_with(|| schedule.next_fire_after(now).unwrap_or(now));

            if due <= now {
                let input = serde_json::json!({ "cron": true, "fired_at": due.to_rfc3339() });
                if let Err(error) = inner.trigger_job(job_id, input).await {
                    tracing::error!(job = %job_id, %error, "cron-triggered dispatch failed");
                }
                let rescheduled = schedule.next_fire_after(now);
                match rescheduled {
                    Some(at) => {
                        next_fire.insert(job_id.clone(), at);
                        sleep_until = Some(sleep_until.map_or(at, |s| s.min(at)));
                    }
                    None => {
                        next_fire.remove(job_id);
                    }
                }
            } else {
                sleep_until = Some(sleep_until.map_or(due, |s| s.min(due)));
            }
        }

        let wait = match sleep_until {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(StdDuration::from_millis(250)),
            None => StdDuration::from_secs(3600),
        };
        tokio::time::sleep(wait.max(StdDuration::from_millis(250))).await;
    }
}
