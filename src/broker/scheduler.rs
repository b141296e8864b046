//! Time- and cron-based job activation.
//!
//! Scheduled jobs sit in a time-ordered pending set; a single timer task
//! sleeps until the earliest due-at and promotes due entries through the
//! normal enqueue contract. The scheduler lock is never taken while the
//! broker-wide lock is held.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{GearError, Result};

use super::Broker;

/// Pending set keyed by `(fire-at epoch seconds, insertion sequence)` so
/// entries with the same due-at fire in insertion order.
#[derive(Debug, Default)]
struct SchedulerState {
    pending: BTreeMap<(i64, u64), String>,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a handle to fire at `at`, re-arming the timer task.
    pub fn schedule(&self, handle: String, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.seq += 1;
        let key = (at.timestamp(), state.seq);
        state.pending.insert(key, handle);
        drop(state);
        self.notify.notify_one();
    }

    /// Drop every pending entry for a handle (client cancel).
    pub fn cancel(&self, handle: &str) {
        self.lock().pending.retain(|_, h| h != handle);
    }

    /// Remove and return every entry due at or before `now`, in due-at order.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.lock();
        let later = state.pending.split_off(&(now.timestamp() + 1, 0));
        let due = std::mem::replace(&mut state.pending, later);
        due.into_values().collect()
    }

    pub fn next_fire_at(&self) -> Option<i64> {
        self.lock().pending.keys().next().map(|(ts, _)| *ts)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

/// Next matching instant for a five-field cron expression
/// (minute hour day-of-month month day-of-week); empty fields mean `*`.
pub fn cron_next(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    // The cron crate wants a seconds field in front.
    let full = format!("0 {}", expr.trim());
    let schedule =
        cron::Schedule::from_str(&full).map_err(|e| GearError::InvalidCron(e.to_string()))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| GearError::InvalidCron(format!("no future fire time for '{expr}'")))
}

/// Normalize the five wire fields of SUBMIT_JOB_SCHED into one expression.
pub fn cron_expr_from_fields(fields: &[&[u8]]) -> Result<String> {
    let mut parts = Vec::with_capacity(5);
    for field in fields {
        if field.is_empty() {
            parts.push("*".to_string());
        } else {
            let text = std::str::from_utf8(field)
                .map_err(|_| GearError::InvalidCron("non-utf8 cron field".to_string()))?;
            parts.push(text.to_string());
        }
    }
    Ok(parts.join(" "))
}

/// Timer loop: promote due entries, then sleep until the next due-at or
/// until a newly scheduled entry re-arms the timer.
pub async fn run(broker: std::sync::Arc<Broker>, cancel: CancellationToken) {
    tracing::debug!("Scheduler started");
    loop {
        let due = broker.scheduler.take_due(Utc::now());
        for handle in due {
            if let Err(e) = broker.fire_scheduled(&handle).await {
                tracing::error!(handle = %handle, error = %e, "Failed to fire scheduled job");
            }
        }

        let sleep_for = match broker.scheduler.next_fire_at() {
            Some(ts) => {
                let delta = ts - Utc::now().timestamp();
                Duration::from_secs(delta.max(0) as u64).max(Duration::from_millis(50))
            }
            // Nothing pending; sleep until a schedule() re-arms us.
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = broker.scheduler.notify.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    tracing::debug!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn due_entries_fire_in_due_at_order() {
        let scheduler = Scheduler::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        scheduler.schedule("late".into(), base + chrono::Duration::seconds(30));
        scheduler.schedule("early".into(), base + chrono::Duration::seconds(10));
        scheduler.schedule("mid".into(), base + chrono::Duration::seconds(20));

        let due = scheduler.take_due(base + chrono::Duration::seconds(60));
        assert_eq!(due, vec!["early", "mid", "late"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn future_entries_stay_pending() {
        let scheduler = Scheduler::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        scheduler.schedule("soon".into(), base + chrono::Duration::seconds(5));
        scheduler.schedule("later".into(), base + chrono::Duration::seconds(500));

        let due = scheduler.take_due(base + chrono::Duration::seconds(10));
        assert_eq!(due, vec!["soon"]);
        assert_eq!(scheduler.next_fire_at(), Some(base.timestamp() + 500));
    }

    #[test]
    fn cron_next_matches_minute_fields() {
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 30).unwrap();
        let next = cron_next("30 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap());

        let next = cron_next("0 0 * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn cron_rejects_garbage() {
        assert!(cron_next("not a cron", Utc::now()).is_err());
    }

    #[test]
    fn empty_sched_fields_become_wildcards() {
        let fields: Vec<&[u8]> = vec![b"5", b"", b"", b"", b""];
        assert_eq!(cron_expr_from_fields(&fields).unwrap(), "5 * * * *");
    }
}
