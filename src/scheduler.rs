//! Timer-driven reset jobs.
//!
//! The daily job fires at every midnight, the weekly job at the midnight that
//! starts Monday. Both run until the cancellation token fires.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetJob {
    Daily,
    Weekly,
}

impl ResetJob {
    /// Next firing time strictly after `now`.
    pub fn next_run(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = (now.date_naive() + Duration::days(1)).and_time(NaiveTime::MIN);
        let next = match self {
            ResetJob::Daily => midnight,
            ResetJob::Weekly => {
                let ahead = (7 - midnight.weekday().num_days_from_monday()) % 7;
                midnight + Duration::days(i64::from(ahead))
            }
        };
        Utc.from_utc_datetime(&next)
    }

    fn name(self) -> &'static str {
        match self {
            ResetJob::Daily => "daily",
            ResetJob::Weekly => "weekly",
        }
    }

    async fn run_once(self, engine: &Engine) {
        let result = match self {
            ResetJob::Daily => engine.run_daily_reset().await.map(|n| n as usize),
            ResetJob::Weekly => engine.run_weekly_reset().await,
        };
        if let Err(err) = result {
            log::error!("The {} reset failed: {}", self.name(), err);
        }
    }
}

pub async fn run(
    job: ResetJob,
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    log::info!("Started {} reset job", job.name());
    loop {
        let now = clock.now();
        let wait = (job.next_run(now) - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Stopping {} reset job", job.name());
                break;
            }
            _ = tokio::time::sleep(wait) => job.run_once(&engine).await,
        }
    }
}

pub fn spawn(
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    [ResetJob::Daily, ResetJob::Weekly]
        .into_iter()
        .map(|job| tokio::spawn(run(job, engine.clone(), clock.clone(), cancel.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Policy;
    use crate::memory::MemoryStore;
    use crate::notify::LogNotifier;
    use chrono::Weekday;

    fn is_week_start(at: DateTime<Utc>) -> bool {
        at.weekday() == Weekday::Mon && at.time() == NaiveTime::MIN
    }

    #[test]
    fn daily_fires_at_next_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 6, 5, 13, 30, 0).unwrap();
        assert_eq!(
            ResetJob::Daily.next_run(now),
            Utc.with_ymd_and_hms(2024, 6, 6, 0, 0, 0).unwrap()
        );
        let midnight = Utc.with_ymd_and_hms(2024, 6, 6, 0, 0, 0).unwrap();
        assert_eq!(
            ResetJob::Daily.next_run(midnight),
            Utc.with_ymd_and_hms(2024, 6, 7, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn weekly_fires_at_start_of_monday() {
        for day in 3..=9 {
            let now = Utc.with_ymd_and_hms(2024, 6, day, 8, 0, 0).unwrap();
            let next = ResetJob::Weekly.next_run(now);
            assert!(is_week_start(next), "{} -> {}", now, next);
            assert!(next > now && next - now <= Duration::days(7));
        }
        // Sunday evening rolls into the following day
        let sunday = Utc.with_ymd_and_hms(2024, 6, 9, 23, 0, 0).unwrap();
        assert_eq!(
            ResetJob::Weekly.next_run(sunday),
            Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn jobs_stop_on_cancel() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LogNotifier),
            clock.clone(),
            Policy::default(),
        ));
        let cancel = CancellationToken::new();
        let handles = spawn(engine, clock, cancel.clone());
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
