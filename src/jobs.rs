use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, TimeZone};
use chrono_tz::Tz;
use tracing::{error, info};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;
use crate::push::PushSender;
use crate::reminders;

/// Time until the next local `at` strictly after `now`.
pub fn until_next_run(tz: Tz, now: Ms, at: NaiveTime) -> Duration {
    let Some(local_now) = crate::calendar::local_datetime(tz, now) else {
        return Duration::from_secs(3600);
    };
    let mut date = local_now.date();
    // Two days ahead is enough even when `at` falls in a DST gap on one of them.
    for _ in 0..3 {
        if let Some(next) = tz.from_local_datetime(&date.and_time(at)).earliest() {
            let next = next.timestamp_millis();
            if next > now {
                return Duration::from_millis((next - now) as u64);
            }
        }
        match date.succ_opt() {
            Some(d) => date = d,
            None => break,
        }
    }
    Duration::from_secs(3600)
}

/// Run the reminder dispatcher once a day at local `at`.
pub async fn run_reminders(engine: Arc<Engine>, sender: Arc<dyn PushSender>, at: NaiveTime) {
    loop {
        let wait = until_next_run(engine.tz(), now_ms(), at);
        info!(in_secs = wait.as_secs(), "next reminder run scheduled");
        tokio::time::sleep(wait).await;

        match reminders::dispatch_reminders(&engine, sender.as_ref(), now_ms()).await {
            Ok(_) => {
                metrics::counter!(crate::observability::REMINDER_RUNS_TOTAL, "status" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::REMINDER_RUNS_TOTAL, "status" => "error").increment(1);
                error!("reminder run failed: {e}");
            }
        }
    }
}

/// Compact the WAL whenever more than `threshold` commits were appended since
/// the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends <= threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
                info!(appends, "WAL compacted");
            }
            Err(e) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                error!("WAL compaction failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Madrid;

    fn madrid(rfc3339: &str) -> Ms {
        chrono::DateTime::parse_from_rfc3339(rfc3339).unwrap().timestamp_millis()
    }

    fn two_pm() -> NaiveTime {
        NaiveTime::from_hms_opt(14, 0, 0).unwrap()
    }

    #[test]
    fn next_run_later_today() {
        let now = madrid("2025-06-10T13:00:00+02:00");
        assert_eq!(until_next_run(Madrid, now, two_pm()), Duration::from_secs(3600));
    }

    #[test]
    fn next_run_tomorrow_once_passed() {
        let now = madrid("2025-06-10T15:00:00+02:00");
        assert_eq!(until_next_run(Madrid, now, two_pm()), Duration::from_secs(23 * 3600));
    }

    #[test]
    fn exactly_at_run_time_waits_a_day() {
        let now = madrid("2025-06-10T14:00:00+02:00");
        assert_eq!(until_next_run(Madrid, now, two_pm()), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn spring_forward_night_is_shorter() {
        // Clocks jump 02:00 → 03:00 on 2025-03-30
        let now = madrid("2025-03-29T15:00:00+01:00");
        assert_eq!(until_next_run(Madrid, now, two_pm()), Duration::from_secs(22 * 3600));
    }
}
