//! C. TimeFilter (spec.md §4.3) — partitions rows into resume-due,
//! pause-due and pending-retry-due candidates against the wall clock.
//! Sheet insertion order is preserved throughout; a row with a blank or
//! unparsable `scheduledTime` is silently skipped, never an error.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use log::trace;
use subcycle_model::{Row, Status};

#[derive(Debug, Clone, Copy)]
pub struct TimeFilterConfig {
    pub resume_lead_minutes: i64,
    pub pause_lag_minutes: i64,
    pub retry_cap: u32,
    pub pending_horizon_hours: i64,
}

impl Default for TimeFilterConfig {
    fn default() -> Self {
        Self {
            resume_lead_minutes: 5,
            pause_lag_minutes: 5,
            retry_cap: 5,
            pending_horizon_hours: 48,
        }
    }
}

/// The three due-lists for one cycle, in sheet order within each list.
#[derive(Debug, Default)]
pub struct DuePartitions<'r> {
    pub resume_due: Vec<&'r Row>,
    pub pause_due: Vec<&'r Row>,
    pub pending_due: Vec<&'r Row>,
}

/// Combine a row's local time-of-day with `today` to get a full timestamp.
fn scheduled_at(time_of_day: NaiveTime, today: NaiveDateTime) -> NaiveDateTime {
    NaiveDateTime::new(today.date(), time_of_day)
}

pub fn partition<'r>(
    rows: &'r [&'r Row],
    now: NaiveDateTime,
    config: TimeFilterConfig,
) -> DuePartitions<'r> {
    let mut out = DuePartitions::default();

    for &row in rows {
        if row.status.is_terminal() {
            continue;
        }

        if row.retry_count >= config.retry_cap {
            continue;
        }

        if row.status == Status::Paused {
            if let Some(time_of_day) = row.scheduled_time {
                let fire_at = scheduled_at(time_of_day, now);
                if fire_at <= now + Duration::minutes(config.resume_lead_minutes) {
                    out.resume_due.push(row);
                    continue;
                }
            }
        }

        if row.status == Status::Billing {
            if let Some(time_of_day) = row.scheduled_time {
                let fire_at = scheduled_at(time_of_day, now);
                if fire_at <= now - Duration::minutes(config.pause_lag_minutes) {
                    out.pause_due.push(row);
                    continue;
                }
            }
        }

        if let (Some(retry_at), Some(check_at)) = (row.pending_retry_at, row.pending_check_at) {
            let within_horizon = now - check_at < Duration::hours(config.pending_horizon_hours);
            if retry_at <= now && within_horizon {
                out.pending_due.push(row);
                continue;
            }
        }

        trace!("time filter: {} has nothing due this cycle", row.email);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, min: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, min, 0).unwrap()
    }

    fn today_at(hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, 27)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    #[test]
    fn paused_row_within_resume_lead_is_due() {
        let mut row = Row::new("a@example.com", Status::Paused);
        row.scheduled_time = Some(at(10, 3));
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert_eq!(parts.resume_due.len(), 1);
    }

    #[test]
    fn paused_row_far_in_the_future_is_not_due() {
        let mut row = Row::new("a@example.com", Status::Paused);
        row.scheduled_time = Some(at(23, 0));
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert!(parts.resume_due.is_empty());
    }

    #[test]
    fn billing_row_past_pause_lag_is_due() {
        let mut row = Row::new("a@example.com", Status::Billing);
        row.scheduled_time = Some(at(9, 50));
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert_eq!(parts.pause_due.len(), 1);
    }

    #[test]
    fn blank_scheduled_time_is_skipped_not_an_error() {
        let row = Row::new("a@example.com", Status::Paused);
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert!(parts.resume_due.is_empty());
        assert!(parts.pause_due.is_empty());
        assert!(parts.pending_due.is_empty());
    }

    #[test]
    fn row_at_or_over_retry_cap_is_never_due() {
        let mut row = Row::new("a@example.com", Status::Paused);
        row.scheduled_time = Some(at(10, 0));
        row.retry_count = 5;
        let now = today_at(10, 0);
        let rows = vec![&row];
        let config = TimeFilterConfig {
            retry_cap: 5,
            ..Default::default()
        };
        let parts = partition(&rows, now, config);
        assert!(parts.resume_due.is_empty());
    }

    #[test]
    fn pending_row_within_horizon_and_due_retry_is_selected() {
        let mut row = Row::new("a@example.com", Status::Billing);
        row.pending_check_at = Some(today_at(8, 0));
        row.pending_retry_at = Some(today_at(9, 55));
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert_eq!(parts.pending_due.len(), 1);
    }

    #[test]
    fn pending_row_past_horizon_is_not_selected_here() {
        let mut row = Row::new("a@example.com", Status::Billing);
        row.pending_check_at = Some(today_at(10, 0) - Duration::hours(49));
        row.pending_retry_at = Some(today_at(9, 55));
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert!(parts.pending_due.is_empty());
    }

    #[test]
    fn sheet_order_is_preserved_within_a_partition() {
        let mut first = Row::new("first@example.com", Status::Paused);
        first.scheduled_time = Some(at(10, 0));
        let mut second = Row::new("second@example.com", Status::Paused);
        second.scheduled_time = Some(at(10, 1));
        let now = today_at(10, 2);
        let rows = vec![&first, &second];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert_eq!(parts.resume_due[0].email, "first@example.com");
        assert_eq!(parts.resume_due[1].email, "second@example.com");
    }

    #[test]
    fn terminal_status_rows_are_never_selected() {
        let mut row = Row::new("a@example.com", Status::Expired);
        row.scheduled_time = Some(at(10, 0));
        let now = today_at(10, 0);
        let rows = vec![&row];
        let parts = partition(&rows, now, TimeFilterConfig::default());
        assert!(parts.resume_due.is_empty());
        assert!(parts.pause_due.is_empty());
    }

    use proptest::prelude::*;

    proptest! {
        /// spec.md §8: a row with `retry_count >= retry_cap` is never
        /// selected into any partition, for arbitrary counts and caps.
        #[test]
        fn row_at_or_over_retry_cap_is_never_selected(
            retry_count in 0u32..200,
            retry_cap in 0u32..200,
        ) {
            let mut row = Row::new("a@example.com", Status::Paused);
            row.scheduled_time = Some(at(10, 0));
            row.retry_count = retry_count;
            let now = today_at(10, 0);
            let rows = vec![&row];
            let config = TimeFilterConfig {
                retry_cap,
                ..Default::default()
            };
            let parts = partition(&rows, now, config);

            if retry_count >= retry_cap {
                prop_assert!(parts.resume_due.is_empty());
                prop_assert!(parts.pause_due.is_empty());
                prop_assert!(parts.pending_due.is_empty());
            }
        }
    }
}
