//! H. WorkerLoop (spec.md §4.8) — the scheduler proper. A single cooperative
//! tick loop per process: sync config, list rows, filter by lock, partition
//! by time, run resume-due rows before pause-due rows before pending-retry
//! rows, then sleep until the next tick.
//!
//! Shutdown is a single `tokio_util::sync::CancellationToken` threaded in
//! from the caller (the CLI binary owns the OS signal plumbing) rather than
//! a process-global flag, per the redesign notes this port follows.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use subcycle_classify::history::{HistoryLine, HistoryOutcome};
use subcycle_classify::{self as classify, PendingConfig, PendingDecision};
use subcycle_config::SharedConfig;
use subcycle_executor::{AccountData, ExecutionHints, TransitionExecutor};
use subcycle_lock::LockService;
use subcycle_model::{Row, Status, TransitionKind, TransitionOutcome};
use subcycle_notify::{NotificationEvent, Notifier};
use subcycle_profile::ProfileResolver;
use subcycle_sheet::{PermanentFailureUpdate, RetryableFailureUpdate, SheetError, SheetGateway, SuccessUpdate};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    Focus,
    Background,
}

impl WindowMode {
    fn is_window_mode(self) -> bool {
        matches!(self, WindowMode::Focus)
    }
}

/// What became of one row passed to `process_one` — used only for logging and
/// for the test suite; the sheet is the durable record of the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    SuccessAlready,
    RetryableFailure,
    PermanentFailure(Status),
    PendingSkipped,
    PendingHorizonExceeded,
    LoopQuarantined,
    LockNotAcquired,
    StatusMismatchAfterLock,
}

/// Summary of one full cycle, for the CLI's `--continuous`-less single-run mode.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub idle: bool,
    pub processed: usize,
}

pub struct WorkerLoop<'a> {
    sheet: &'a dyn SheetGateway,
    lock: &'a LockService<'a>,
    profiles: &'a ProfileResolver<'a>,
    executor: &'a dyn TransitionExecutor,
    notifier: &'a dyn Notifier,
    config: &'a SharedConfig<'a>,
    window_mode: WindowMode,
}

impl<'a> WorkerLoop<'a> {
    pub fn new(
        sheet: &'a dyn SheetGateway,
        lock: &'a LockService<'a>,
        profiles: &'a ProfileResolver<'a>,
        executor: &'a dyn TransitionExecutor,
        notifier: &'a dyn Notifier,
        config: &'a SharedConfig<'a>,
    ) -> Self {
        Self {
            sheet,
            lock,
            profiles,
            executor,
            notifier,
            config,
            window_mode: WindowMode::Background,
        }
    }

    pub fn with_window_mode(mut self, window_mode: WindowMode) -> Self {
        self.window_mode = window_mode;
        self
    }

    /// Runs cycles until `token` is cancelled. If `continuous` is false, runs
    /// exactly one cycle and returns regardless of the token.
    pub async fn run(&self, token: CancellationToken, continuous: bool) -> anyhow::Result<()> {
        loop {
            if token.is_cancelled() {
                info!("worker loop: shutdown signal observed, exiting cleanly");
                return Ok(());
            }

            let report = self.run_cycle(&token).await?;
            debug!("worker loop: cycle done, processed={}", report.processed);

            if !continuous {
                return Ok(());
            }

            let tunables = self.config.current().await;
            tokio::select! {
                _ = token.cancelled() => {
                    info!("worker loop: shutdown signal observed during sleep, exiting cleanly");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(tunables.check_interval_seconds)) => {}
            }
        }
    }

    /// One cycle per spec.md §4.8's pseudocode.
    pub async fn run_cycle(&self, token: &CancellationToken) -> anyhow::Result<CycleReport> {
        let tunables = self.config.sync().await;

        let rows = self.sheet.list_all_rows().await?;
        if rows.is_empty() {
            debug!("worker loop: no rows, idle cycle");
            return Ok(CycleReport {
                idle: true,
                processed: 0,
            });
        }

        let unlocked = self.lock.filter_unlocked(&rows);
        let time_config = subcycle_time::TimeFilterConfig {
            resume_lead_minutes: tunables.resume_lead_minutes,
            pause_lag_minutes: tunables.pause_lag_minutes,
            retry_cap: tunables.retry_cap,
            pending_horizon_hours: tunables.pending_horizon_hours,
        };
        let now = Utc::now().naive_utc();
        let partitions = subcycle_time::partition(&unlocked, now, time_config);

        let pending_config = PendingConfig {
            pending_retry_minutes: tunables.pending_retry_minutes,
            pending_horizon_hours: tunables.pending_horizon_hours,
        };

        let mut processed = 0usize;

        // Resume before pause: resuming a subscription is more time-critical
        // than pausing one already past its window (spec.md §4.8).
        for (kind, rows) in [
            (TransitionKind::Resume, &partitions.resume_due),
            (TransitionKind::Pause, &partitions.pause_due),
            (TransitionKind::Pause, &partitions.pending_due),
        ] {
            for row in rows {
                if token.is_cancelled() {
                    return Ok(CycleReport {
                        idle: false,
                        processed,
                    });
                }

                let Some(fresh) = self.sheet.refetch_by_email(&row.email).await? else {
                    debug!("worker loop: {} disappeared between selection and refetch", row.email);
                    continue;
                };
                if fresh.email != row.email {
                    continue;
                }
                if !status_matches_kind(fresh.status, kind) {
                    debug!("worker loop: {} status changed concurrently, skipping", fresh.email);
                    continue;
                }

                self.process_one(&fresh, kind, pending_config).await;
                processed += 1;
            }
        }

        Ok(CycleReport {
            idle: false,
            processed,
        })
    }

    /// spec.md §4.8 `processOne`. Exposed (not just used by `run_cycle`) so
    /// `subcycle-batch` can drive the exact same executor/classifier path
    /// over an explicit task list instead of a time-filtered selection.
    pub async fn process_one(
        &self,
        row: &Row,
        kind: TransitionKind,
        pending_config: PendingConfig,
    ) -> ProcessOutcome {
        if !self.lock.acquire(&row.email).await.unwrap_or(false) {
            debug!("worker loop: {} lock not acquired, skipping this cycle", row.email);
            return ProcessOutcome::LockNotAcquired;
        }

        let refreshed = match self.sheet.refetch_by_email(&row.email).await {
            Ok(Some(r)) => r,
            _ => {
                let _ = self.lock.release(&row.email).await;
                return ProcessOutcome::LockNotAcquired;
            }
        };
        if !status_matches_kind(refreshed.status, kind) {
            let _ = self.lock.release(&row.email).await;
            return ProcessOutcome::StatusMismatchAfterLock;
        }

        let profile_id = self.profiles.resolve(&row.email).await.unwrap_or(None);
        let account = AccountData::from(&refreshed);
        let hints = ExecutionHints {
            retry_count: refreshed.retry_count,
            debug_mode: false,
            window_mode: self.window_mode.is_window_mode(),
        };

        let mut result = self
            .executor
            .execute(profile_id.as_deref(), &account, kind, hints)
            .await;

        // Image-CAPTCHA in-cycle retry (spec.md §4.6): one re-invocation
        // after a simulated browser restart, then the second result stands.
        if result.status == subcycle_model::ExecutorStatus::ImageCaptchaTransient {
            tokio::time::sleep(Duration::from_secs(3)).await;
            result = self
                .executor
                .execute(profile_id.as_deref(), &account, kind, hints)
                .await;
        }

        self.apply_outcome(&refreshed, kind, result, pending_config)
            .await
    }

    async fn apply_outcome(
        &self,
        row: &Row,
        kind: TransitionKind,
        result: subcycle_model::TransitionResult,
        pending_config: PendingConfig,
    ) -> ProcessOutcome {
        let outcome = classify::classify(&result);
        let now = Utc::now().naive_utc();
        let worker_id = self.lock.worker_id().as_str();
        let lang = result.detected_language.as_deref().unwrap_or("en");

        match outcome {
            TransitionOutcome::SuccessNew | TransitionOutcome::SuccessAlready => {
                // Loop check happens before the write, per spec.md §4.8 step 6.
                if classify::is_looping(&row.result_history, kind) {
                    let line = HistoryLine {
                        kind,
                        lang,
                        outcome: HistoryOutcome::NewSuccess,
                        timestamp: now,
                        worker_id,
                        detail: Some("loop quarantine"),
                    }
                    .render();
                    let update = PermanentFailureUpdate {
                        new_status: Status::ManualCheckLoop,
                        result_line: line,
                        ip: result.observed_ip.clone(),
                        proxy_id: result.observed_proxy_id.clone(),
                    };
                    if let Err(err) = self.sheet.record_permanent_failure(&row.email, update).await {
                        warn!("worker loop: failed to record loop quarantine for {}: {err}", row.email);
                    }
                    self.notifier
                        .notify(NotificationEvent::critical("loop quarantine").for_row(&row.email))
                        .await;
                    return ProcessOutcome::LoopQuarantined;
                }

                let history_outcome = if outcome == TransitionOutcome::SuccessAlready {
                    HistoryOutcome::Already
                } else {
                    HistoryOutcome::NewSuccess
                };
                let line = HistoryLine {
                    kind,
                    lang,
                    outcome: history_outcome,
                    timestamp: now,
                    worker_id,
                    detail: None,
                }
                .render();
                let update = SuccessUpdate {
                    new_status: kind.target_status(),
                    result_line: line,
                    ip: result.observed_ip.clone(),
                    proxy_id: result.observed_proxy_id.clone(),
                    next_billing_date: result.next_billing_date,
                };
                if let Err(err) = self.sheet.record_success(&row.email, update).await {
                    warn!("worker loop: failed to record success for {}: {err}", row.email);
                }
                if outcome == TransitionOutcome::SuccessAlready {
                    ProcessOutcome::SuccessAlready
                } else {
                    ProcessOutcome::Success
                }
            }

            TransitionOutcome::PermanentFailure(status) => {
                let line = HistoryLine {
                    kind,
                    lang,
                    outcome: HistoryOutcome::Failure,
                    timestamp: now,
                    worker_id,
                    detail: result.error_message.as_deref(),
                }
                .render();
                let update = PermanentFailureUpdate {
                    new_status: status,
                    result_line: line,
                    ip: result.observed_ip.clone(),
                    proxy_id: result.observed_proxy_id.clone(),
                };
                if let Err(err) = self.sheet.record_permanent_failure(&row.email, update).await {
                    warn!("worker loop: failed to record permanent failure for {}: {err}", row.email);
                }
                self.notifier
                    .notify(
                        NotificationEvent::critical(format!("permanent failure: {status}"))
                            .for_row(&row.email),
                    )
                    .await;
                ProcessOutcome::PermanentFailure(status)
            }

            TransitionOutcome::PaymentPending => {
                self.apply_payment_pending(row, kind, result, pending_config, now, worker_id, lang)
                    .await
            }

            TransitionOutcome::ImageCaptchaRetry => {
                // Should not reach here: process_one already consumed the
                // in-cycle retry before classifying. Treat a stray second
                // CAPTCHA response as a retryable failure rather than panic.
                self.record_retryable(row, kind, &result, now, worker_id, lang).await
            }

            TransitionOutcome::RetryableFailure => {
                self.record_retryable(row, kind, &result, now, worker_id, lang).await
            }
        }
    }

    async fn record_retryable(
        &self,
        row: &Row,
        kind: TransitionKind,
        result: &subcycle_model::TransitionResult,
        now: chrono::NaiveDateTime,
        worker_id: &str,
        lang: &str,
    ) -> ProcessOutcome {
        let line = HistoryLine {
            kind,
            lang,
            outcome: HistoryOutcome::Failure,
            timestamp: now,
            worker_id,
            detail: result.error_message.as_deref(),
        }
        .render();
        let update = RetryableFailureUpdate {
            result_line: line,
            ip: result.observed_ip.clone(),
            proxy_id: result.observed_proxy_id.clone(),
        };
        match self.sheet.record_retryable_failure(&row.email, update).await {
            Ok(new_count) => {
                let tunables = self.config.current().await;
                if new_count >= tunables.retry_cap {
                    self.notifier
                        .notify(
                            NotificationEvent::critical("retry cap reached").for_row(&row.email),
                        )
                        .await;
                }
            }
            Err(err) => warn!("worker loop: failed to record retryable failure for {}: {err}", row.email),
        }
        ProcessOutcome::RetryableFailure
    }

    async fn apply_payment_pending(
        &self,
        row: &Row,
        kind: TransitionKind,
        result: subcycle_model::TransitionResult,
        pending_config: PendingConfig,
        now: chrono::NaiveDateTime,
        worker_id: &str,
        lang: &str,
    ) -> ProcessOutcome {
        // A `pendingCheckAt` cell that failed to parse never makes it into
        // `Row` at all (the sheet layer already maps it to `None`), so an
        // absent value here covers both "first observation" and "corrupt
        // cell" — matching spec.md §4.7's "restart the clock" guidance.
        match classify::decide_pending(now, row.pending_check_at, pending_config) {
            PendingDecision::FirstObservation {
                pending_check_at,
                pending_retry_at,
            } => {
                let line = HistoryLine {
                    kind,
                    lang,
                    outcome: HistoryOutcome::Pending,
                    timestamp: now,
                    worker_id,
                    detail: result.payment_pending_reason.as_deref(),
                }
                .render();
                if let Err(err) = self.sheet.set_pending_check_at(&row.email, pending_check_at).await {
                    warn!("worker loop: failed to set pendingCheckAt for {}: {err}", row.email);
                }
                if let Err(err) = self.sheet.set_pending_retry_at(&row.email, pending_retry_at).await {
                    warn!("worker loop: failed to set pendingRetryAt for {}: {err}", row.email);
                }
                if let Err(err) = self.sheet.append_pending_observation(&row.email, &line).await {
                    warn!("worker loop: failed to append pending observation for {}: {err}", row.email);
                }
                ProcessOutcome::PendingSkipped
            }
            PendingDecision::Resnooze { pending_retry_at } => {
                if let Err(err) = self.sheet.set_pending_retry_at(&row.email, pending_retry_at).await {
                    warn!("worker loop: failed to re-snooze pendingRetryAt for {}: {err}", row.email);
                }
                let _ = self.lock.release(&row.email).await;
                ProcessOutcome::PendingSkipped
            }
            PendingDecision::HorizonExceeded => {
                let line = HistoryLine {
                    kind,
                    lang,
                    outcome: HistoryOutcome::Pending,
                    timestamp: now,
                    worker_id,
                    detail: Some("pending horizon exceeded"),
                }
                .render();
                let update = PermanentFailureUpdate {
                    new_status: Status::ManualCheckPaymentDelay,
                    result_line: line,
                    ip: result.observed_ip.clone(),
                    proxy_id: result.observed_proxy_id.clone(),
                };
                if let Err(err) = self.sheet.record_permanent_failure(&row.email, update).await {
                    warn!("worker loop: failed to record payment delay for {}: {err}", row.email);
                }
                let _ = self.sheet.clear_pending_columns(&row.email).await;
                self.notifier
                    .notify(
                        NotificationEvent::critical("payment pending horizon exceeded")
                            .for_row(&row.email),
                    )
                    .await;
                ProcessOutcome::PendingHorizonExceeded
            }
        }
    }
}

fn status_matches_kind(status: Status, kind: TransitionKind) -> bool {
    match kind {
        TransitionKind::Resume => status == Status::Paused,
        TransitionKind::Pause => status == Status::Billing,
    }
}

/// Wraps a `SheetError` surfaced outside `processOne`'s boundary (row
/// listing, config sync) so a single bad cycle can be logged and retried
/// rather than crashing the worker — spec.md §7 error class 6.
pub fn is_infra_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SheetError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use subcycle_config::TunableOverrides;
    use subcycle_executor::ScriptedExecutor;
    use subcycle_lock::WorkerId;
    use subcycle_model::{ExecutorStatus, TransitionResult};
    use subcycle_notify::RecordingNotifier;
    use subcycle_sheet::memory::MemorySheetGateway;

    #[tokio::test]
    async fn resume_success_flips_status_and_clears_retry() {
        let mut row = Row::new("a@example.com", Status::Paused);
        row.scheduled_time = Some(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        row.retry_count = 2;
        let gw = MemorySheetGateway::new(vec![row]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(TransitionResult::success(TransitionKind::Resume));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);

        let token = CancellationToken::new();
        let report = worker.run_cycle(&token).await.unwrap();
        assert_eq!(report.processed, 1);

        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(row.status, Status::Billing);
        assert_eq!(row.retry_count, 0);
        assert!(row.lock_token.is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_sets_terminal_status_and_notifies() {
        let mut row = Row::new("a@example.com", Status::Billing);
        row.scheduled_time = Some(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        let gw = MemorySheetGateway::new(vec![row]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(TransitionResult::failure(
            TransitionKind::Pause,
            ExecutorStatus::SubscriptionExpired,
            "expired",
        ));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);

        let token = CancellationToken::new();
        worker.run_cycle(&token).await.unwrap();

        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(row.status, Status::Expired);
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn idle_cycle_on_empty_sheet() {
        let gw = MemorySheetGateway::new(vec![]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(TransitionResult::success(TransitionKind::Resume));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);

        let token = CancellationToken::new();
        let report = worker.run_cycle(&token).await.unwrap();
        assert!(report.idle);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_processing_the_row() {
        let mut row = Row::new("a@example.com", Status::Paused);
        row.scheduled_time = Some(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        let gw = MemorySheetGateway::new(vec![row]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(TransitionResult::success(TransitionKind::Resume));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);

        let token = CancellationToken::new();
        token.cancel();
        let report = worker.run_cycle(&token).await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn loop_quarantine_overrides_a_natural_success() {
        let mut row = Row::new("a@example.com", Status::Paused);
        row.scheduled_time = Some(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        row.result_history = "✅ resume (en) new-success | t | w\n\
                               ✅ resume (en) already | t | w\n\
                               ✅ resume (en) already | t | w"
            .to_string();
        let gw = MemorySheetGateway::new(vec![row]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(TransitionResult::success(TransitionKind::Resume));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);

        let token = CancellationToken::new();
        worker.run_cycle(&token).await.unwrap();

        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(row.status, Status::ManualCheckLoop);
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn first_payment_pending_sets_both_columns_and_releases_lock() {
        let mut row = Row::new("a@example.com", Status::Billing);
        row.scheduled_time = Some(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        let gw = MemorySheetGateway::new(vec![row]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let mut pending_result = TransitionResult::success(TransitionKind::Pause);
        pending_result.success = false;
        pending_result.status = ExecutorStatus::PaymentPending;
        let executor = ScriptedExecutor::new(pending_result);
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);

        let token = CancellationToken::new();
        worker.run_cycle(&token).await.unwrap();

        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        assert!(row.pending_check_at.is_some());
        assert!(row.pending_retry_at.is_some());
        assert!(row.lock_token.is_empty());
    }

    #[test]
    fn status_matches_kind_table() {
        assert!(status_matches_kind(Status::Paused, TransitionKind::Resume));
        assert!(!status_matches_kind(Status::Billing, TransitionKind::Resume));
        assert!(status_matches_kind(Status::Billing, TransitionKind::Pause));
    }
}
