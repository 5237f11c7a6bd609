//! I. BatchProcessor (spec.md §4.9) — the ad-hoc alternative entry point for
//! interactive operators. Takes an explicit task list instead of a
//! time-filtered selection, fans out under a bounded concurrency limit with
//! per-task and per-batch pacing, and runs exactly one retry pass.
//!
//! Lifecycle events are a typed enum, not string-keyed names, per the
//! redesign notes this port follows — a consuming dashboard matches on the
//! variant instead of parsing an event-name string.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, info};
use serde::Serialize;
use subcycle_classify::PendingConfig;
use subcycle_model::{Row, TransitionKind};
use subcycle_sheet::SheetGateway;
use subcycle_worker::{ProcessOutcome, WorkerLoop};

#[derive(Debug, Clone)]
pub struct Task {
    pub email: String,
    pub kind: TransitionKind,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub retry_enabled: bool,
    pub inter_task_delay: Duration,
    pub inter_batch_delay: Duration,
    pub pending: PendingConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 25,
            retry_enabled: false,
            inter_task_delay: Duration::from_millis(0),
            inter_batch_delay: Duration::from_millis(0),
            pending: PendingConfig::default(),
        }
    }
}

/// Lifecycle events a consumer (e.g. an interactive progress dashboard)
/// subscribes to (spec.md §4.9 step 6).
#[derive(Debug, Clone, Serialize)]
pub enum LifecycleEvent {
    BatchStart { index: usize, size: usize },
    TaskComplete { email: String },
    TaskFailed { email: String, message: String },
    TaskSkipped { email: String },
    Progress { done: usize, total: usize },
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct BatchProcessor<'a> {
    sheet: &'a dyn SheetGateway,
    worker: &'a WorkerLoop<'a>,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(sheet: &'a dyn SheetGateway, worker: &'a WorkerLoop<'a>) -> Self {
        Self { sheet, worker }
    }

    pub async fn run(
        &self,
        tasks: Vec<Task>,
        config: BatchConfig,
        on_event: &(dyn Fn(LifecycleEvent) + Sync),
    ) -> anyhow::Result<BatchReport> {
        let total = tasks.len();
        let mut report = BatchReport::default();
        let mut done = 0usize;
        let mut failures = Vec::new();

        let batch_count = tasks.chunks(config.batch_size).count();
        for (index, batch) in tasks.chunks(config.batch_size).enumerate() {
            on_event(LifecycleEvent::BatchStart {
                index,
                size: batch.len(),
            });

            let outcomes = self.run_one_pass(batch, &config, on_event).await?;
            for (task, outcome) in outcomes {
                done += 1;
                on_event(LifecycleEvent::Progress { done, total });
                self.tally(&task, outcome, &mut report, &mut failures);
            }

            if index + 1 < batch_count {
                tokio::time::sleep(config.inter_batch_delay).await;
            }
        }

        if config.retry_enabled && !failures.is_empty() {
            info!("batch processor: retry pass over {} failed task(s)", failures.len());
            // retryCap is forced to 0 for the retry pass to prevent recursion
            // (spec.md §4.9 step 5) — a task failing twice in one batch run
            // is reported as failed, not queued for a third attempt.
            let retry_config = BatchConfig {
                retry_enabled: false,
                ..config
            };
            let outcomes = self.run_one_pass(&failures, &retry_config, on_event).await?;
            report.failed = 0;
            for (task, outcome) in outcomes {
                self.tally(&task, outcome, &mut report, &mut Vec::new());
            }
        }

        Ok(report)
    }

    async fn run_one_pass(
        &self,
        tasks: &[Task],
        config: &BatchConfig,
        on_event: &(dyn Fn(LifecycleEvent) + Sync),
    ) -> anyhow::Result<Vec<(Task, ProcessOutcome)>> {
        if config.concurrency <= 1 {
            // Preserved verbatim: under forced-serial execution the
            // interTaskDelay applies between successive tasks; true
            // parallelism (C > 1) never delays between tasks at all.
            let mut results = Vec::with_capacity(tasks.len());
            for (i, task) in tasks.iter().enumerate() {
                let outcome = self.run_task(task, config.pending, on_event).await;
                results.push((task.clone(), outcome));
                if i + 1 < tasks.len() {
                    tokio::time::sleep(config.inter_task_delay).await;
                }
            }
            return Ok(results);
        }

        let results: Vec<(Task, ProcessOutcome)> = stream::iter(tasks.iter().cloned())
            .map(|task| async move {
                let outcome = self.run_task(&task, config.pending, on_event).await;
                (task, outcome)
            })
            .buffer_unordered(config.concurrency)
            .collect()
            .await;
        Ok(results)
    }

    async fn run_task(
        &self,
        task: &Task,
        pending_config: PendingConfig,
        on_event: &(dyn Fn(LifecycleEvent) + Sync),
    ) -> ProcessOutcome {
        let row = match self.sheet.refetch_by_email(&task.email).await {
            Ok(Some(row)) => row,
            _ => {
                on_event(LifecycleEvent::TaskSkipped {
                    email: task.email.clone(),
                });
                return ProcessOutcome::LockNotAcquired;
            }
        };

        let outcome = self.worker.process_one(&row, task.kind, pending_config).await;
        self.emit_for_outcome(&row, &outcome, on_event);
        outcome
    }

    fn emit_for_outcome(
        &self,
        row: &Row,
        outcome: &ProcessOutcome,
        on_event: &(dyn Fn(LifecycleEvent) + Sync),
    ) {
        match outcome {
            ProcessOutcome::Success => {
                on_event(LifecycleEvent::TaskComplete {
                    email: row.email.clone(),
                });
            }
            // An already-in-target-state result is a no-op from the
            // operator's point of view: nothing changed, so it is reported
            // as skipped even though the sheet write still recorded the
            // "already" history line (spec.md §4.9 step 4).
            ProcessOutcome::SuccessAlready
            | ProcessOutcome::LockNotAcquired
            | ProcessOutcome::StatusMismatchAfterLock
            | ProcessOutcome::PendingSkipped => {
                on_event(LifecycleEvent::TaskSkipped {
                    email: row.email.clone(),
                });
            }
            ProcessOutcome::RetryableFailure => {
                on_event(LifecycleEvent::TaskFailed {
                    email: row.email.clone(),
                    message: "retryable failure".to_string(),
                });
            }
            ProcessOutcome::PermanentFailure(status) => {
                on_event(LifecycleEvent::TaskFailed {
                    email: row.email.clone(),
                    message: format!("permanent failure: {status}"),
                });
            }
            ProcessOutcome::PendingHorizonExceeded => {
                on_event(LifecycleEvent::TaskFailed {
                    email: row.email.clone(),
                    message: "payment pending horizon exceeded".to_string(),
                });
            }
            ProcessOutcome::LoopQuarantined => {
                on_event(LifecycleEvent::TaskFailed {
                    email: row.email.clone(),
                    message: "loop quarantine".to_string(),
                });
            }
        }
    }

    fn tally(
        &self,
        task: &Task,
        outcome: ProcessOutcome,
        report: &mut BatchReport,
        failures: &mut Vec<Task>,
    ) {
        match outcome {
            ProcessOutcome::Success => report.completed += 1,
            ProcessOutcome::SuccessAlready
            | ProcessOutcome::LockNotAcquired
            | ProcessOutcome::StatusMismatchAfterLock
            | ProcessOutcome::PendingSkipped => report.skipped += 1,
            ProcessOutcome::RetryableFailure => {
                report.failed += 1;
                failures.push(task.clone());
            }
            ProcessOutcome::PermanentFailure(_)
            | ProcessOutcome::PendingHorizonExceeded
            | ProcessOutcome::LoopQuarantined => {
                report.failed += 1;
            }
        }
        debug!("batch processor: {} -> {:?}", task.email, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use subcycle_config::{SharedConfig, TunableOverrides};
    use subcycle_executor::ScriptedExecutor;
    use subcycle_lock::{LockService, WorkerId};
    use subcycle_model::Status;
    use subcycle_notify::RecordingNotifier;
    use subcycle_profile::ProfileResolver;
    use subcycle_sheet::memory::MemorySheetGateway;

    fn row(email: &str, status: Status) -> Row {
        Row::new(email, status)
    }

    #[tokio::test]
    async fn concurrency_one_applies_inter_task_delay_and_runs_serially() {
        let gw = MemorySheetGateway::new(vec![
            row("a@example.com", Status::Paused),
            row("b@example.com", Status::Paused),
        ]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(subcycle_model::TransitionResult::success(
            TransitionKind::Resume,
        ));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);
        let batch = BatchProcessor::new(&gw, &worker);

        let tasks = vec![
            Task {
                email: "a@example.com".into(),
                kind: TransitionKind::Resume,
            },
            Task {
                email: "b@example.com".into(),
                kind: TransitionKind::Resume,
            },
        ];
        let batch_config = BatchConfig {
            concurrency: 1,
            batch_size: 10,
            ..Default::default()
        };

        let events: Mutex<Vec<LifecycleEvent>> = Mutex::new(Vec::new());
        let on_event = |e: LifecycleEvent| events.lock().unwrap().push(e);
        let report = batch.run(tasks, batch_config, &on_event).await.unwrap();
        assert_eq!(report.completed, 2);
    }

    #[tokio::test]
    async fn already_in_target_state_is_reported_as_skipped() {
        let gw = MemorySheetGateway::new(vec![row("a@example.com", Status::Paused)]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let mut result = subcycle_model::TransitionResult::success(TransitionKind::Resume);
        result.status = subcycle_model::ExecutorStatus::AlreadyInTargetState;
        let executor = ScriptedExecutor::new(result);
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);
        let batch = BatchProcessor::new(&gw, &worker);

        let tasks = vec![Task {
            email: "a@example.com".into(),
            kind: TransitionKind::Resume,
        }];
        let events: Mutex<Vec<LifecycleEvent>> = Mutex::new(Vec::new());
        let on_event = |e: LifecycleEvent| events.lock().unwrap().push(e);
        let report = batch
            .run(tasks, BatchConfig::default(), &on_event)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.completed, 0);
    }

    #[tokio::test]
    async fn retry_pass_runs_exactly_once_with_retry_cap_forced_off() {
        let gw = MemorySheetGateway::new(vec![row("a@example.com", Status::Paused)]);
        let lock = LockService::new(&gw, WorkerId::generate());
        let profiles = ProfileResolver::new(&gw);
        let executor = ScriptedExecutor::new(subcycle_model::TransitionResult::failure(
            TransitionKind::Resume,
            subcycle_model::ExecutorStatus::GenericFailure,
            "flaky",
        ));
        let notifier = RecordingNotifier::new();
        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let worker = WorkerLoop::new(&gw, &lock, &profiles, &executor, &notifier, &config);
        let batch = BatchProcessor::new(&gw, &worker);

        let tasks = vec![Task {
            email: "a@example.com".into(),
            kind: TransitionKind::Resume,
        }];
        let batch_config = BatchConfig {
            retry_enabled: true,
            ..Default::default()
        };
        let events: Mutex<Vec<LifecycleEvent>> = Mutex::new(Vec::new());
        let on_event = |e: LifecycleEvent| events.lock().unwrap().push(e);
        let report = batch.run(tasks, batch_config, &on_event).await.unwrap();
        assert_eq!(report.failed, 1);

        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        // Two attempts total: the first pass plus one retry pass.
        assert_eq!(row.retry_count, 2);
    }
}
