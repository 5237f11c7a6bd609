//! F. ResultClassifier, the payment-pending sub-state-machine (spec.md §4.7)
//! and J. LoopDetector (spec.md §4.10).

pub mod history;

use chrono::{Duration, NaiveDateTime};
use log::warn;
use subcycle_model::{ExecutorStatus, Status, TransitionKind, TransitionOutcome, TransitionResult};

/// F. ResultClassifier (spec.md §4.6): a pure mapping from the executor's
/// reported status to what the core should do about it.
pub fn classify(result: &TransitionResult) -> TransitionOutcome {
    match result.status {
        ExecutorStatus::Success => TransitionOutcome::SuccessNew,
        ExecutorStatus::AlreadyInTargetState => TransitionOutcome::SuccessAlready,
        ExecutorStatus::SubscriptionExpired => TransitionOutcome::PermanentFailure(Status::Expired),
        ExecutorStatus::AccountLocked => TransitionOutcome::PermanentFailure(Status::Locked),
        ExecutorStatus::RecaptchaDetected => {
            TransitionOutcome::PermanentFailure(Status::CaptchaBlocked)
        }
        ExecutorStatus::PaymentMethodIssue => {
            TransitionOutcome::PermanentFailure(Status::PaymentMethodIssue)
        }
        ExecutorStatus::PaymentPending => TransitionOutcome::PaymentPending,
        ExecutorStatus::ImageCaptchaTransient => TransitionOutcome::ImageCaptchaRetry,
        ExecutorStatus::GenericFailure => TransitionOutcome::RetryableFailure,
    }
}

/// J. LoopDetector (spec.md §4.10): pure function over the `resultHistory`
/// text. Consulted only on success outcomes — a row that merely fails
/// repeatedly is governed by the retry cap, not this detector.
pub fn is_looping(history: &str, kind: TransitionKind) -> bool {
    history::count_same_kind_successes(history, kind) >= 3
}

/// Decision produced by the payment-pending sub-state-machine (spec.md §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingDecision {
    /// First observation: write `pendingCheckAt`/`pendingRetryAt`, release the
    /// lock, and count this cycle as skipped (not a failure).
    FirstObservation {
        pending_check_at: NaiveDateTime,
        pending_retry_at: NaiveDateTime,
    },
    /// A later observation still within the horizon: only `pendingRetryAt` moves.
    Resnooze { pending_retry_at: NaiveDateTime },
    /// The row has been pending longer than `pendingHorizonHours`.
    HorizonExceeded,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingConfig {
    pub pending_retry_minutes: i64,
    pub pending_horizon_hours: i64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            pending_retry_minutes: 30,
            pending_horizon_hours: 48,
        }
    }
}

/// Decide the next step for a row that just reported `payment-pending`.
///
/// `existing_pending_check_at` is `None` both for a genuinely first
/// observation and for a `pendingCheckAt` cell that failed to parse — per
/// spec.md §4.7, a corrupt timestamp is treated as "restart the clock", not
/// as a reason to fail the row.
pub fn decide_pending(
    now: NaiveDateTime,
    existing_pending_check_at: Option<NaiveDateTime>,
    config: PendingConfig,
) -> PendingDecision {
    match existing_pending_check_at {
        None => PendingDecision::FirstObservation {
            pending_check_at: now,
            pending_retry_at: now + Duration::minutes(config.pending_retry_minutes),
        },
        Some(check_at) => {
            if now - check_at >= Duration::hours(config.pending_horizon_hours) {
                PendingDecision::HorizonExceeded
            } else {
                PendingDecision::Resnooze {
                    pending_retry_at: now + Duration::minutes(config.pending_retry_minutes),
                }
            }
        }
    }
}

/// Recovers a `pendingCheckAt` cell that failed to parse by restarting the
/// clock at `now`, logging the corruption rather than losing the row.
pub fn recover_corrupt_pending_check_at(email: &str, raw: &str) -> Option<NaiveDateTime> {
    warn!("classify: {email} has an unparsable pendingCheckAt ({raw:?}); restarting the clock");
    None
}
