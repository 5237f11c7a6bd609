//! Shared types for the subscription-lifecycle fleet worker.
//!
//! `Row` is the unit of scheduling (one account); `TransitionResult` is the
//! boundary value the opaque browser-automation executor hands back;
//! `TransitionOutcome` is what the classifier turns it into.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod time_format;

/// State-machine state of an account row.
///
/// Canonicalised to stable English identifiers rather than the source's
/// localized status strings (see DESIGN.md "Open Question: status strings").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Paused,
    Billing,
    Expired,
    Locked,
    CaptchaBlocked,
    PaymentMethodIssue,
    ManualCheckLoop,
    ManualCheckPaymentDelay,
}

impl Status {
    /// Terminal states are sticky: the time filter never selects them again (invariant 7).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Expired
                | Status::Locked
                | Status::CaptchaBlocked
                | Status::PaymentMethodIssue
                | Status::ManualCheckLoop
                | Status::ManualCheckPaymentDelay
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Paused => "Paused",
            Status::Billing => "Billing",
            Status::Expired => "Expired",
            Status::Locked => "Locked",
            Status::CaptchaBlocked => "CaptchaBlocked",
            Status::PaymentMethodIssue => "PaymentMethodIssue",
            Status::ManualCheckLoop => "ManualCheckLoop",
            Status::ManualCheckPaymentDelay => "ManualCheckPaymentDelay",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Paused" => Ok(Status::Paused),
            "Billing" => Ok(Status::Billing),
            "Expired" => Ok(Status::Expired),
            "Locked" => Ok(Status::Locked),
            "CaptchaBlocked" => Ok(Status::CaptchaBlocked),
            "PaymentMethodIssue" => Ok(Status::PaymentMethodIssue),
            "ManualCheckLoop" => Ok(Status::ManualCheckLoop),
            "ManualCheckPaymentDelay" => Ok(Status::ManualCheckPaymentDelay),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Which transition a cycle is attempting for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    Pause,
    Resume,
}

impl TransitionKind {
    /// The status a successful transition of this kind flips the row to.
    pub fn target_status(self) -> Status {
        match self {
            TransitionKind::Pause => Status::Paused,
            TransitionKind::Resume => Status::Billing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Pause => "pause",
            TransitionKind::Resume => "resume",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One account row, the unit of scheduling (spec.md §3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub email: String,
    pub password: String,
    pub recovery_email: String,
    pub totp_secret: String,
    pub status: Status,
    pub next_billing_date: Option<NaiveDate>,
    pub last_ip: Option<String>,
    pub last_proxy_id: Option<String>,
    pub result_history: String,
    /// Local time-of-day the transition should fire. `None` if blank/unparsable.
    pub scheduled_time: Option<NaiveTime>,
    /// Empty string means unlocked.
    pub lock_token: String,
    pub payment_card: String,
    pub retry_count: u32,
    pub pending_check_at: Option<NaiveDateTime>,
    pub pending_retry_at: Option<NaiveDateTime>,
}

impl Row {
    /// A row with no scheduled time, no history and no lock: the minimum viable row for tests.
    pub fn new(email: impl Into<String>, status: Status) -> Self {
        Self {
            email: email.into(),
            password: String::new(),
            recovery_email: String::new(),
            totp_secret: String::new(),
            status,
            next_billing_date: None,
            last_ip: None,
            last_proxy_id: None,
            result_history: String::new(),
            scheduled_time: None,
            lock_token: String::new(),
            payment_card: String::new(),
            retry_count: 0,
            pending_check_at: None,
            pending_retry_at: None,
        }
    }
}

/// Parse the `workerId@unixMillis` lock token into its timestamp component.
pub fn lock_token_timestamp(token: &str) -> Option<NaiveDateTime> {
    let (_, millis) = token.rsplit_once('@')?;
    let millis: i64 = millis.parse().ok()?;
    chrono::DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

/// Status values the executor can report, per spec.md §3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorStatus {
    Success,
    AlreadyInTargetState,
    SubscriptionExpired,
    AccountLocked,
    RecaptchaDetected,
    PaymentMethodIssue,
    PaymentPending,
    ImageCaptchaTransient,
    GenericFailure,
}

/// The boundary value between the core and the opaque `TransitionExecutor` (spec.md §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResult {
    pub success: bool,
    pub kind: TransitionKind,
    pub status: ExecutorStatus,
    pub next_billing_date: Option<NaiveDate>,
    pub observed_ip: Option<String>,
    pub observed_proxy_id: Option<String>,
    pub detected_language: Option<String>,
    pub error_message: Option<String>,
    pub payment_pending_reason: Option<String>,
    pub actual_profile_id_used: Option<String>,
}

impl TransitionResult {
    pub fn success(kind: TransitionKind) -> Self {
        Self {
            success: true,
            kind,
            status: ExecutorStatus::Success,
            next_billing_date: None,
            observed_ip: None,
            observed_proxy_id: None,
            detected_language: None,
            error_message: None,
            payment_pending_reason: None,
            actual_profile_id_used: None,
        }
    }

    pub fn failure(kind: TransitionKind, status: ExecutorStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            kind,
            status,
            next_billing_date: None,
            observed_ip: None,
            observed_proxy_id: None,
            detected_language: None,
            error_message: Some(message.into()),
            payment_pending_reason: None,
            actual_profile_id_used: None,
        }
    }
}

/// What the classifier turns a `TransitionResult` into (spec.md §4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    SuccessNew,
    SuccessAlready,
    RetryableFailure,
    PermanentFailure(Status),
    ImageCaptchaRetry,
    PaymentPending,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown status string: {0}")]
    UnknownStatus(String),
    #[error("unparsable local time-of-day: {0}")]
    BadTimeOfDay(String),
    #[error("unparsable local date: {0}")]
    BadDate(String),
    #[error("unparsable local timestamp: {0}")]
    BadTimestamp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sticky() {
        assert!(Status::ManualCheckLoop.is_terminal());
        assert!(Status::Expired.is_terminal());
        assert!(!Status::Paused.is_terminal());
        assert!(!Status::Billing.is_terminal());
    }

    #[test]
    fn status_round_trips_through_display_and_from_str() {
        for s in [
            Status::Paused,
            Status::Billing,
            Status::Expired,
            Status::Locked,
            Status::CaptchaBlocked,
            Status::PaymentMethodIssue,
            Status::ManualCheckLoop,
            Status::ManualCheckPaymentDelay,
        ] {
            let parsed: Status = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn transition_kind_target_status() {
        assert_eq!(TransitionKind::Pause.target_status(), Status::Paused);
        assert_eq!(TransitionKind::Resume.target_status(), Status::Billing);
    }

    #[test]
    fn lock_token_timestamp_round_trips() {
        let now = chrono::Utc::now().timestamp_millis();
        let token = format!("worker-1@{}", now);
        let parsed = lock_token_timestamp(&token).unwrap();
        assert_eq!(parsed.and_utc().timestamp_millis(), now);
    }

    #[test]
    fn lock_token_timestamp_rejects_malformed_token() {
        assert!(lock_token_timestamp("").is_none());
        assert!(lock_token_timestamp("no-at-sign").is_none());
        assert!(lock_token_timestamp("worker@not-a-number").is_none());
    }
}
