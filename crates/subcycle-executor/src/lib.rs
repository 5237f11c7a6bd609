//! E. TransitionExecutor (spec.md §4.5) — the opaque browser-automation
//! collaborator. The core only depends on this trait; the real
//! implementation (driving an actual browser) lives outside this workspace
//! and is never linked in here, matching the "external interface" framing in
//! spec.md §1's Non-goals.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use subcycle_model::{ExecutorStatus, Row, TransitionKind, TransitionResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Passthrough credentials and the fields the executor needs but the core
/// never inspects.
#[derive(Debug, Clone)]
pub struct AccountData {
    pub email: String,
    pub password: String,
    pub recovery_email: String,
    pub totp_secret: String,
    pub payment_card: String,
}

impl From<&Row> for AccountData {
    fn from(row: &Row) -> Self {
        Self {
            email: row.email.clone(),
            password: row.password.clone(),
            recovery_email: row.recovery_email.clone(),
            totp_secret: row.totp_secret.clone(),
            payment_card: row.payment_card.clone(),
        }
    }
}

/// Run-time hints passed alongside the transition request.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionHints {
    pub retry_count: u32,
    pub debug_mode: bool,
    /// True if the browser should run with a visible window (vs. headless).
    pub window_mode: bool,
}

#[async_trait]
pub trait TransitionExecutor: Send + Sync {
    /// The core assumes idempotence: an executor already in the requested
    /// state returns `ExecutorStatus::AlreadyInTargetState`, it never fails.
    async fn execute(
        &self,
        profile_id: Option<&str>,
        account: &AccountData,
        kind: TransitionKind,
        hints: ExecutionHints,
    ) -> TransitionResult;
}

#[derive(Debug, Serialize)]
struct ProcessRequest<'a> {
    profile_id: Option<&'a str>,
    email: &'a str,
    password: &'a str,
    recovery_email: &'a str,
    totp_secret: &'a str,
    payment_card: &'a str,
    kind: &'static str,
    retry_count: u32,
    debug_mode: bool,
    window_mode: bool,
}

/// Wire shape the external browser-automation program is expected to emit on
/// stdout, one JSON object per invocation.
#[derive(Debug, Deserialize)]
struct ProcessResponse {
    success: bool,
    status: ExecutorStatus,
    next_billing_date: Option<chrono::NaiveDate>,
    observed_ip: Option<String>,
    observed_proxy_id: Option<String>,
    detected_language: Option<String>,
    error_message: Option<String>,
    payment_pending_reason: Option<String>,
    actual_profile_id_used: Option<String>,
}

/// Drives the real, out-of-workspace browser-automation program as a child
/// process: the request goes to its stdin as one JSON line, the result comes
/// back the same way on stdout. Any failure to launch, write, parse, or a
/// timeout all collapse to `ExecutorStatus::GenericFailure` — the core never
/// sees a process error, only a `TransitionResult` (spec.md §4.5).
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(
        &self,
        profile_id: Option<&str>,
        account: &AccountData,
        kind: TransitionKind,
        hints: ExecutionHints,
    ) -> Result<ProcessResponse, String> {
        let request = ProcessRequest {
            profile_id,
            email: &account.email,
            password: &account.password,
            recovery_email: &account.recovery_email,
            totp_secret: &account.totp_secret,
            payment_card: &account.payment_card,
            kind: kind.as_str(),
            retry_count: hints.retry_count,
            debug_mode: hints.debug_mode,
            window_mode: hints.window_mode,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| e.to_string())?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.program))?;

        let mut stdin = child.stdin.take().ok_or("child process has no stdin")?;
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| format!("failed to write request: {e}"))?;
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| "executor timed out".to_string())?
            .map_err(|e| format!("executor process failed: {e}"))?;

        if !output.status.success() {
            return Err(format!("executor exited with {}", output.status));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| format!("bad executor response: {e}"))
    }
}

#[async_trait]
impl TransitionExecutor for ProcessExecutor {
    async fn execute(
        &self,
        profile_id: Option<&str>,
        account: &AccountData,
        kind: TransitionKind,
        hints: ExecutionHints,
    ) -> TransitionResult {
        match self.run(profile_id, account, kind, hints).await {
            Ok(resp) => TransitionResult {
                success: resp.success,
                kind,
                status: resp.status,
                next_billing_date: resp.next_billing_date,
                observed_ip: resp.observed_ip,
                observed_proxy_id: resp.observed_proxy_id,
                detected_language: resp.detected_language,
                error_message: resp.error_message,
                payment_pending_reason: resp.payment_pending_reason,
                actual_profile_id_used: resp.actual_profile_id_used,
            },
            Err(err) => {
                warn!("process executor: {err}");
                TransitionResult::failure(kind, ExecutorStatus::GenericFailure, err)
            }
        }
    }
}

/// Test double that always returns the same canned result, for scripting
/// deterministic WorkerLoop/BatchProcessor scenarios.
pub struct ScriptedExecutor {
    results: std::sync::Mutex<std::collections::VecDeque<TransitionResult>>,
    default: TransitionResult,
}

impl ScriptedExecutor {
    pub fn new(default: TransitionResult) -> Self {
        Self {
            results: std::sync::Mutex::new(std::collections::VecDeque::new()),
            default,
        }
    }

    /// Queue a result to be returned on the next `execute` call; once the
    /// queue is drained, `default` is returned for every subsequent call.
    pub fn push(&self, result: TransitionResult) {
        self.results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl TransitionExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _profile_id: Option<&str>,
        _account: &AccountData,
        _kind: TransitionKind,
        _hints: ExecutionHints,
    ) -> TransitionResult {
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subcycle_model::{ExecutorStatus, Status};

    #[tokio::test]
    async fn process_executor_collapses_a_missing_binary_to_generic_failure() {
        let executor = ProcessExecutor::new(
            "subcycle-executor-binary-that-does-not-exist",
            vec![],
            Duration::from_secs(5),
        );
        let row = Row::new("a@example.com", Status::Paused);
        let account = AccountData::from(&row);
        let hints = ExecutionHints {
            retry_count: 0,
            debug_mode: false,
            window_mode: false,
        };

        let result = executor
            .execute(None, &account, TransitionKind::Resume, hints)
            .await;
        assert!(!result.success);
        assert_eq!(result.status, ExecutorStatus::GenericFailure);
    }

    #[tokio::test]
    async fn scripted_executor_drains_its_queue_then_falls_back_to_default() {
        let default = TransitionResult::failure(
            TransitionKind::Resume,
            ExecutorStatus::GenericFailure,
            "default",
        );
        let executor = ScriptedExecutor::new(default.clone());
        executor.push(TransitionResult::success(TransitionKind::Resume));

        let row = Row::new("a@example.com", Status::Paused);
        let account = AccountData::from(&row);
        let hints = ExecutionHints {
            retry_count: 0,
            debug_mode: false,
            window_mode: false,
        };

        let first = executor
            .execute(None, &account, TransitionKind::Resume, hints)
            .await;
        assert!(first.success);

        let second = executor
            .execute(None, &account, TransitionKind::Resume, hints)
            .await;
        assert_eq!(second.status, ExecutorStatus::GenericFailure);
    }
}
