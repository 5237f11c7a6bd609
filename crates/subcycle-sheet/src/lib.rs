//! A. SheetGateway (spec.md §4.1) — the typed API over the worker sheet and
//! the profile-mapping sheet. Every `record_*` method performs one batched
//! write so an observer never sees a half-written row.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use subcycle_model::{Row, Status};

#[derive(Debug, Clone)]
pub struct SuccessUpdate {
    pub new_status: Status,
    pub result_line: String,
    pub ip: Option<String>,
    pub proxy_id: Option<String>,
    pub next_billing_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct RetryableFailureUpdate {
    pub result_line: String,
    pub ip: Option<String>,
    pub proxy_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PermanentFailureUpdate {
    pub new_status: Status,
    pub result_line: String,
    pub ip: Option<String>,
    pub proxy_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    #[error("sheet row not found for email {0}")]
    RowNotFound(String),
    #[error("sheet http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sheet response could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("sheet row data invalid: {0}")]
    Invalid(String),
}

pub type SheetResult<T> = Result<T, SheetError>;

/// Typed operations over the worker sheet (spec.md §4.1). `rowKey` is the
/// account email — the stable identity described in spec.md §3.1.
#[async_trait]
pub trait SheetGateway: Send + Sync {
    /// Full snapshot of the worker tab, in sheet order.
    async fn list_all_rows(&self) -> SheetResult<Vec<Row>>;

    /// Re-read a single row immediately before acting on it, to defend
    /// against row deletions/insertions that shift indices.
    async fn refetch_by_email(&self, email: &str) -> SheetResult<Option<Row>>;

    async fn read_lock(&self, email: &str) -> SheetResult<String>;
    async fn write_lock(&self, email: &str, token: &str) -> SheetResult<()>;

    /// Atomic batched write: status, appended history, ip, proxy, optional
    /// next billing date; clears `retryCount` and `lockToken`, and the
    /// pending columns (invariant 4.7.4).
    async fn record_success(&self, email: &str, update: SuccessUpdate) -> SheetResult<()>;

    /// Atomic append to history, increments `retryCount`, clears `lockToken`.
    /// Returns the new retry counter.
    async fn record_retryable_failure(
        &self,
        email: &str,
        update: RetryableFailureUpdate,
    ) -> SheetResult<u32>;

    /// Sets terminal status, appends history, clears `lockToken`. Does not
    /// touch `retryCount` (invariant 3).
    async fn record_permanent_failure(
        &self,
        email: &str,
        update: PermanentFailureUpdate,
    ) -> SheetResult<()>;

    async fn set_pending_check_at(&self, email: &str, at: NaiveDateTime) -> SheetResult<()>;
    async fn set_pending_retry_at(&self, email: &str, at: NaiveDateTime) -> SheetResult<()>;
    async fn clear_pending_columns(&self, email: &str) -> SheetResult<()>;

    /// Appends one history line and releases the lock, touching neither
    /// `status` nor `retryCount`. Backs the payment-pending observation path
    /// (spec.md §4.7), which is explicitly "skipped", not a retryable failure.
    async fn append_pending_observation(&self, email: &str, result_line: &str) -> SheetResult<()>;

    /// Resolve `email -> profileId` against the mapping sheet. Implementations
    /// are expected to hold a short-TTL in-memory cache in front of this.
    async fn resolve_profile_id(&self, email: &str) -> SheetResult<Option<String>>;

    /// Read a single key from the live config tab (backs `SharedConfig`).
    async fn read_config_value(&self, key: &str) -> SheetResult<Option<String>>;
}
