//! In-memory `SheetGateway` used by every other crate's test suite — the
//! same fixed-data test-double shape the teacher uses for its event sources.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use subcycle_model::Row;

use crate::{
    PermanentFailureUpdate, RetryableFailureUpdate, SheetError, SheetGateway, SheetResult,
    SuccessUpdate,
};

/// Plain in-memory sheet keyed by email, insertion-ordered.
pub struct MemorySheetGateway {
    rows: Mutex<Vec<Row>>,
    profile_map: Mutex<HashMap<String, String>>,
    config: Mutex<HashMap<String, String>>,
}

impl MemorySheetGateway {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: Mutex::new(rows),
            profile_map: Mutex::new(HashMap::new()),
            config: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_profile_map(self, profile_map: HashMap<String, String>) -> Self {
        *self.profile_map.lock().unwrap() = profile_map;
        self
    }

    pub fn with_config(self, config: HashMap<String, String>) -> Self {
        *self.config.lock().unwrap() = config;
        self
    }

    pub fn set_config_value(&self, key: &str, value: impl Into<String>) {
        self.config.lock().unwrap().insert(key.to_string(), value.into());
    }

    /// Snapshot of the current rows, for assertions in tests.
    pub fn snapshot(&self) -> Vec<Row> {
        self.rows.lock().unwrap().clone()
    }

    fn with_row_mut<T>(&self, email: &str, f: impl FnOnce(&mut Row) -> T) -> SheetResult<T> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.email == email)
            .ok_or_else(|| SheetError::RowNotFound(email.to_string()))?;
        Ok(f(row))
    }

    fn append_history(row: &mut Row, line: &str) {
        if !row.result_history.is_empty() {
            row.result_history.push('\n');
        }
        row.result_history.push_str(line);
    }
}

#[async_trait]
impl SheetGateway for MemorySheetGateway {
    async fn list_all_rows(&self) -> SheetResult<Vec<Row>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn refetch_by_email(&self, email: &str) -> SheetResult<Option<Row>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.email == email)
            .cloned())
    }

    async fn read_lock(&self, email: &str) -> SheetResult<String> {
        self.with_row_mut(email, |row| row.lock_token.clone())
    }

    async fn write_lock(&self, email: &str, token: &str) -> SheetResult<()> {
        self.with_row_mut(email, |row| row.lock_token = token.to_string())
    }

    async fn record_success(&self, email: &str, update: SuccessUpdate) -> SheetResult<()> {
        self.with_row_mut(email, |row| {
            row.status = update.new_status;
            Self::append_history(row, &update.result_line);
            row.last_ip = update.ip;
            row.last_proxy_id = update.proxy_id;
            if let Some(date) = update.next_billing_date {
                row.next_billing_date = Some(date);
            }
            row.retry_count = 0;
            row.lock_token.clear();
            row.pending_check_at = None;
            row.pending_retry_at = None;
        })
    }

    async fn record_retryable_failure(
        &self,
        email: &str,
        update: RetryableFailureUpdate,
    ) -> SheetResult<u32> {
        self.with_row_mut(email, |row| {
            Self::append_history(row, &update.result_line);
            row.last_ip = update.ip;
            row.last_proxy_id = update.proxy_id;
            row.retry_count += 1;
            row.lock_token.clear();
            row.retry_count
        })
    }

    async fn record_permanent_failure(
        &self,
        email: &str,
        update: PermanentFailureUpdate,
    ) -> SheetResult<()> {
        self.with_row_mut(email, |row| {
            row.status = update.new_status;
            Self::append_history(row, &update.result_line);
            row.last_ip = update.ip;
            row.last_proxy_id = update.proxy_id;
            row.lock_token.clear();
        })
    }

    async fn set_pending_check_at(&self, email: &str, at: NaiveDateTime) -> SheetResult<()> {
        self.with_row_mut(email, |row| row.pending_check_at = Some(at))
    }

    async fn set_pending_retry_at(&self, email: &str, at: NaiveDateTime) -> SheetResult<()> {
        self.with_row_mut(email, |row| row.pending_retry_at = Some(at))
    }

    async fn clear_pending_columns(&self, email: &str) -> SheetResult<()> {
        self.with_row_mut(email, |row| {
            row.pending_check_at = None;
            row.pending_retry_at = None;
        })
    }

    async fn append_pending_observation(&self, email: &str, result_line: &str) -> SheetResult<()> {
        self.with_row_mut(email, |row| {
            Self::append_history(row, result_line);
            row.lock_token.clear();
        })
    }

    async fn resolve_profile_id(&self, email: &str) -> SheetResult<Option<String>> {
        Ok(self.profile_map.lock().unwrap().get(email).cloned())
    }

    async fn read_config_value(&self, key: &str) -> SheetResult<Option<String>> {
        Ok(self.config.lock().unwrap().get(key).cloned())
    }
}
