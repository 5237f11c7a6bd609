//! HTTP-backed `SheetGateway`, grounded on the teacher's `CachedRpcClient`
//! shape (a thin wrapper + a `moka` cache) but pointed at a spreadsheet-API
//! service instead of a Solana RPC node.
//!
//! The wire format is intentionally a plain JSON REST surface — this crate
//! does not assume Google Sheets, Airtable or any particular backing store;
//! that choice belongs to the deployment, not the core.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::debug;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use subcycle_classify::recover_corrupt_pending_check_at;
use subcycle_model::{time_format, Row, Status};

use crate::{
    PermanentFailureUpdate, RetryableFailureUpdate, SheetError, SheetGateway, SheetResult,
    SuccessUpdate,
};

/// How long a resolved `email -> profileId` mapping is trusted before a
/// fresh lookup is required (spec.md §4.1: "a TTL of a few minutes").
const PROFILE_CACHE_TTL: Duration = Duration::from_secs(180);
const PROFILE_CACHE_CAPACITY: u64 = 50_000;

#[derive(Debug, Clone)]
pub struct HttpSheetGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

pub struct HttpSheetGateway {
    client: reqwest::Client,
    config: HttpSheetGatewayConfig,
    profile_cache: Cache<String, Option<String>>,
}

impl HttpSheetGateway {
    pub fn new(config: HttpSheetGatewayConfig) -> SheetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let profile_cache = Cache::builder()
            .max_capacity(PROFILE_CACHE_CAPACITY)
            .time_to_live(PROFILE_CACHE_TTL)
            .build();
        Ok(Self {
            client,
            config,
            profile_cache,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> SheetResult<T> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<T>().await?)
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> SheetResult<T> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<T>().await?)
    }
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<WireRow>,
}

#[derive(Debug, Deserialize)]
struct RowResponse {
    row: Option<WireRow>,
}

/// Wire representation matching the locale-native sheet formats of spec.md
/// §6 (`YYYY. M. D` dates, `HH:MM` times, `YYYY. M. D HH:MM` timestamps).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRow {
    email: String,
    password: String,
    recovery_email: String,
    totp_secret: String,
    status: String,
    next_billing_date: Option<String>,
    last_ip: Option<String>,
    last_proxy_id: Option<String>,
    result_history: String,
    scheduled_time: Option<String>,
    lock_token: String,
    payment_card: String,
    retry_count: u32,
    pending_check_at: Option<String>,
    pending_retry_at: Option<String>,
}

impl WireRow {
    fn into_row(self) -> SheetResult<Row> {
        let status = self
            .status
            .parse::<Status>()
            .map_err(|e| SheetError::Invalid(e.to_string()))?;
        let next_billing_date = self
            .next_billing_date
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| time_format::parse_local_date(s).ok());
        let scheduled_time = self
            .scheduled_time
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| time_format::parse_local_time_of_day(s).ok());
        let pending_check_at = match self.pending_check_at.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => match time_format::parse_local_timestamp(raw) {
                Ok(ts) => Some(ts),
                // spec.md §4.7: a corrupt pendingCheckAt restarts the clock
                // rather than failing the row.
                Err(_) => recover_corrupt_pending_check_at(&self.email, raw),
            },
            None => None,
        };
        let pending_retry_at = self
            .pending_retry_at
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| time_format::parse_local_timestamp(s).ok());
        Ok(Row {
            email: self.email,
            password: self.password,
            recovery_email: self.recovery_email,
            totp_secret: self.totp_secret,
            status,
            next_billing_date,
            last_ip: self.last_ip,
            last_proxy_id: self.last_proxy_id,
            result_history: self.result_history,
            scheduled_time,
            lock_token: self.lock_token,
            payment_card: self.payment_card,
            retry_count: self.retry_count,
            pending_check_at,
            pending_retry_at,
        })
    }
}

#[derive(Debug, Serialize)]
struct LockWrite<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct LockRead {
    token: String,
}

#[derive(Debug, Serialize)]
struct SuccessWrite<'a> {
    new_status: &'a str,
    result_line: &'a str,
    ip: Option<&'a str>,
    proxy_id: Option<&'a str>,
    next_billing_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct RetryableFailureWrite<'a> {
    result_line: &'a str,
    ip: Option<&'a str>,
    proxy_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RetryableFailureResponse {
    retry_count: u32,
}

#[derive(Debug, Serialize)]
struct PermanentFailureWrite<'a> {
    new_status: &'a str,
    result_line: &'a str,
    ip: Option<&'a str>,
    proxy_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct TimestampWrite {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    profile_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigValueResponse {
    value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Empty {}

#[async_trait]
impl SheetGateway for HttpSheetGateway {
    async fn list_all_rows(&self) -> SheetResult<Vec<Row>> {
        let resp: RowsResponse = self.get("/rows").await?;
        resp.rows.into_iter().map(WireRow::into_row).collect()
    }

    async fn refetch_by_email(&self, email: &str) -> SheetResult<Option<Row>> {
        let path = format!("/rows/{}", urlencoding_email(email));
        let resp: RowResponse = self.get(&path).await?;
        resp.row.map(WireRow::into_row).transpose()
    }

    async fn read_lock(&self, email: &str) -> SheetResult<String> {
        let path = format!("/rows/{}/lock", urlencoding_email(email));
        let resp: LockRead = self.get(&path).await?;
        Ok(resp.token)
    }

    async fn write_lock(&self, email: &str, token: &str) -> SheetResult<()> {
        let path = format!("/rows/{}/lock", urlencoding_email(email));
        let _: Empty = self.post(&path, &LockWrite { token }).await?;
        Ok(())
    }

    async fn record_success(&self, email: &str, update: SuccessUpdate) -> SheetResult<()> {
        let path = format!("/rows/{}/success", urlencoding_email(email));
        let body = SuccessWrite {
            new_status: update.new_status.as_str(),
            result_line: &update.result_line,
            ip: update.ip.as_deref(),
            proxy_id: update.proxy_id.as_deref(),
            next_billing_date: update.next_billing_date.map(time_format::format_local_date),
        };
        let _: Empty = self.post(&path, &body).await?;
        debug!("sheet: recorded success for {}", email);
        Ok(())
    }

    async fn record_retryable_failure(
        &self,
        email: &str,
        update: RetryableFailureUpdate,
    ) -> SheetResult<u32> {
        let path = format!("/rows/{}/retryable-failure", urlencoding_email(email));
        let body = RetryableFailureWrite {
            result_line: &update.result_line,
            ip: update.ip.as_deref(),
            proxy_id: update.proxy_id.as_deref(),
        };
        let resp: RetryableFailureResponse = self.post(&path, &body).await?;
        Ok(resp.retry_count)
    }

    async fn record_permanent_failure(
        &self,
        email: &str,
        update: PermanentFailureUpdate,
    ) -> SheetResult<()> {
        let path = format!("/rows/{}/permanent-failure", urlencoding_email(email));
        let body = PermanentFailureWrite {
            new_status: update.new_status.as_str(),
            result_line: &update.result_line,
            ip: update.ip.as_deref(),
            proxy_id: update.proxy_id.as_deref(),
        };
        let _: Empty = self.post(&path, &body).await?;
        Ok(())
    }

    async fn set_pending_check_at(&self, email: &str, at: NaiveDateTime) -> SheetResult<()> {
        let path = format!("/rows/{}/pending-check-at", urlencoding_email(email));
        let _: Empty = self
            .post(
                &path,
                &TimestampWrite {
                    value: time_format::format_local_timestamp(at),
                },
            )
            .await?;
        Ok(())
    }

    async fn set_pending_retry_at(&self, email: &str, at: NaiveDateTime) -> SheetResult<()> {
        let path = format!("/rows/{}/pending-retry-at", urlencoding_email(email));
        let _: Empty = self
            .post(
                &path,
                &TimestampWrite {
                    value: time_format::format_local_timestamp(at),
                },
            )
            .await?;
        Ok(())
    }

    async fn clear_pending_columns(&self, email: &str) -> SheetResult<()> {
        let path = format!("/rows/{}/clear-pending", urlencoding_email(email));
        let _: Empty = self.post(&path, &Empty {}).await?;
        Ok(())
    }

    async fn append_pending_observation(&self, email: &str, result_line: &str) -> SheetResult<()> {
        let path = format!("/rows/{}/pending-observation", urlencoding_email(email));
        let _: Empty = self
            .post(&path, &RetryableFailureWrite {
                result_line,
                ip: None,
                proxy_id: None,
            })
            .await?;
        Ok(())
    }

    async fn resolve_profile_id(&self, email: &str) -> SheetResult<Option<String>> {
        if let Some(cached) = self.profile_cache.get(email).await {
            return Ok(cached);
        }
        let path = format!("/profiles/{}", urlencoding_email(email));
        let resp: ProfileResponse = self.get(&path).await?;
        self.profile_cache
            .insert(email.to_string(), resp.profile_id.clone())
            .await;
        Ok(resp.profile_id)
    }

    async fn read_config_value(&self, key: &str) -> SheetResult<Option<String>> {
        let path = format!("/config/{}", key);
        let resp: ConfigValueResponse = self.get(&path).await?;
        Ok(resp.value)
    }
}

fn urlencoding_email(email: &str) -> String {
    email.replace('@', "%40")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_percent_encoded_for_the_at_sign() {
        assert_eq!(urlencoding_email("a@example.com"), "a%40example.com");
    }
}
