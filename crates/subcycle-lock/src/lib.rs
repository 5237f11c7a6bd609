//! B. LockService (spec.md §4.2) — a best-effort distributed lease on the
//! sheet's `lockToken` column. The backing store offers no native
//! compare-and-set, so acquisition is write-then-verify: write our token,
//! read it back, and concede if someone else's write landed in between.

use std::fmt;
use std::process;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use subcycle_model::{lock_token_timestamp, Row};
use subcycle_sheet::{SheetError, SheetGateway};
use uuid::Uuid;

/// Default stale-lease horizon: a lock older than this is treated as
/// abandoned and can be reclaimed by another worker.
pub const DEFAULT_LEASE_EXPIRY: Duration = Duration::minutes(5);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Sheet(#[from] SheetError),
}

pub type LockResult<T> = Result<T, LockError>;

/// Identifies this process for the lifetime of the lock token. Generated once
/// per process: hostname + pid + a random suffix, per spec.md §4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn generate() -> Self {
        let hostname = hostname_or_fallback();
        let pid = process::id();
        let suffix = Uuid::new_v4().simple().to_string();
        let suffix = &suffix[..8];
        WorkerId(format!("{hostname}-{pid}-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hostname_or_fallback() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Builds the `workerId@unixMillis` token this process would write right now.
fn token_for(worker_id: &WorkerId, now: DateTime<Utc>) -> String {
    format!("{}@{}", worker_id.as_str(), now.timestamp_millis())
}

pub struct LockService<'a> {
    sheet: &'a dyn SheetGateway,
    worker_id: WorkerId,
    lease_expiry: Duration,
}

impl<'a> LockService<'a> {
    pub fn new(sheet: &'a dyn SheetGateway, worker_id: WorkerId) -> Self {
        Self {
            sheet,
            worker_id,
            lease_expiry: DEFAULT_LEASE_EXPIRY,
        }
    }

    pub fn with_lease_expiry(mut self, lease_expiry: Duration) -> Self {
        self.lease_expiry = lease_expiry;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// True if `token` both exists and is younger than the lease expiry as of `now`.
    fn is_fresh(token: &str, now: DateTime<Utc>, lease_expiry: Duration) -> bool {
        if token.is_empty() {
            return false;
        }
        match lock_token_timestamp(token) {
            Some(ts) => now.naive_utc() - ts < lease_expiry,
            // A token we can't parse is treated as held, never as free — an
            // unreadable lock must not be silently stolen.
            None => true,
        }
    }

    /// Step 1-3 of spec.md §4.2: read, write, read-back-and-compare.
    pub async fn acquire(&self, email: &str) -> LockResult<bool> {
        let now = Utc::now();
        let current = self.sheet.read_lock(email).await?;
        if Self::is_fresh(&current, now, self.lease_expiry) {
            debug!("lock: {email} held by a fresh token, conceding");
            return Ok(false);
        }

        let candidate = token_for(&self.worker_id, now);
        self.sheet.write_lock(email, &candidate).await?;

        let observed = self.sheet.read_lock(email).await?;
        if observed == candidate {
            Ok(true)
        } else {
            debug!("lock: {email} lost the acquisition race");
            Ok(false)
        }
    }

    /// Unconditional release. `RecordSuccess`/`RecordRetryableFailure`/
    /// `RecordPermanentFailure` on the sheet gateway also clear the lock as
    /// part of their batched writes; this method exists for the paths that
    /// need to let go of a row without recording an outcome (e.g. an error
    /// raised before classification).
    pub async fn release(&self, email: &str) -> LockResult<()> {
        self.sheet.write_lock(email, "").await?;
        Ok(())
    }

    /// Local pre-filter dropping rows whose lock looks fresh, purely to
    /// reduce acquisition contention before a worker even tries.
    pub fn filter_unlocked<'r>(&self, rows: &'r [Row]) -> Vec<&'r Row> {
        let now = Utc::now();
        rows.iter()
            .filter(|row| !Self::is_fresh(&row.lock_token, now, self.lease_expiry))
            .collect()
    }
}

/// Warns at the call site that emits a high-severity notification when a
/// worker repeatedly fails to acquire the same row — kept here since it is
/// purely a LockService-local observation, not a sheet write.
pub fn warn_if_contended(email: &str, consecutive_losses: u32) {
    if consecutive_losses >= 3 {
        warn!("lock: {email} lost {consecutive_losses} consecutive acquisition attempts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use subcycle_model::Status;
    use subcycle_sheet::memory::MemorySheetGateway;

    fn gateway(email: &str, lock_token: &str) -> MemorySheetGateway {
        let mut row = Row::new(email, Status::Paused);
        row.lock_token = lock_token.to_string();
        MemorySheetGateway::new(vec![row])
    }

    #[tokio::test]
    async fn acquire_succeeds_on_an_unlocked_row() {
        let gw = gateway("a@example.com", "");
        let lock = LockService::new(&gw, WorkerId::generate());
        assert!(lock.acquire("a@example.com").await.unwrap());

        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        assert!(row.lock_token.starts_with(lock.worker_id().as_str()));
    }

    #[tokio::test]
    async fn acquire_fails_against_a_fresh_foreign_lock() {
        let fresh_token = format!("other-worker@{}", Utc::now().timestamp_millis());
        let gw = gateway("a@example.com", &fresh_token);
        let lock = LockService::new(&gw, WorkerId::generate());
        assert!(!lock.acquire("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_succeeds_against_a_stale_foreign_lock() {
        let stale_millis = Utc::now().timestamp_millis() - Duration::minutes(10).num_milliseconds();
        let stale_token = format!("dead-worker@{stale_millis}");
        let gw = gateway("a@example.com", &stale_token);
        let lock = LockService::new(&gw, WorkerId::generate());
        assert!(lock.acquire("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn release_writes_an_empty_token() {
        let gw = gateway("a@example.com", "worker@123");
        let lock = LockService::new(&gw, WorkerId::generate());
        lock.release("a@example.com").await.unwrap();
        let row = gw.refetch_by_email("a@example.com").await.unwrap().unwrap();
        assert!(row.lock_token.is_empty());
    }

    #[tokio::test]
    async fn filter_unlocked_drops_fresh_locks_and_keeps_stale_or_empty() {
        let now_millis = Utc::now().timestamp_millis();
        let stale_millis = now_millis - Duration::minutes(10).num_milliseconds();

        let mut fresh = Row::new("fresh@example.com", Status::Paused);
        fresh.lock_token = format!("w@{now_millis}");
        let mut stale = Row::new("stale@example.com", Status::Paused);
        stale.lock_token = format!("w@{stale_millis}");
        let empty = Row::new("empty@example.com", Status::Paused);

        let gw = MemorySheetGateway::new(vec![fresh.clone(), stale.clone(), empty.clone()]);
        let lock = LockService::new(&gw, WorkerId::generate());

        let unlocked = lock.filter_unlocked(&[fresh, stale, empty]);
        let emails: HashMap<&str, ()> = unlocked.iter().map(|r| (r.email.as_str(), ())).collect();
        assert!(!emails.contains_key("fresh@example.com"));
        assert!(emails.contains_key("stale@example.com"));
        assert!(emails.contains_key("empty@example.com"));
    }

    #[tokio::test]
    async fn unparsable_token_is_treated_as_held_not_free() {
        let gw = gateway("a@example.com", "not-a-valid-token");
        let lock = LockService::new(&gw, WorkerId::generate());
        assert!(!lock.acquire("a@example.com").await.unwrap());
    }
}
