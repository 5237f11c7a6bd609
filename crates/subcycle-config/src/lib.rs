//! G. SharedConfig (spec.md §4.11) — process-wide tunables with a cached
//! snapshot and a TTL-based re-sync against the sheet's config tab. CLI
//! overrides always win over whatever the sheet says.

use std::time::{Duration, Instant};

use log::warn;
use subcycle_sheet::{SheetGateway, SheetResult};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
    pub resume_lead_minutes: i64,
    pub pause_lag_minutes: i64,
    pub check_interval_seconds: u64,
    pub retry_cap: u32,
    pub pending_retry_minutes: i64,
    pub pending_horizon_hours: i64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            resume_lead_minutes: 5,
            pause_lag_minutes: 5,
            check_interval_seconds: 60,
            retry_cap: 5,
            pending_retry_minutes: 30,
            pending_horizon_hours: 48,
        }
    }
}

/// Explicit overrides a caller (typically the CLI) wants to pin regardless
/// of what the sheet's config tab says.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunableOverrides {
    pub resume_lead_minutes: Option<i64>,
    pub pause_lag_minutes: Option<i64>,
    pub check_interval_seconds: Option<u64>,
    pub retry_cap: Option<u32>,
    pub pending_retry_minutes: Option<i64>,
    pub pending_horizon_hours: Option<i64>,
}

impl TunableOverrides {
    fn apply(&self, mut tunables: Tunables) -> Tunables {
        if let Some(v) = self.resume_lead_minutes {
            tunables.resume_lead_minutes = v;
        }
        if let Some(v) = self.pause_lag_minutes {
            tunables.pause_lag_minutes = v;
        }
        if let Some(v) = self.check_interval_seconds {
            tunables.check_interval_seconds = v;
        }
        if let Some(v) = self.retry_cap {
            tunables.retry_cap = v;
        }
        if let Some(v) = self.pending_retry_minutes {
            tunables.pending_retry_minutes = v;
        }
        if let Some(v) = self.pending_horizon_hours {
            tunables.pending_horizon_hours = v;
        }
        tunables
    }
}

const CONFIG_KEYS: &[(&str, fn(&mut Tunables, i64))] = &[
    ("resumeLeadMinutes", |t, v| t.resume_lead_minutes = v),
    ("pauseLagMinutes", |t, v| t.pause_lag_minutes = v),
    ("checkIntervalSeconds", |t, v| t.check_interval_seconds = v as u64),
    ("retryCap", |t, v| t.retry_cap = v as u32),
    ("pendingRetryMinutes", |t, v| t.pending_retry_minutes = v),
    ("pendingHorizonHours", |t, v| t.pending_horizon_hours = v),
];

/// Default TTL between re-syncs: "a few minutes" per spec.md §4.11.
pub const DEFAULT_SYNC_TTL: Duration = Duration::from_secs(180);

pub struct SharedConfig<'a> {
    sheet: &'a dyn SheetGateway,
    overrides: TunableOverrides,
    ttl: Duration,
    snapshot: RwLock<Tunables>,
    last_synced: RwLock<Option<Instant>>,
}

impl<'a> SharedConfig<'a> {
    pub fn new(sheet: &'a dyn SheetGateway, overrides: TunableOverrides) -> Self {
        Self {
            sheet,
            overrides,
            ttl: DEFAULT_SYNC_TTL,
            snapshot: RwLock::new(overrides.apply(Tunables::default())),
            last_synced: RwLock::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Current snapshot without forcing a re-sync.
    pub async fn current(&self) -> Tunables {
        *self.snapshot.read().await
    }

    /// Re-sync from the sheet's config tab if the TTL has elapsed. On read
    /// failure the last good snapshot is kept and a warning is logged —
    /// never an error, per spec.md §4.11.
    pub async fn sync(&self) -> Tunables {
        let needs_sync = {
            let last = *self.last_synced.read().await;
            match last {
                Some(at) => at.elapsed() >= self.ttl,
                None => true,
            }
        };

        if needs_sync {
            match self.fetch_from_sheet().await {
                Ok(fresh) => {
                    *self.snapshot.write().await = self.overrides.apply(fresh);
                    *self.last_synced.write().await = Some(Instant::now());
                }
                Err(err) => {
                    warn!("shared config: re-sync failed, keeping last good snapshot: {err}");
                    *self.last_synced.write().await = Some(Instant::now());
                }
            }
        }

        self.current().await
    }

    async fn fetch_from_sheet(&self) -> SheetResult<Tunables> {
        let mut tunables = Tunables::default();
        for (key, setter) in CONFIG_KEYS {
            if let Some(raw) = self.sheet.read_config_value(key).await? {
                if let Ok(value) = raw.trim().parse::<i64>() {
                    setter(&mut tunables, value);
                }
            }
        }
        Ok(tunables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use subcycle_sheet::memory::MemorySheetGateway;

    #[tokio::test]
    async fn sync_pulls_values_from_the_sheet_config_tab() {
        let mut config_values = HashMap::new();
        config_values.insert("retryCap".to_string(), "9".to_string());
        config_values.insert("checkIntervalSeconds".to_string(), "30".to_string());
        let gw = MemorySheetGateway::new(vec![]).with_config(config_values);

        let config = SharedConfig::new(&gw, TunableOverrides::default());
        let tunables = config.sync().await;
        assert_eq!(tunables.retry_cap, 9);
        assert_eq!(tunables.check_interval_seconds, 30);
    }

    #[tokio::test]
    async fn explicit_overrides_win_over_the_sheet() {
        let mut config_values = HashMap::new();
        config_values.insert("retryCap".to_string(), "9".to_string());
        let gw = MemorySheetGateway::new(vec![]).with_config(config_values);

        let overrides = TunableOverrides {
            retry_cap: Some(2),
            ..Default::default()
        };
        let config = SharedConfig::new(&gw, overrides);
        let tunables = config.sync().await;
        assert_eq!(tunables.retry_cap, 2);
    }

    #[tokio::test]
    async fn sync_within_ttl_does_not_refetch() {
        let gw = MemorySheetGateway::new(vec![]);
        let config = SharedConfig::new(&gw, TunableOverrides::default()).with_ttl(Duration::from_secs(600));
        config.sync().await;

        gw.set_config_value("retryCap", "42");
        let tunables = config.sync().await;
        assert_eq!(tunables.retry_cap, Tunables::default().retry_cap);
    }
}
