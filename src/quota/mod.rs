pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

pub use memory::MemoryQuotaStore;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Per-client usage for a single UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub day: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow { used: u32 },
    Deny,
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Storage for daily counters. Implementations must make `check_and_consume`
/// atomic for a given key.
pub trait QuotaStore: Send + Sync {
    fn check_and_consume(&self, key: &str, today: NaiveDate, limit: u32) -> QuotaDecision;

    /// Drops records whose day is before `cutoff`, returning how many were removed.
    fn evict_before(&self, cutoff: NaiveDate) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Gate consulted once per request. Days roll over at UTC midnight.
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    daily_limit: u32,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>, daily_limit: u32) -> Self {
        Self { store, daily_limit }
    }

    pub fn in_memory(daily_limit: u32) -> Self {
        Self::new(Arc::new(MemoryQuotaStore::new()), daily_limit)
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn check_and_consume(&self, key: &str) -> QuotaDecision {
        self.check_and_consume_on(key, Utc::now().date_naive())
    }

    pub fn check_and_consume_on(&self, key: &str, today: NaiveDate) -> QuotaDecision {
        self.store.check_and_consume(key, today, self.daily_limit)
    }

    /// Removes records older than `retention_days` before `today`.
    pub fn evict_stale(&self, today: NaiveDate, retention_days: u32) -> usize {
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(retention_days)))
            .unwrap_or(NaiveDate::MIN);
        self.store.evict_before(cutoff)
    }

    /// Runs the hourly eviction sweep until `shutdown` fires.
    pub fn spawn_eviction(
        &self,
        retention_days: u32,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.evict_stale(Utc::now().date_naive(), retention_days);
                        if removed > 0 {
                            tracing::debug!(
                                removed,
                                remaining = tracker.store.len(),
                                "evicted stale quota records"
                            );
                        }
                    }
                }
            }
        })
    }
}
