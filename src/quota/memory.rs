use chrono::NaiveDate;
use dashmap::{DashMap, mapref::entry::Entry};

use super::{QuotaDecision, QuotaRecord, QuotaStore};

/// In-process quota store. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    records: DashMap<String, QuotaRecord>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<QuotaRecord> {
        self.records.get(key).map(|record| record.clone())
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn check_and_consume(&self, key: &str, today: NaiveDate, limit: u32) -> QuotaDecision {
        // The entry guard holds the shard lock for the whole read-modify-write.
        match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(QuotaRecord { day: today, count: 1 });
                QuotaDecision::Allow { used: 1 }
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.day != today {
                    *record = QuotaRecord { day: today, count: 1 };
                    QuotaDecision::Allow { used: 1 }
                } else if record.count < limit {
                    record.count += 1;
                    QuotaDecision::Allow { used: record.count }
                } else {
                    QuotaDecision::Deny
                }
            }
        }
    }

    fn evict_before(&self, cutoff: NaiveDate) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.day >= cutoff);
        before.saturating_sub(self.records.len())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
