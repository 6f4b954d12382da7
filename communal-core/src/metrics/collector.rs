//! In-process counters mirrored alongside the metrics facade

use std::sync::atomic::{AtomicU64, Ordering};

use super::record_counter;

/// Point-in-time copy of the collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub descriptions_published: u64,
    pub descriptions_rejected_stale: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub rekeys: u64,
    pub key_deliveries_failed: u64,
    pub grants_issued: u64,
    pub grants_rejected: u64,
}

/// Sync counters readable without a metrics recorder installed
#[derive(Debug, Default)]
pub struct MetricsCollector {
    descriptions_published: AtomicU64,
    descriptions_rejected_stale: AtomicU64,
    events_accepted: AtomicU64,
    events_rejected: AtomicU64,
    rekeys: AtomicU64,
    key_deliveries_failed: AtomicU64,
    grants_issued: AtomicU64,
    grants_rejected: AtomicU64,
}

macro_rules! counter_fn {
    ($fn_name:ident, $field:ident, $metric:expr) => {
        pub fn $fn_name(&self, value: u64) {
            self.$field.fetch_add(value, Ordering::Relaxed);
            record_counter($metric, value);
        }
    };
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    counter_fn!(inc_published, descriptions_published, super::DESCRIPTION_PUBLISHED);
    counter_fn!(inc_rejected_stale, descriptions_rejected_stale, super::DESCRIPTION_REJECTED_STALE);
    counter_fn!(inc_events_accepted, events_accepted, super::EVENTS_ACCEPTED);
    counter_fn!(inc_events_rejected, events_rejected, super::EVENTS_REJECTED);
    counter_fn!(inc_rekeys, rekeys, super::KEYS_REKEYED);
    counter_fn!(inc_key_delivery_failed, key_deliveries_failed, super::KEYS_DELIVERY_FAILED);
    counter_fn!(inc_grants_issued, grants_issued, super::GRANTS_ISSUED);
    counter_fn!(inc_grants_rejected, grants_rejected, super::GRANTS_REJECTED);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            descriptions_published: self.descriptions_published.load(Ordering::Relaxed),
            descriptions_rejected_stale: self.descriptions_rejected_stale.load(Ordering::Relaxed),
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            rekeys: self.rekeys.load(Ordering::Relaxed),
            key_deliveries_failed: self.key_deliveries_failed.load(Ordering::Relaxed),
            grants_issued: self.grants_issued.load(Ordering::Relaxed),
            grants_rejected: self.grants_rejected.load(Ordering::Relaxed),
        }
    }
}
