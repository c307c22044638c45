use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub reservations_granted: u64,
    pub reservations_denied: u64,
    pub store_degraded: u64,
    pub refunds: u64,
    pub refund_failures: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub top_ups_applied: u64,
}

/// Process-wide counters shared by the ledger, the gate and the HTTP layer.
#[derive(Debug, Default)]
pub struct Observability {
    reservations_granted: AtomicU64,
    reservations_denied: AtomicU64,
    store_degraded: AtomicU64,
    refunds: AtomicU64,
    refund_failures: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    top_ups_applied: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_reservation_granted(&self) {
        bump(&self.reservations_granted);
    }

    pub fn record_reservation_denied(&self) {
        bump(&self.reservations_denied);
    }

    pub fn record_store_degraded(&self) {
        bump(&self.store_degraded);
    }

    pub fn record_refund(&self) {
        bump(&self.refunds);
    }

    pub fn record_refund_failure(&self) {
        bump(&self.refund_failures);
    }

    pub fn record_task_succeeded(&self) {
        bump(&self.tasks_succeeded);
    }

    pub fn record_task_failed(&self) {
        bump(&self.tasks_failed);
    }

    pub fn record_top_up(&self) {
        bump(&self.top_ups_applied);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            reservations_granted: self.reservations_granted.load(Ordering::Relaxed),
            reservations_denied: self.reservations_denied.load(Ordering::Relaxed),
            store_degraded: self.store_degraded.load(Ordering::Relaxed),
            refunds: self.refunds.load(Ordering::Relaxed),
            refund_failures: self.refund_failures.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            top_ups_applied: self.top_ups_applied.load(Ordering::Relaxed),
        }
    }
}
