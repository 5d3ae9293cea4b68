use super::DeliveryOutcome;
use crate::error::DeliveryError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Running totals of delivery outcomes, the observability channel for per-proxy failures
#[derive(Default, Debug, Serialize)]
pub(crate) struct DeliveryStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    superseded: AtomicU64,
    discarded: AtomicU64,
    cancelled: AtomicU64,
}

impl DeliveryStats {
    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Relaxed);
    }

    pub(crate) fn record(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered { .. } => &self.delivered,
            DeliveryOutcome::Failed(DeliveryError::PushTimeout { .. }) => &self.timed_out,
            DeliveryOutcome::Failed(_) => &self.failed,
            DeliveryOutcome::Discarded(DeliveryError::StaleVersionDiscarded { .. }) => &self.superseded,
            DeliveryOutcome::Discarded(_) => &self.discarded,
            DeliveryOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Relaxed);
    }

    pub(crate) fn enqueued(&self) -> u64 {
        self.enqueued.load(Relaxed)
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Relaxed)
    }

    pub(crate) fn timed_out(&self) -> u64 {
        self.timed_out.load(Relaxed)
    }

    pub(crate) fn superseded(&self) -> u64 {
        self.superseded.load(Relaxed)
    }

    pub(crate) fn discarded(&self) -> u64 {
        self.discarded.load(Relaxed)
    }

    pub(crate) fn cancelled(&self) -> u64 {
        self.cancelled.load(Relaxed)
    }
}
