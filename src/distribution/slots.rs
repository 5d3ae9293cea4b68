use super::DeliveryOutcome;
use crate::{catalog::Bundle, registry::ProxyId};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, PoisonError,
    },
};
use tokio::sync::oneshot;

/// A delivery that has been assigned a version but not started yet
pub(crate) struct PendingDelivery {
    pub(crate) version: u64,
    /// Registration generation of the proxy when the delivery was created
    pub(crate) generation: u64,
    pub(crate) bundle: Bundle,
    pub(crate) done: oneshot::Sender<DeliveryOutcome>,
}

impl PendingDelivery {
    pub(crate) fn finish(self, outcome: DeliveryOutcome) {
        // The caller may have stopped caring
        let _ = self.done.send(outcome);
    }
}

#[derive(Default)]
struct Slot {
    /// Last version handed out
    version: u64,
    pending: Option<PendingDelivery>,
    /// A drain job for this proxy is queued or running
    scheduled: bool,
}

impl Slot {
    fn idle(&self) -> bool {
        !self.scheduled && self.pending.is_none()
    }
}

pub(crate) struct Enqueued {
    pub(crate) version: u64,
    /// No drain job is scheduled for the proxy, the caller has to submit one
    pub(crate) schedule: bool,
    /// The older pending delivery this one replaced
    pub(crate) superseded: Option<PendingDelivery>,
}

/// Per-proxy single-slot queues. Each proxy has its own lock guarding its version counter and
/// pending delivery; the map lock is only held to look a slot up and lock it.
///
/// Idle slots of departed proxies are evicted. New slots start counting from the highest version
/// any evicted slot reached, so a proxy that comes back never sees a version go backwards.
#[derive(Default)]
pub(crate) struct DeliverySlots {
    slots: Mutex<HashMap<ProxyId, Arc<Mutex<Slot>>>>,
    /// Highest version of any evicted slot, only touched under the map lock
    evicted_high_water: AtomicU64,
}

impl DeliverySlots {
    /// Run `f` on the proxy's slot, if it has one. The slot lock is taken before the map lock is
    /// released, so eviction can never pull a slot out from under a caller.
    fn with_slot<R>(&self, proxy_id: &ProxyId, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = Arc::clone(slots.get(proxy_id)?);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        drop(slots);

        Some(f(&mut slot))
    }

    /// Assign the next version to `bundle` and make it the proxy's pending delivery, replacing any
    /// pending one that has not started
    pub(crate) fn enqueue(&self, proxy_id: &ProxyId, generation: u64, bundle: Bundle, done: oneshot::Sender<DeliveryOutcome>) -> Enqueued {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = Arc::clone(slots.entry(proxy_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                version: self.evicted_high_water.load(Relaxed),
                ..Slot::default()
            }))
        }));
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        drop(slots);

        slot.version += 1;
        let version = slot.version;

        let superseded = slot.pending.replace(PendingDelivery {
            version,
            generation,
            bundle,
            done,
        });

        let schedule = !slot.scheduled;
        slot.scheduled = true;

        Enqueued {
            version,
            schedule,
            superseded,
        }
    }

    /// Start the pending delivery. With nothing pending, the proxy is marked unscheduled.
    pub(crate) fn take(&self, proxy_id: &ProxyId) -> Option<PendingDelivery> {
        self.with_slot(proxy_id, |slot| {
            let pending = slot.pending.take();
            if pending.is_none() {
                slot.scheduled = false;
            }
            pending
        })
        .flatten()
    }

    /// Called by a drain job when it is done. True if something new arrived meanwhile, in which
    /// case the proxy stays scheduled and the caller has to submit another drain.
    pub(crate) fn reschedule_needed(&self, proxy_id: &ProxyId) -> bool {
        self.with_slot(proxy_id, |slot| {
            if slot.pending.is_some() {
                return true;
            }
            slot.scheduled = false;
            false
        })
        .unwrap_or(false)
    }

    /// Drop the pending delivery without starting it
    pub(crate) fn cancel(&self, proxy_id: &ProxyId) -> Option<PendingDelivery> {
        self.with_slot(proxy_id, |slot| slot.pending.take()).flatten()
    }

    /// Unschedule a proxy whose drain could not be submitted, returning what was pending
    pub(crate) fn abandon(&self, proxy_id: &ProxyId) -> Option<PendingDelivery> {
        self.with_slot(proxy_id, |slot| {
            slot.scheduled = false;
            slot.pending.take()
        })
        .flatten()
    }

    /// Last version assigned to the proxy, 0 if it has no slot
    pub(crate) fn version(&self, proxy_id: &ProxyId) -> u64 {
        self.with_slot(proxy_id, |slot| slot.version).unwrap_or(0)
    }

    /// Remove the proxy's slot if nothing is pending or running for it. Returns whether it was
    /// removed.
    pub(crate) fn evict_idle(&self, proxy_id: &ProxyId) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(slot) = slots.get(proxy_id) else {
            return false;
        };

        {
            let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !slot.idle() {
                return false;
            }
            self.evicted_high_water.fetch_max(slot.version, Relaxed);
        }

        slots.remove(proxy_id);
        true
    }

    /// Evict the idle slots of every proxy `registered` says is gone, returning how many went
    pub(crate) fn evict_departed(&self, registered: impl Fn(&ProxyId) -> bool) -> usize {
        let proxy_ids = self.slots.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect::<Vec<_>>();

        proxy_ids
            .iter()
            .filter(|proxy_id| !registered(*proxy_id))
            .filter(|proxy_id| self.evict_idle(*proxy_id))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
