use super::certificate::{Certificate, Identity, SerialNumber};
use crate::error::PkiError;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

#[derive(Default)]
struct Slot {
    current: Option<Arc<Certificate>>,
    /// Replaced certificates, kept for lookups by serial until they expire
    superseded: Vec<Arc<Certificate>>,
}

/// Identity to current certificate. Readers get an `Arc` to an immutable certificate so a
/// concurrent `put` can only ever swap the pointer, never expose a partially written certificate.
///
/// The outer map lock is only held to find or create an identity's slot, so writers for different
/// identities never wait on each other.
#[derive(Default)]
pub(crate) struct CertificateCache {
    slots: RwLock<HashMap<Identity, Arc<RwLock<Slot>>>>,
}

impl CertificateCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&self, identity: &Identity) -> Option<Arc<RwLock<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).get(identity).cloned()
    }

    fn slot_or_insert(&self, identity: &Identity) -> Arc<RwLock<Slot>> {
        if let Some(slot) = self.slot(identity) {
            return slot;
        }

        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    pub(crate) fn get(&self, identity: &Identity) -> Result<Arc<Certificate>, PkiError> {
        self.slot(identity)
            .and_then(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).current.clone())
            .ok_or_else(|| PkiError::NotFound(identity.clone()))
    }

    /// Make `certificate` the current one for its identity. The previous current certificate moves
    /// to the superseded list and expired superseded certificates are dropped.
    pub(crate) fn put(&self, certificate: Arc<Certificate>) {
        let slot = self.slot_or_insert(&certificate.identity);
        let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now();
        slot.superseded.retain(|old| !old.is_expired_at(now));

        if let Some(previous) = slot.current.replace(certificate) {
            if !previous.is_expired_at(now) {
                slot.superseded.push(previous);
            }
        }
    }

    /// Forget everything about `identity`, returning its current certificate if it had one
    pub(crate) fn delete(&self, identity: &Identity) -> Option<Arc<Certificate>> {
        let slot = self.slots.write().unwrap_or_else(PoisonError::into_inner).remove(identity)?;
        let current = slot.write().unwrap_or_else(PoisonError::into_inner).current.take();
        current
    }

    /// Current certificates of all identities, ordered by identity
    pub(crate) fn list(&self) -> Vec<Arc<Certificate>> {
        let slots = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut certificates = slots
            .iter()
            .filter_map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).current.clone())
            .collect::<Vec<_>>();
        certificates.sort_by(|a, b| a.identity.cmp(&b.identity));
        certificates
    }

    /// Look up a certificate by serial, including superseded ones that have not expired at `now`
    pub(crate) fn get_by_serial(&self, identity: &Identity, serial_number: SerialNumber, now: DateTime<Utc>) -> Result<Arc<Certificate>, PkiError> {
        let not_found = || PkiError::NotFound(identity.clone());
        let slot = self.slot(identity).ok_or_else(not_found)?;
        let slot = slot.read().unwrap_or_else(PoisonError::into_inner);

        slot.current
            .iter()
            .chain(slot.superseded.iter())
            .find(|certificate| certificate.serial_number == serial_number && !certificate.is_expired_at(now))
            .cloned()
            .ok_or_else(not_found)
    }

    pub(crate) fn len(&self) -> usize {
        self.list().len()
    }
}
