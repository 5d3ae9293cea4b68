use super::{
    authority::CertificateIssuer,
    cache::CertificateCache,
    certificate::{Certificate, Identity},
};
use crate::{
    error::PkiError,
    messaging::{events::RotationEvent, EventBroker},
    wait::{retry_with_backoff, RetryConfig},
};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use strum_macros::Display;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub(crate) struct ManagerConfig {
    pub(crate) validity_period: Duration,
    /// Fraction of the validity period after which a certificate is renewed, in (0, 1)
    pub(crate) rotation_threshold: f64,
    pub(crate) retry: RetryConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
pub(crate) enum CertificateState {
    Unissued,
    Valid,
    Renewing,
    Expired,
}

/// Owns issuance and renewal. The only component that writes to the certificate cache.
pub(crate) struct CertificateManager {
    issuer: Arc<dyn CertificateIssuer>,
    cache: Arc<CertificateCache>,
    broker: Arc<EventBroker>,
    config: ManagerConfig,
    issuance_locks: Mutex<HashMap<Identity, Arc<tokio::sync::Mutex<()>>>>,
    renewing: Mutex<HashSet<Identity>>,
    rotations: Mutex<HashMap<Identity, JoinHandle<()>>>,
}

impl CertificateManager {
    pub(crate) fn new(issuer: Arc<dyn CertificateIssuer>, cache: Arc<CertificateCache>, broker: Arc<EventBroker>, config: ManagerConfig) -> Self {
        Self {
            issuer,
            cache,
            broker,
            config,
            issuance_locks: Mutex::new(HashMap::new()),
            renewing: Mutex::new(HashSet::new()),
            rotations: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Read-only, never issues
    pub(crate) fn get_certificate(&self, identity: &Identity) -> Result<Arc<Certificate>, PkiError> {
        self.cache.get(identity)
    }

    pub(crate) fn list_certificates(&self) -> Vec<Arc<Certificate>> {
        self.cache.list()
    }

    pub(crate) fn root_certificate_pem(&self) -> String {
        self.issuer.root_certificate_pem().to_string()
    }

    fn issuance_lock(&self, identity: &Identity) -> Arc<tokio::sync::Mutex<()>> {
        self.issuance_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    /// Issue a new certificate for `identity`, replacing its current one. At most one issuance per
    /// identity is in flight at any time; concurrent callers for the same identity queue up.
    pub(crate) async fn issue_certificate(&self, identity: &Identity, validity_period: Duration) -> Result<Arc<Certificate>, PkiError> {
        let lock = self.issuance_lock(identity);
        let _guard = lock.lock().await;

        self.issue_locked(identity, validity_period).await
    }

    /// Return the current certificate, issuing one and putting it under rotation if there is none
    pub(crate) async fn get_or_issue_certificate(self: &Arc<Self>, identity: &Identity) -> Result<Arc<Certificate>, PkiError> {
        if let Ok(certificate) = self.cache.get(identity) {
            return Ok(certificate);
        }

        let lock = self.issuance_lock(identity);
        let guard = lock.lock().await;

        // Someone else may have issued while we waited for the lock
        let certificate = match self.cache.get(identity) {
            Ok(certificate) => certificate,
            Err(_) => self.issue_locked(identity, self.config.validity_period).await?,
        };
        drop(guard);

        self.start_rotation(identity);

        Ok(certificate)
    }

    async fn issue_locked(&self, identity: &Identity, validity_period: Duration) -> Result<Arc<Certificate>, PkiError> {
        let replacing = self.cache.get(identity).is_ok();
        if replacing {
            self.renewing.lock().unwrap_or_else(PoisonError::into_inner).insert(identity.clone());
        }

        let result = retry_with_backoff(
            &self.config.retry,
            &format!("issuing certificate for {}", identity),
            PkiError::is_retryable,
            || {
                let issuer = Arc::clone(&self.issuer);
                let identity = identity.clone();
                async move {
                    tokio::task::spawn_blocking(move || issuer.issue(&identity, validity_period))
                        .await
                        .map_err(|err| PkiError::SigningFailure(format!("signing task: {}", err)))?
                }
            },
        )
        .await;

        if replacing {
            self.renewing.lock().unwrap_or_else(PoisonError::into_inner).remove(identity);
        }

        // On failure the previous certificate, if any, stays current
        let certificate = Arc::new(result?);

        // The cache write must be visible before anyone hears about the rotation
        self.cache.put(Arc::clone(&certificate));

        let subscribers = self.broker.rotations.publish(RotationEvent {
            identity: identity.clone(),
            certificate: Arc::clone(&certificate),
            timestamp: Utc::now(),
        });

        log::info!("Issued {} ({} rotation subscribers)", certificate, subscribers);

        Ok(certificate)
    }

    /// Keep `identity`'s certificate renewed once `rotation_threshold` of its validity has elapsed.
    /// Does nothing if a rotation loop is already running for it.
    pub(crate) fn start_rotation(self: &Arc<Self>, identity: &Identity) {
        let mut rotations = self.rotations.lock().unwrap_or_else(PoisonError::into_inner);

        if rotations.get(identity).is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        rotations.insert(identity.clone(), tokio::spawn(Arc::clone(self).rotation_loop(identity.clone())));
    }

    async fn rotation_loop(self: Arc<Self>, identity: Identity) {
        loop {
            let renew_at = match self.cache.get(&identity) {
                Ok(certificate) => certificate.renew_at(self.config.rotation_threshold),
                Err(_) => {
                    log::info!("No certificate for {} anymore, stopping rotation", identity);
                    return;
                }
            };

            tokio::time::sleep((renew_at - Utc::now()).to_std().unwrap_or_default()).await;

            if let Err(err) = self.issue_certificate(&identity, self.config.validity_period).await {
                log::error!("Rotation of {} failed, keeping current certificate: {}", identity, err);
                tokio::time::sleep(self.config.retry.max_delay).await;
            }
        }
    }

    /// Forget `identity`: stop rotating it and drop its certificate from the cache. Waits for an
    /// issuance in flight so it cannot put the identity back afterwards.
    pub(crate) async fn release_certificate(&self, identity: &Identity) -> Result<Arc<Certificate>, PkiError> {
        let lock = self.issuance_lock(identity);
        let guard = lock.lock().await;

        if let Some(handle) = self.rotations.lock().unwrap_or_else(PoisonError::into_inner).remove(identity) {
            handle.abort();
        }
        let released = self.cache.delete(identity).ok_or_else(|| PkiError::NotFound(identity.clone()));

        drop(guard);
        self.forget_issuance_lock(identity, lock);

        released
    }

    /// Drop the identity's lock entry unless another caller still holds a handle to it. Handles are
    /// only cloned under the map lock, so the count cannot grow while we look at it.
    fn forget_issuance_lock(&self, identity: &Identity, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.issuance_locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(identity).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(identity);
        }
    }

    pub(crate) fn tracked_identities(&self) -> usize {
        self.issuance_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn certificate_state(&self, identity: &Identity) -> CertificateState {
        match self.cache.get(identity) {
            Err(_) => CertificateState::Unissued,
            Ok(_) if self.renewing.lock().unwrap_or_else(PoisonError::into_inner).contains(identity) => CertificateState::Renewing,
            Ok(certificate) if certificate.is_expired_at(Utc::now()) => CertificateState::Expired,
            Ok(_) => CertificateState::Valid,
        }
    }

    pub(crate) fn rotating(&self) -> usize {
        self.rotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Stop all rotation loops. Certificates stay in the cache.
    pub(crate) fn shutdown(&self) {
        for (identity, handle) in self.rotations.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            log::debug!("Stopping rotation of {}", identity);
            handle.abort();
        }
    }
}
