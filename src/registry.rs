use crate::{
    error::RegistryError,
    messaging::{events::ProxyEvent, EventBroker},
    pki::certificate::Identity,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, PoisonError, RwLock,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub(crate) struct ProxyId(String);

impl ProxyId {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProxyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for ProxyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to the agent connection a proxy came in on. Only the transport knows what it
/// means.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub(crate) struct ConnectionHandle(pub(crate) String);

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ProxyRecord {
    pub(crate) proxy_id: ProxyId,
    pub(crate) identity: Identity,
    pub(crate) connection: ConnectionHandle,
    /// Distinguishes this registration from earlier ones of the same proxy id
    pub(crate) generation: u64,
    /// 0 until the first delivery
    pub(crate) last_delivered_version: u64,
    pub(crate) enqueued: bool,
    pub(crate) connected_at: DateTime<Utc>,
}

/// The proxies currently believed to be connected. Read-mostly; `list` returns snapshots.
pub(crate) struct ProxyRegistry {
    proxies: RwLock<HashMap<ProxyId, ProxyRecord>>,
    next_generation: AtomicU64,
    broker: Arc<EventBroker>,
}

impl ProxyRegistry {
    pub(crate) fn new(broker: Arc<EventBroker>) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            broker,
        }
    }

    /// Register a connected proxy. A proxy id that is already registered is treated as a
    /// reconnect: its record is replaced and it gets a new generation.
    pub(crate) fn register(&self, proxy_id: ProxyId, identity: Identity, connection: ConnectionHandle) -> ProxyRecord {
        let record = ProxyRecord {
            proxy_id: proxy_id.clone(),
            identity: identity.clone(),
            connection,
            generation: self.next_generation.fetch_add(1, Relaxed),
            last_delivered_version: 0,
            enqueued: false,
            connected_at: Utc::now(),
        };

        let previous = self
            .proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(proxy_id.clone(), record.clone());

        match previous {
            Some(previous) => log::info!(
                "Proxy {} ({}) reconnected, generation {} replaces {}",
                proxy_id,
                identity,
                record.generation,
                previous.generation
            ),
            None => log::info!("Proxy {} ({}) connected", proxy_id, identity),
        }

        self.broker.proxies.publish(ProxyEvent::Connected { proxy_id, identity });

        record
    }

    pub(crate) fn unregister(&self, proxy_id: &ProxyId) -> Result<ProxyRecord, RegistryError> {
        let record = self
            .proxies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(proxy_id)
            .ok_or_else(|| RegistryError::NotRegistered(proxy_id.clone()))?;

        log::info!("Proxy {} ({}) disconnected", proxy_id, record.identity);

        self.broker.proxies.publish(ProxyEvent::Disconnected {
            proxy_id: proxy_id.clone(),
        });

        Ok(record)
    }

    pub(crate) fn get(&self, proxy_id: &ProxyId) -> Option<ProxyRecord> {
        self.proxies.read().unwrap_or_else(PoisonError::into_inner).get(proxy_id).cloned()
    }

    /// Snapshot of all registered proxies ordered by id. Later changes are not reflected.
    pub(crate) fn list(&self) -> Vec<ProxyRecord> {
        let mut records = self
            .proxies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.proxy_id.cmp(&b.proxy_id));
        records
    }

    pub(crate) fn list_by_identity(&self, identity: &Identity) -> Vec<ProxyRecord> {
        self.list().into_iter().filter(|record| &record.identity == identity).collect()
    }

    /// Check that `generation` is still the live registration of `proxy_id`
    pub(crate) fn ensure_current(&self, proxy_id: &ProxyId, generation: u64) -> Result<(), RegistryError> {
        let proxies = self.proxies.read().unwrap_or_else(PoisonError::into_inner);
        let record = proxies.get(proxy_id).ok_or_else(|| RegistryError::NotRegistered(proxy_id.clone()))?;

        if record.generation != generation {
            return Err(RegistryError::StaleRegistration {
                proxy_id: proxy_id.clone(),
                expected: generation,
                actual: record.generation,
            });
        }

        Ok(())
    }

    /// Record a completed delivery. Versions must strictly increase per registration.
    pub(crate) fn update_last_delivered(&self, proxy_id: &ProxyId, generation: u64, version: u64) -> Result<(), RegistryError> {
        let mut proxies = self.proxies.write().unwrap_or_else(PoisonError::into_inner);
        let record = proxies
            .get_mut(proxy_id)
            .ok_or_else(|| RegistryError::NotRegistered(proxy_id.clone()))?;

        if record.generation != generation {
            return Err(RegistryError::StaleRegistration {
                proxy_id: proxy_id.clone(),
                expected: generation,
                actual: record.generation,
            });
        }

        if version <= record.last_delivered_version {
            return Err(RegistryError::NonMonotonicVersion {
                proxy_id: proxy_id.clone(),
                attempted: version,
                last_delivered: record.last_delivered_version,
            });
        }

        record.last_delivered_version = version;
        Ok(())
    }

    pub(crate) fn set_enqueued(&self, proxy_id: &ProxyId, enqueued: bool) {
        if let Some(record) = self.proxies.write().unwrap_or_else(PoisonError::into_inner).get_mut(proxy_id) {
            record.enqueued = enqueued;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.proxies.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
