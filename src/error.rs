use crate::{pki::certificate::Identity, registry::ProxyId};
use std::time::Duration;
use thiserror::Error;

/// Failures of the certificate authority, cache and manager
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum PkiError {
    /// The CA could not produce a certificate. Transient, retried with backoff by the manager.
    #[error("signing failure: {0}")]
    SigningFailure(String),

    #[error("no certificate found for identity {0}")]
    NotFound(Identity),

    /// The requested leaf validity would outlive the CA's own certificate. Retrying cannot fix
    /// this, the CA itself has to be replaced.
    #[error("requested validity for {identity} ends at {requested_not_after}, after the CA expires at {ca_not_after}")]
    CaValidityExceeded {
        identity: Identity,
        requested_not_after: chrono::DateTime<chrono::Utc>,
        ca_not_after: chrono::DateTime<chrono::Utc>,
    },

    #[error("invalid CA material: {0}")]
    InvalidCaMaterial(String),
}

impl PkiError {
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, PkiError::SigningFailure(_))
    }
}

impl From<rcgen::Error> for PkiError {
    fn from(error: rcgen::Error) -> Self {
        PkiError::SigningFailure(error.to_string())
    }
}

/// Per-proxy delivery failures. These are always isolated to the proxy they concern and are
/// reported through delivery outcomes and statistics, never propagated to the caller of a
/// broadcast.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    #[error("agent for proxy {proxy_id} unreachable: {reason}")]
    AgentUnreachable { proxy_id: ProxyId, reason: String },

    #[error("push of version {version} to proxy {proxy_id} timed out after {after:?}")]
    PushTimeout { proxy_id: ProxyId, version: u64, after: Duration },

    #[error("agent endpoint not ready after {0:?}")]
    ReadinessTimeout(Duration),

    /// Not a failure as such, an unstarted job was replaced by a newer one for the same proxy
    #[error("version {version} for proxy {proxy_id} superseded by version {superseded_by}")]
    StaleVersionDiscarded { proxy_id: ProxyId, version: u64, superseded_by: u64 },

    #[error("proxy {0} is no longer registered")]
    ProxyGone(ProxyId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum RegistryError {
    #[error("proxy {0} is not registered")]
    NotRegistered(ProxyId),

    /// The proxy disconnected and reconnected since the caller looked it up
    #[error("registration generation {expected} of proxy {proxy_id} was replaced by generation {actual}")]
    StaleRegistration { proxy_id: ProxyId, expected: u64, actual: u64 },

    #[error("version {attempted} for proxy {proxy_id} is not greater than last delivered version {last_delivered}")]
    NonMonotonicVersion {
        proxy_id: ProxyId,
        attempted: u64,
        last_delivered: u64,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_signing_failures_are_retryable() {
        assert!(PkiError::SigningFailure("boom".to_string()).is_retryable());
        assert!(!PkiError::NotFound(Identity::from("bookstore")).is_retryable());
        assert!(!PkiError::InvalidCaMaterial("bad pem".to_string()).is_retryable());
    }

    #[test]
    fn messages_name_the_proxy() {
        let error = DeliveryError::StaleVersionDiscarded {
            proxy_id: ProxyId::from("p1"),
            version: 3,
            superseded_by: 4,
        };
        assert_eq!(error.to_string(), "version 3 for proxy p1 superseded by version 4");
    }
}
