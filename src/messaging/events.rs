use crate::{
    pki::certificate::{Certificate, Identity},
    registry::ProxyId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Emitted once per successful issuance or renewal, after the certificate is in the cache
#[derive(Clone, Debug)]
pub(crate) struct RotationEvent {
    pub(crate) identity: Identity,
    pub(crate) certificate: Arc<Certificate>,
    pub(crate) timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ProxyEvent {
    Connected { proxy_id: ProxyId, identity: Identity },
    Disconnected { proxy_id: ProxyId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Affected {
    All,
    Identities(Vec<Identity>),
}

/// Published by the catalog when traffic policy or topology changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TopologyEvent {
    pub(crate) affected: Affected,
}

impl TopologyEvent {
    pub(crate) fn all() -> Self {
        Self { affected: Affected::All }
    }

    pub(crate) fn identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            affected: Affected::Identities(identities.into_iter().collect()),
        }
    }

    pub(crate) fn affects(&self, identity: &Identity) -> bool {
        match &self.affected {
            Affected::All => true,
            Affected::Identities(identities) => identities.contains(identity),
        }
    }
}
