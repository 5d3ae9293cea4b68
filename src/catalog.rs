use crate::{
    pki::{certificate::Identity, manager::CertificateManager},
    registry::{ProxyId, ProxyRecord},
};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    fmt::Display,
    sync::{Arc, PoisonError, RwLock},
};

/// Opaque configuration payload for a proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Bundle {
    content: Bytes,
}

impl Bundle {
    pub(crate) fn new(content: Bytes) -> Self {
        Self { content }
    }

    pub(crate) fn content(&self) -> &Bytes {
        &self.content
    }

    pub(crate) fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.content))
    }
}

impl Display for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes, sha256 {}", self.content.len(), &self.digest()[..12])
    }
}

/// Produces the configuration content pushed to proxies. What goes into a bundle is entirely up to
/// the implementation.
pub(crate) trait BundleCatalog: Send + Sync {
    /// The bundle every proxy gets when the server first comes up
    fn bootstrap_bundle(&self) -> Result<Bundle>;

    fn bundle_for(&self, proxy: &ProxyRecord) -> Result<Bundle>;
}

#[derive(Serialize)]
struct CertificateMaterial<'a> {
    serial_number: String,
    not_after: String,
    certificate: String,
    private_key: &'a str,
}

#[derive(Serialize)]
struct ProxyBundle<'a> {
    proxy_id: &'a ProxyId,
    identity: &'a Identity,
    config: &'a Value,
    trust_bundle: &'a str,
    certificate: Option<CertificateMaterial<'a>>,
}

/// Every proxy gets the same base configuration plus its own certificate and the mesh trust
/// bundle, serialized as JSON.
pub(crate) struct StaticBundleCatalog {
    base: RwLock<Value>,
    manager: Arc<CertificateManager>,
}

fn parse_base(yaml: &[u8]) -> Result<Value> {
    serde_yaml::from_slice(yaml).context("parsing base bundle YAML")
}

impl StaticBundleCatalog {
    pub(crate) fn new(base: Value, manager: Arc<CertificateManager>) -> Self {
        Self {
            base: RwLock::new(base),
            manager,
        }
    }

    /// Base configuration from YAML (JSON being a subset of it)
    pub(crate) fn from_yaml(yaml: &[u8], manager: Arc<CertificateManager>) -> Result<Self> {
        Ok(Self::new(parse_base(yaml)?, manager))
    }

    /// Swap in a new base configuration. Returns whether it differs from the old one. Bundles
    /// built afterwards use the new base; publishing the topology change is up to the caller.
    pub(crate) fn reload(&self, yaml: &[u8]) -> Result<bool> {
        let base = parse_base(yaml)?;
        let mut current = self.base.write().unwrap_or_else(PoisonError::into_inner);

        if *current == base {
            return Ok(false);
        }

        *current = base;
        Ok(true)
    }

    fn base(&self) -> Value {
        self.base.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl BundleCatalog for StaticBundleCatalog {
    fn bootstrap_bundle(&self) -> Result<Bundle> {
        let trust_bundle = self.manager.root_certificate_pem();
        let content = serde_json::to_vec(&serde_json::json!({
            "config": self.base(),
            "trust_bundle": trust_bundle,
        }))
        .context("serializing bootstrap bundle")?;

        Ok(Bundle::new(Bytes::from(content)))
    }

    fn bundle_for(&self, proxy: &ProxyRecord) -> Result<Bundle> {
        let trust_bundle = self.manager.root_certificate_pem();
        let base = self.base();

        // A proxy whose identity has no certificate yet still gets its configuration
        let certificate = self.manager.get_certificate(&proxy.identity).ok();

        let content = serde_json::to_vec(&ProxyBundle {
            proxy_id: &proxy.proxy_id,
            identity: &proxy.identity,
            config: &base,
            trust_bundle: &trust_bundle,
            certificate: certificate.as_ref().map(|certificate| CertificateMaterial {
                serial_number: certificate.serial_number.to_string(),
                not_after: certificate.not_after.to_rfc3339(),
                certificate: certificate.pem(),
                private_key: certificate.private_key.pem(),
            }),
        })
        .context(format!("serializing bundle for proxy {}", proxy.proxy_id))?;

        Ok(Bundle::new(Bytes::from(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messaging::EventBroker,
        pki::{
            authority::tests::test_ca,
            cache::CertificateCache,
            manager::ManagerConfig,
        },
        registry::{ConnectionHandle, ProxyRegistry},
        wait::RetryConfig,
    };
    use std::time::Duration;

    fn manager() -> Arc<CertificateManager> {
        Arc::new(CertificateManager::new(
            Arc::new(test_ca(Duration::from_secs(3600 * 48))),
            Arc::new(CertificateCache::new()),
            Arc::new(EventBroker::new(16)),
            ManagerConfig {
                validity_period: Duration::from_secs(3600),
                rotation_threshold: 0.8,
                retry: RetryConfig::default(),
            },
        ))
    }

    #[tokio::test]
    async fn proxy_bundle_carries_its_certificate() {
        let manager = manager();
        let catalog = StaticBundleCatalog::from_yaml(b"listeners:\n  - port: 8080\n", manager.clone()).unwrap();
        let registry = ProxyRegistry::new(Arc::new(EventBroker::new(16)));
        let record = registry.register(ProxyId::from("p1"), Identity::from("bookstore"), ConnectionHandle("c1".to_string()));

        let before: Value = serde_json::from_slice(catalog.bundle_for(&record).unwrap().content()).unwrap();
        assert_eq!(before["certificate"], Value::Null);
        assert_eq!(before["config"]["listeners"][0]["port"], 8080);

        let certificate = manager.issue_certificate(&record.identity, Duration::from_secs(3600)).await.unwrap();

        let after: Value = serde_json::from_slice(catalog.bundle_for(&record).unwrap().content()).unwrap();
        assert_eq!(after["proxy_id"], "p1");
        assert_eq!(after["certificate"]["serial_number"], certificate.serial_number.to_string());
        assert!(after["certificate"]["private_key"].as_str().unwrap().contains("PRIVATE KEY"));
        assert_eq!(after["trust_bundle"], manager.root_certificate_pem());
    }

    #[test]
    fn bootstrap_bundle_is_shared_config() {
        let catalog = StaticBundleCatalog::new(serde_json::json!({"mode": "strict"}), manager());
        let first = catalog.bootstrap_bundle().unwrap();
        let second = catalog.bootstrap_bundle().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.digest().len(), 64);

        let value: Value = serde_json::from_slice(first.content()).unwrap();
        assert_eq!(value["config"]["mode"], "strict");
    }

    #[test]
    fn reload_changes_subsequent_bundles() {
        let catalog = StaticBundleCatalog::from_yaml(b"mode: strict\n", manager()).unwrap();
        let before = catalog.bootstrap_bundle().unwrap();

        assert!(!catalog.reload(b"mode: strict\n").unwrap());
        assert_eq!(catalog.bootstrap_bundle().unwrap(), before);

        assert!(catalog.reload(b"mode: permissive\n").unwrap());
        let value: Value = serde_json::from_slice(catalog.bootstrap_bundle().unwrap().content()).unwrap();
        assert_eq!(value["config"]["mode"], "permissive");

        assert!(catalog.reload(b"mode: [unclosed\n").is_err());
        let value: Value = serde_json::from_slice(catalog.bootstrap_bundle().unwrap().content()).unwrap();
        assert_eq!(value["config"]["mode"], "permissive");
    }
}
