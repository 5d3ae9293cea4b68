use crate::{catalog::Bundle, registry::ProxyId};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// The two operations the control plane needs from whatever talks to the data-plane agents
#[async_trait]
pub(crate) trait AgentClient: Send + Sync {
    /// Whether the agent-hosting endpoint accepts pushes yet
    async fn is_agent_ready(&self) -> Result<bool>;

    async fn push_bundle(&self, target: &ProxyId, version: u64, bundle: &Bundle) -> Result<()>;
}

/// Logs every push instead of sending it anywhere. Always ready.
#[derive(Default)]
pub(crate) struct DryRunAgentClient {
    pushes: AtomicU64,
}

impl DryRunAgentClient {
    pub(crate) fn pushes(&self) -> u64 {
        self.pushes.load(Relaxed)
    }
}

#[async_trait]
impl AgentClient for DryRunAgentClient {
    async fn is_agent_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn push_bundle(&self, target: &ProxyId, version: u64, bundle: &Bundle) -> Result<()> {
        self.pushes.fetch_add(1, Relaxed);
        log::info!("[dry-run] push to {} version {} ({})", target, version, bundle);
        Ok(())
    }
}
