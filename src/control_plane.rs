use crate::{
    catalog::StaticBundleCatalog,
    config::ControlPlaneConfig,
    distribution::{DistributionConfig, DistributionServer},
    logging::{self, CaSummary, CertificateSummary, Summary},
    messaging::{events::TopologyEvent, EventBroker},
    pki::{
        authority::CertificateAuthority,
        cache::CertificateCache,
        key_pool::KeyPool,
        manager::{CertificateManager, ManagerConfig},
    },
    registry::{ConnectionHandle, ProxyRegistry},
    transport::{AgentClient, DryRunAgentClient},
    wait::RetryConfig,
    workerpool::WorkerPool,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tokio::signal::unix::{signal, SignalKind};

/// All long-lived components, wired together
pub(crate) struct ControlPlane {
    ca: Arc<CertificateAuthority>,
    broker: Arc<EventBroker>,
    manager: Arc<CertificateManager>,
    catalog: Arc<StaticBundleCatalog>,
    registry: Arc<ProxyRegistry>,
    pool: Arc<WorkerPool>,
    client: Arc<DryRunAgentClient>,
    server: Arc<DistributionServer>,
    started: Instant,
}

pub(crate) async fn run(config: &ControlPlaneConfig) -> Result<()> {
    let control_plane = ControlPlane::start(config).await.context("starting control plane")?;

    control_plane.serve_until_shutdown(config).await.context("waiting for shutdown signal")?;

    control_plane.shutdown(config).await.context("shutting down control plane")?;

    Ok(())
}

async fn load_or_create_ca(config: &ControlPlaneConfig, key_pool: Arc<KeyPool>) -> Result<CertificateAuthority> {
    if let Some(ca_bundle) = &config.ca_bundle {
        if ca_bundle.exists() {
            let ca = CertificateAuthority::load_ca(&ca_bundle.read()?, &config.ca_organization, key_pool)
                .context(format!("loading CA from {}", ca_bundle))?;
            log::info!("Loaded {} from {}", ca, ca_bundle);
            return Ok(ca);
        }
    }

    let (common_name, organization, validity) = (config.ca_common_name.clone(), config.ca_organization.clone(), config.ca_validity);
    let ca = tokio::task::spawn_blocking(move || CertificateAuthority::new(&common_name, &organization, validity, key_pool))
        .await
        .context("joining CA generation task")?
        .context("generating CA")?;
    log::info!("Generated {}", ca);

    if let Some(ca_bundle) = &config.ca_bundle {
        ca_bundle.write(&ca.export_ca()).context("exporting CA")?;
        log::info!("Exported CA to {}", ca_bundle);
    }

    Ok(ca)
}

impl ControlPlane {
    pub(crate) async fn start(config: &ControlPlaneConfig) -> Result<Self> {
        let started = Instant::now();

        let key_pool = Arc::new(
            KeyPool::fill(config.key_algorithm, config.key_pool_size)
                .await
                .context(format!("pre-generating {} {} keys", config.key_pool_size, config.key_algorithm))?,
        );
        log::info!("Pre-generated {} {} keys", key_pool.remaining(), key_pool.algorithm());

        let ca = Arc::new(load_or_create_ca(config, key_pool).await?);

        let broker = Arc::new(EventBroker::new(config.subscriber_buffer));
        let manager = Arc::new(CertificateManager::new(
            Arc::clone(&ca) as _,
            Arc::new(CertificateCache::new()),
            Arc::clone(&broker),
            ManagerConfig {
                validity_period: config.validity_period,
                rotation_threshold: config.rotation_threshold,
                retry: RetryConfig {
                    max_attempts: config.issuance_max_attempts,
                    initial_delay: config.issuance_initial_backoff,
                    ..RetryConfig::default()
                },
            },
        ));

        let catalog = Arc::new(match &config.bundle_file {
            Some(bundle_file) => StaticBundleCatalog::from_yaml(&bundle_file.read()?, Arc::clone(&manager))
                .context(format!("loading base bundle from {}", bundle_file))?,
            None => StaticBundleCatalog::new(Value::Object(serde_json::Map::new()), Arc::clone(&manager)),
        });

        let registry = Arc::new(ProxyRegistry::new(Arc::clone(&broker)));
        let pool = Arc::new(WorkerPool::new(config.worker_pool_size, config.worker_queue_size));
        log::info!("Worker pool of {} workers, queue of {}", pool.size(), pool.queue_size());

        let client = Arc::new(DryRunAgentClient::default());
        let server = Arc::new(DistributionServer::new(
            Arc::clone(&registry),
            Arc::clone(&broker),
            Arc::clone(&pool),
            Arc::clone(&client) as Arc<dyn AgentClient>,
            Arc::clone(&catalog) as _,
            DistributionConfig {
                readiness_interval: config.readiness_interval,
                readiness_timeout: config.readiness_timeout,
                push_timeout: config.push_timeout,
            },
        ));

        let state = server.start().await;
        log::info!("Distribution server {}", state);

        // Registered after the server listens so each one gets its full bundle on connect
        for proxy in &config.proxies {
            manager
                .get_or_issue_certificate(&proxy.identity)
                .await
                .context(format!("issuing certificate for static proxy {}", proxy.proxy_id))?;

            registry.register(
                proxy.proxy_id.clone(),
                proxy.identity.clone(),
                ConnectionHandle(format!("static:{}", proxy.proxy_id)),
            );
        }

        log::info!(
            "Control plane up in {}.{:03}s with {} static proxies",
            started.elapsed().as_secs(),
            started.elapsed().subsec_millis(),
            config.proxies.len()
        );

        Ok(Self {
            ca,
            broker,
            manager,
            catalog,
            registry,
            pool,
            client,
            server,
            started,
        })
    }

    /// Run until SIGINT or SIGTERM. SIGHUP re-reads the bundle file and pushes fresh bundles to
    /// every proxy if it changed.
    pub(crate) async fn serve_until_shutdown(&self, config: &ControlPlaneConfig) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("listening for ctrl-c")?;
                    break;
                }
                _ = sigterm.recv() => break,
                _ = sighup.recv() => {
                    if let Err(err) = self.reload_bundle(config) {
                        log::error!("Reloading bundle file failed, keeping the current one: {:#}", err);
                    }
                }
            }
        }

        log::info!("Shutdown requested");

        Ok(())
    }

    pub(crate) fn reload_bundle(&self, config: &ControlPlaneConfig) -> Result<()> {
        let Some(bundle_file) = &config.bundle_file else {
            log::info!("No bundle file configured, nothing to reload");
            return Ok(());
        };

        if self.catalog.reload(&bundle_file.read()?).context(format!("reloading {}", bundle_file))? {
            let subscribers = self.broker.topology.publish(TopologyEvent::all());
            log::info!("Reloaded {}, notified {} subscribers", bundle_file, subscribers);
        } else {
            log::info!("{} unchanged", bundle_file);
        }

        Ok(())
    }

    /// Stop reacting to events, stop rotating, let queued deliveries finish and write the summary
    pub(crate) async fn shutdown(self, config: &ControlPlaneConfig) -> Result<()> {
        self.server.shutdown();
        self.manager.shutdown();
        self.pool.shutdown().await;

        log::info!(
            "Stopped after {} pushes, {} deliveries, {} dropped events",
            self.client.pushes(),
            self.server.stats().delivered(),
            self.broker.dropped_events()
        );
        log::debug!(
            "Delivery state held for {} proxies, issuance locks for {} identities",
            self.server.tracked_proxies(),
            self.manager.tracked_identities()
        );

        let uptime = self.started.elapsed();

        logging::generate_summary(Summary {
            config,
            ca: CaSummary {
                common_name: self.ca.common_name().to_string(),
                fingerprint: self.ca.fingerprint().to_string(),
                not_after: self.ca.not_after(),
                issued: self.ca.issued_count(),
            },
            certificates: self
                .manager
                .list_certificates()
                .into_iter()
                .map(|certificate| CertificateSummary {
                    identity: certificate.identity.clone(),
                    state: self.manager.certificate_state(&certificate.identity),
                    certificate,
                })
                .collect(),
            server_state: self.server.state(),
            proxies: self.registry.list(),
            deliveries: self.server.stats(),
            jobs: self.pool.stats(),
            dropped_events: self.broker.dropped_events(),
            uptime: format!("{}.{:03}s", uptime.as_secs(), uptime.subsec_millis()),
        })
        .context("generating summary")?;

        Ok(())
    }
}
