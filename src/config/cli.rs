use super::StaticProxy;
use crate::pki::keys::KeyAlgorithm;
use clap::Parser;
use clio::ClioPath;
use std::time::Duration;

/// Service mesh control plane: issues and rotates workload certificates and pushes versioned
/// configuration bundles to proxies
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// PEM bundle holding the CA certificate and its PKCS#8 private key. Loaded if it exists,
    /// otherwise a new CA is generated and written here
    #[clap(long, value_parser = clap::value_parser!(ClioPath))]
    pub(crate) ca_bundle: Option<ClioPath>,

    /// Common name of a newly generated CA
    #[clap(long, default_value = super::DEFAULT_CA_COMMON_NAME)]
    pub(crate) ca_common_name: String,

    /// Organization set on the CA and on every issued certificate
    #[clap(long, default_value = super::DEFAULT_CA_ORGANIZATION)]
    pub(crate) ca_organization: String,

    /// Validity of a newly generated CA, e.g. 87600h
    #[clap(long, value_parser = humantime::parse_duration, default_value = "87600h")]
    pub(crate) ca_validity: Duration,

    /// Validity of issued workload certificates
    #[clap(long, value_parser = humantime::parse_duration, default_value = "24h")]
    pub(crate) validity_period: Duration,

    /// Fraction of the validity period after which a certificate is renewed
    #[clap(long, default_value_t = super::DEFAULT_ROTATION_THRESHOLD)]
    pub(crate) rotation_threshold: f64,

    /// Key algorithm for the CA and workload certificates
    #[clap(long, value_enum, default_value_t = KeyAlgorithm::EcdsaP256)]
    pub(crate) key_algorithm: KeyAlgorithm,

    /// Number of keys to pre-generate at startup
    #[clap(long, default_value_t = super::DEFAULT_KEY_POOL_SIZE)]
    pub(crate) key_pool_size: usize,

    /// Attempts per issuance before a signing failure is reported
    #[clap(long, default_value_t = super::DEFAULT_ISSUANCE_MAX_ATTEMPTS)]
    pub(crate) issuance_max_attempts: u32,

    /// Delay before the first issuance retry, doubled on every further retry
    #[clap(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    pub(crate) issuance_initial_backoff: Duration,

    /// How often to check whether the agent endpoint is ready
    #[clap(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub(crate) readiness_interval: Duration,

    /// How long to wait for the agent endpoint before running degraded
    #[clap(long, value_parser = humantime::parse_duration, default_value = "60s")]
    pub(crate) readiness_timeout: Duration,

    /// Delivery workers. 0 means one per available CPU
    #[clap(long, default_value_t = 0)]
    pub(crate) worker_pool_size: usize,

    /// Delivery jobs that can wait for a worker before enqueueing blocks
    #[clap(long, default_value_t = super::DEFAULT_WORKER_QUEUE_SIZE)]
    pub(crate) worker_queue_size: usize,

    /// Events buffered per subscriber before the oldest are dropped
    #[clap(long, default_value_t = super::DEFAULT_SUBSCRIBER_BUFFER)]
    pub(crate) subscriber_buffer: usize,

    /// Timeout for a single push to a single proxy
    #[clap(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub(crate) push_timeout: Duration,

    /// Tokio worker threads. Defaults to the number of logical CPUs
    #[clap(long)]
    pub(crate) threads: Option<usize>,

    /// Statically known proxy, as proxy-id:identity. Can specify multiple
    #[clap(long = "proxy", value_parser = StaticProxy::parse)]
    pub(crate) proxies: Vec<StaticProxy>,

    /// YAML file with the base configuration every proxy bundle is built from
    #[clap(long, value_parser = clap::value_parser!(ClioPath).exists().is_file())]
    pub(crate) bundle_file: Option<ClioPath>,

    /// Log level (error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    pub(crate) log_level: log::LevelFilter,

    /// Write a summary on shutdown
    #[clap(long, value_parser = clap::value_parser!(ClioPath))]
    pub(crate) summary_file: Option<ClioPath>,

    /// Write a summary on shutdown with private keys removed
    #[clap(long, value_parser = clap::value_parser!(ClioPath))]
    pub(crate) summary_file_clean: Option<ClioPath>,
}
