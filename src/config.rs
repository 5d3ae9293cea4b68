use self::{cli::Cli, path::ConfigPath};
use crate::{
    pki::{certificate::Identity, keys::KeyAlgorithm},
    registry::ProxyId,
};
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;
use std::{env, str::FromStr, time::Duration};

mod cli;
pub(crate) mod path;

pub(crate) const DEFAULT_CA_COMMON_NAME: &str = "meshctrl-root-ca";
pub(crate) const DEFAULT_CA_ORGANIZATION: &str = "meshctrl";
pub(crate) const DEFAULT_ROTATION_THRESHOLD: f64 = 0.8;
pub(crate) const DEFAULT_KEY_POOL_SIZE: usize = 16;
pub(crate) const DEFAULT_ISSUANCE_MAX_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_WORKER_QUEUE_SIZE: usize = 1024;
pub(crate) const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

const CONFIG_ENV_VAR: &str = "MESHCTRL_CONFIG";

/// A proxy registered at startup instead of through the transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub(crate) struct StaticProxy {
    pub(crate) proxy_id: ProxyId,
    pub(crate) identity: Identity,
}

impl StaticProxy {
    /// proxy-id:identity
    pub(crate) fn parse(value: &str) -> Result<Self> {
        let (proxy_id, identity) = value.split_once(':').context("expected proxy-id:identity")?;
        let proxy_id = proxy_id.trim();
        ensure!(!proxy_id.is_empty(), "empty proxy id in {:?}", value);

        Ok(Self {
            proxy_id: ProxyId::from(proxy_id),
            identity: Identity::parse(identity)?,
        })
    }
}

fn serialize_duration<S: serde::Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn serialize_level<S: serde::Serializer>(level: &log::LevelFilter, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(level.as_str())
}

/// Everything the control plane can be configured with, from either the CLI or a YAML file
#[derive(Debug, Serialize)]
pub(crate) struct ControlPlaneConfig {
    pub(crate) ca_bundle: Option<ConfigPath>,
    pub(crate) ca_common_name: String,
    pub(crate) ca_organization: String,
    #[serde(serialize_with = "serialize_duration")]
    pub(crate) ca_validity: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub(crate) validity_period: Duration,
    pub(crate) rotation_threshold: f64,
    pub(crate) key_algorithm: KeyAlgorithm,
    pub(crate) key_pool_size: usize,
    pub(crate) issuance_max_attempts: u32,
    #[serde(serialize_with = "serialize_duration")]
    pub(crate) issuance_initial_backoff: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub(crate) readiness_interval: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub(crate) readiness_timeout: Duration,
    pub(crate) worker_pool_size: usize,
    pub(crate) worker_queue_size: usize,
    pub(crate) subscriber_buffer: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub(crate) push_timeout: Duration,
    pub(crate) threads: Option<usize>,
    pub(crate) proxies: Vec<StaticProxy>,
    pub(crate) bundle_file: Option<ConfigPath>,
    #[serde(serialize_with = "serialize_level")]
    pub(crate) log_level: log::LevelFilter,
    pub(crate) summary_file: Option<ConfigPath>,
    pub(crate) summary_file_clean: Option<ConfigPath>,

    pub(crate) config_file_raw: Option<String>,
    pub(crate) cli_raw: Option<String>,
}

fn parse_duration_value(value: Value, key: &str) -> Result<Duration> {
    let value = value.as_str().context(format!("{} must be a duration string such as 5s", key))?;
    humantime::parse_duration(value).context(format!("{} {:?} is not a valid duration", key, value))
}

fn parse_usize_value(value: Value, key: &str) -> Result<usize> {
    usize::try_from(value.as_u64().context(format!("{} must be a non-negative integer", key))?).context(format!("{} is too large", key))
}

fn parse_string_value(value: Value, key: &str) -> Result<String> {
    Ok(value.as_str().context(format!("{} must be a string", key))?.to_string())
}

fn parse_path_value(value: Value, key: &str) -> Result<ConfigPath> {
    ConfigPath::new(value.as_str().context(format!("{} must be a string", key))?).context(key.to_string())
}

impl ControlPlaneConfig {
    pub(crate) fn parse_from_config_file(config_bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_yaml::from_slice(config_bytes)?;

        let mut value = match value {
            // An empty file means all defaults
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            _ => bail!("config file must be a YAML object"),
        };

        let ca_bundle = match value.remove("ca_bundle") {
            Some(value) => Some(parse_path_value(value, "ca_bundle")?),
            None => None,
        };

        let ca_common_name = match value.remove("ca_common_name") {
            Some(value) => parse_string_value(value, "ca_common_name")?,
            None => DEFAULT_CA_COMMON_NAME.to_string(),
        };

        let ca_organization = match value.remove("ca_organization") {
            Some(value) => parse_string_value(value, "ca_organization")?,
            None => DEFAULT_CA_ORGANIZATION.to_string(),
        };

        let ca_validity = match value.remove("ca_validity") {
            Some(value) => parse_duration_value(value, "ca_validity")?,
            None => Duration::from_secs(87600 * 3600),
        };

        let validity_period = match value.remove("validity_period") {
            Some(value) => parse_duration_value(value, "validity_period")?,
            None => Duration::from_secs(24 * 3600),
        };

        let rotation_threshold = match value.remove("rotation_threshold") {
            Some(value) => value.as_f64().context("rotation_threshold must be a number")?,
            None => DEFAULT_ROTATION_THRESHOLD,
        };

        let key_algorithm = match value.remove("key_algorithm") {
            Some(value) => {
                let name = value.as_str().context("key_algorithm must be a string")?;
                KeyAlgorithm::from_str(name).context(format!("unknown key_algorithm {:?}", name))?
            }
            None => KeyAlgorithm::EcdsaP256,
        };

        let key_pool_size = match value.remove("key_pool_size") {
            Some(value) => parse_usize_value(value, "key_pool_size")?,
            None => DEFAULT_KEY_POOL_SIZE,
        };

        let issuance_max_attempts = match value.remove("issuance_max_attempts") {
            Some(value) => u32::try_from(parse_usize_value(value, "issuance_max_attempts")?).context("issuance_max_attempts is too large")?,
            None => DEFAULT_ISSUANCE_MAX_ATTEMPTS,
        };

        let issuance_initial_backoff = match value.remove("issuance_initial_backoff") {
            Some(value) => parse_duration_value(value, "issuance_initial_backoff")?,
            None => Duration::from_millis(100),
        };

        let readiness_interval = match value.remove("readiness_interval") {
            Some(value) => parse_duration_value(value, "readiness_interval")?,
            None => Duration::from_secs(5),
        };

        let readiness_timeout = match value.remove("readiness_timeout") {
            Some(value) => parse_duration_value(value, "readiness_timeout")?,
            None => Duration::from_secs(60),
        };

        let worker_pool_size = match value.remove("worker_pool_size") {
            Some(value) => parse_usize_value(value, "worker_pool_size")?,
            None => 0,
        };

        let worker_queue_size = match value.remove("worker_queue_size") {
            Some(value) => parse_usize_value(value, "worker_queue_size")?,
            None => DEFAULT_WORKER_QUEUE_SIZE,
        };

        let subscriber_buffer = match value.remove("subscriber_buffer") {
            Some(value) => parse_usize_value(value, "subscriber_buffer")?,
            None => DEFAULT_SUBSCRIBER_BUFFER,
        };

        let push_timeout = match value.remove("push_timeout") {
            Some(value) => parse_duration_value(value, "push_timeout")?,
            None => Duration::from_secs(10),
        };

        let threads = match value.remove("threads") {
            Some(value) => Some(parse_usize_value(value, "threads")?),
            None => None,
        };

        let proxies = match value.remove("proxies") {
            Some(value) => value
                .as_array()
                .context("proxies must be an array")?
                .iter()
                .map(|value| {
                    let value = value.as_str().context("proxies must be an array of strings")?;
                    StaticProxy::parse(value).context(format!("proxy {}", value))
                })
                .collect::<Result<Vec<_>>>()?,
            None => vec![],
        };

        let bundle_file = match value.remove("bundle_file") {
            Some(value) => {
                let path = parse_path_value(value, "bundle_file")?;
                ensure!(path.is_file(), "bundle_file must be an existing file: {}", path);
                Some(path)
            }
            None => None,
        };

        let log_level = match value.remove("log_level") {
            Some(value) => {
                let level = value.as_str().context("log_level must be a string")?;
                log::LevelFilter::from_str(level).context(format!("unknown log_level {:?}", level))?
            }
            None => log::LevelFilter::Info,
        };

        let summary_file = match value.remove("summary_file") {
            Some(value) => Some(parse_path_value(value, "summary_file")?),
            None => None,
        };

        let summary_file_clean = match value.remove("summary_file_clean") {
            Some(value) => Some(parse_path_value(value, "summary_file_clean")?),
            None => None,
        };

        ensure!(
            value.is_empty(),
            "unknown keys {:?} in config file",
            value.keys().join(", ")
        );

        let config = Self {
            ca_bundle,
            ca_common_name,
            ca_organization,
            ca_validity,
            validity_period,
            rotation_threshold,
            key_algorithm,
            key_pool_size,
            issuance_max_attempts,
            issuance_initial_backoff,
            readiness_interval,
            readiness_timeout,
            worker_pool_size,
            worker_queue_size,
            subscriber_buffer,
            push_timeout,
            threads,
            proxies,
            bundle_file,
            log_level,
            summary_file,
            summary_file_clean,

            cli_raw: None,
            config_file_raw: Some(String::from_utf8_lossy(config_bytes).to_string()),
        };

        config.validate()?;

        Ok(config)
    }

    pub(crate) fn parse_from_cli(cli: Cli) -> Result<Self> {
        let config = Self {
            ca_bundle: cli.ca_bundle.map(ConfigPath::from),
            ca_common_name: cli.ca_common_name,
            ca_organization: cli.ca_organization,
            ca_validity: cli.ca_validity,
            validity_period: cli.validity_period,
            rotation_threshold: cli.rotation_threshold,
            key_algorithm: cli.key_algorithm,
            key_pool_size: cli.key_pool_size,
            issuance_max_attempts: cli.issuance_max_attempts,
            issuance_initial_backoff: cli.issuance_initial_backoff,
            readiness_interval: cli.readiness_interval,
            readiness_timeout: cli.readiness_timeout,
            worker_pool_size: cli.worker_pool_size,
            worker_queue_size: cli.worker_queue_size,
            subscriber_buffer: cli.subscriber_buffer,
            push_timeout: cli.push_timeout,
            threads: cli.threads,
            proxies: cli.proxies,
            bundle_file: cli.bundle_file.map(ConfigPath::from),
            log_level: cli.log_level,
            summary_file: cli.summary_file.map(ConfigPath::from),
            summary_file_clean: cli.summary_file_clean.map(ConfigPath::from),

            config_file_raw: None,
            cli_raw: Some(serde_json::to_string(&env::args().collect::<Vec<String>>())?),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.rotation_threshold > 0.0 && self.rotation_threshold < 1.0,
            "rotation_threshold must be between 0 and 1 (exclusive), got {}",
            self.rotation_threshold
        );
        ensure!(!self.validity_period.is_zero(), "validity_period must be positive");
        ensure!(
            self.validity_period <= self.ca_validity,
            "validity_period {} must not exceed ca_validity {}",
            humantime::format_duration(self.validity_period),
            humantime::format_duration(self.ca_validity)
        );
        // Certificates carry whole-second timestamps
        for (key, duration) in [("ca_validity", self.ca_validity), ("validity_period", self.validity_period)] {
            ensure!(
                duration.subsec_nanos() == 0,
                "{} {} must be a whole number of seconds",
                key,
                humantime::format_duration(duration)
            );
        }
        ensure!(self.issuance_max_attempts > 0, "issuance_max_attempts must be at least 1");
        ensure!(!self.readiness_interval.is_zero(), "readiness_interval must be positive");
        ensure!(!self.push_timeout.is_zero(), "push_timeout must be positive");
        ensure!(self.worker_queue_size > 0, "worker_queue_size must be positive");
        ensure!(self.subscriber_buffer > 0, "subscriber_buffer must be positive");
        ensure!(
            self.proxies.iter().map(|proxy| &proxy.proxy_id).all_unique(),
            "duplicate proxy ids in proxies"
        );

        Ok(())
    }

    pub(crate) fn new() -> Result<Self> {
        Ok(match env::var(CONFIG_ENV_VAR) {
            Ok(var) => {
                let num_args = env::args().len();

                ensure!(
                    num_args == 1,
                    "{CONFIG_ENV_VAR} is set, but there are {num_args} CLI arguments. {CONFIG_ENV_VAR} is meant to be used with no arguments."
                );

                Self::parse_from_config_file(&std::fs::read(&var).context(format!("reading {} file {}", CONFIG_ENV_VAR, var))?)
                    .context(format!("parsing {} file {}", CONFIG_ENV_VAR, var))?
            }
            Err(_) => Self::parse_from_cli(Cli::parse()).context("CLI parsing")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ControlPlaneConfig::parse_from_config_file(b"").unwrap();

        assert_eq!(config.ca_common_name, "meshctrl-root-ca");
        assert_eq!(config.validity_period, Duration::from_secs(24 * 3600));
        assert_eq!(config.rotation_threshold, 0.8);
        assert_eq!(config.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(config.readiness_interval, Duration::from_secs(5));
        assert_eq!(config.readiness_timeout, Duration::from_secs(60));
        assert_eq!(config.worker_pool_size, 0);
        assert_eq!(config.worker_queue_size, 1024);
        assert_eq!(config.push_timeout, Duration::from_secs(10));
        assert_eq!(config.log_level, log::LevelFilter::Info);
        assert!(config.proxies.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let mut bundle_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(bundle_file, "mode: strict").unwrap();

        let yaml = format!(
            r#"
ca_bundle: /tmp/meshctrl-ca.pem
validity_period: 1h
rotation_threshold: 0.5
key_algorithm: rsa-2048
readiness_interval: 2s
readiness_timeout: 20s
worker_pool_size: 4
worker_queue_size: 2
subscriber_buffer: 8
push_timeout: 500ms
threads: 2
proxies:
  - p1:bookstore
  - p2:bookbuyer
bundle_file: {}
log_level: debug
summary_file: /tmp/meshctrl-summary.yaml
"#,
            bundle_file.path().display()
        );

        let config = ControlPlaneConfig::parse_from_config_file(yaml.as_bytes()).unwrap();

        assert_eq!(config.validity_period, Duration::from_secs(3600));
        assert_eq!(config.rotation_threshold, 0.5);
        assert_eq!(config.key_algorithm, KeyAlgorithm::Rsa2048);
        assert_eq!(config.push_timeout, Duration::from_millis(500));
        assert_eq!(config.threads, Some(2));
        assert_eq!(
            config.proxies,
            vec![
                StaticProxy {
                    proxy_id: ProxyId::from("p1"),
                    identity: Identity::from("bookstore"),
                },
                StaticProxy {
                    proxy_id: ProxyId::from("p2"),
                    identity: Identity::from("bookbuyer"),
                },
            ]
        );
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert!(config.bundle_file.is_some());
        assert!(config.config_file_raw.is_some());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = ControlPlaneConfig::parse_from_config_file(b"etcd_endpoint: localhost:2379\n").unwrap_err();
        assert!(format!("{:#}", err).contains("etcd_endpoint"));
    }

    #[test]
    fn rejects_invalid_values() {
        for yaml in [
            "rotation_threshold: 1.0",
            "rotation_threshold: 0",
            "validity_period: 100000h",
            "validity_period: soon",
            "validity_period: 1500ms",
            "ca_validity: 87600h 1ms",
            "readiness_interval: 0s",
            "worker_queue_size: 0",
            "key_algorithm: dsa",
            "proxies: [\"no-identity\"]",
            "proxies: [\"p1:a\", \"p1:b\"]",
        ] {
            assert!(
                ControlPlaneConfig::parse_from_config_file(yaml.as_bytes()).is_err(),
                "{} should be rejected",
                yaml
            );
        }
    }

    #[test]
    fn static_proxy_parse() {
        assert_eq!(
            StaticProxy::parse("p1:bookstore").unwrap(),
            StaticProxy {
                proxy_id: ProxyId::from("p1"),
                identity: Identity::from("bookstore"),
            }
        );
        assert!(StaticProxy::parse(":bookstore").is_err());
        assert!(StaticProxy::parse("p1:").is_err());
        assert!(StaticProxy::parse("p1").is_err());
    }

    #[test]
    fn serializes_durations_readably() {
        let config = ControlPlaneConfig::parse_from_config_file(b"validity_period: 90m").unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("validity_period: 1h 30m"));
        assert!(yaml.contains("log_level: INFO"));
    }
}
