use crate::{
    config::ControlPlaneConfig,
    distribution::{stats::DeliveryStats, ServerState},
    pki::{
        certificate::{Certificate, Identity},
        manager::CertificateState,
    },
    registry::ProxyRecord,
    workerpool::PoolStats,
};
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use log::{LevelFilter, Metadata, Record};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, Mutex,
};

struct MeshctrlLogger;

static LOGGER: MeshctrlLogger = MeshctrlLogger;

/// When set, private keys serialize as a placeholder. Only flipped while writing the clean summary.
pub(crate) static REDACT_SECRETS: AtomicBool = AtomicBool::new(false);

pub(crate) fn init(level: LevelFilter) -> Result<()> {
    match log::set_logger(&LOGGER) {
        Ok(_) => log::set_max_level(level),
        Err(_) => bail!("Logger initalization failed"),
    };

    Ok(())
}

lazy_static! {
    pub(crate) static ref LOG_RECORDS: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
}

fn format_record(record: &Record) -> String {
    format!(
        "{} - {} - {}:{}: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.args()
    )
}

impl log::Log for MeshctrlLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_string = format_record(record);

            {
                let mut log_records = match LOG_RECORDS.lock() {
                    Ok(log_records) => log_records,
                    Err(err) => {
                        println!("Failed to lock log records: {}", err);
                        return;
                    }
                };
                log_records.push(log_string.clone());
            }

            println!("{}", log_string);
        }
    }

    fn flush(&self) {}
}

#[derive(Serialize)]
pub(crate) struct CaSummary {
    pub(crate) common_name: String,
    pub(crate) fingerprint: String,
    pub(crate) not_after: chrono::DateTime<chrono::Utc>,
    pub(crate) issued: u64,
}

#[derive(Serialize)]
pub(crate) struct CertificateSummary {
    pub(crate) identity: Identity,
    pub(crate) state: CertificateState,
    pub(crate) certificate: Arc<Certificate>,
}

/// Everything the control plane knows about itself at shutdown
#[derive(Serialize)]
pub(crate) struct Summary<'a> {
    pub(crate) config: &'a ControlPlaneConfig,
    pub(crate) ca: CaSummary,
    pub(crate) certificates: Vec<CertificateSummary>,
    pub(crate) server_state: ServerState,
    pub(crate) proxies: Vec<ProxyRecord>,
    pub(crate) deliveries: &'a DeliveryStats,
    pub(crate) jobs: &'a PoolStats,
    pub(crate) dropped_events: u64,
    pub(crate) uptime: String,
}

#[derive(Serialize)]
struct SummaryWithLogs<'a> {
    #[serde(flatten)]
    summary: &'a Summary<'a>,
    logs: Vec<String>,
}

pub(crate) fn generate_summary(summary: Summary) -> Result<()> {
    let logs = match LOG_RECORDS.lock() {
        Ok(logs) => logs.clone(),
        Err(err) => {
            vec![format!("Failed to lock log records: {}", err)]
        }
    };

    let summary = SummaryWithLogs { summary: &summary, logs };

    if let Some(summary_file) = summary.summary.config.summary_file.clone() {
        let summary_file = summary_file.0.create().context("opening summary file for writing")?;
        serde_yaml::to_writer(summary_file, &summary).context("serializing summary into summary file")?;
    }

    if let Some(summary_file_clean) = summary.summary.config.summary_file_clean.clone() {
        let summary_file_clean = summary_file_clean.0.create().context("opening clean summary file for writing")?;

        REDACT_SECRETS.store(true, Relaxed);
        let result = serde_yaml::to_writer(summary_file_clean, &summary).context("serializing summary into clean summary file");
        REDACT_SECRETS.store(false, Relaxed);
        result?;
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::path::ConfigPath,
        pki::authority::{tests::test_ca, CertificateIssuer},
    };
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn record_format() {
        let record = Record::builder()
            .args(format_args!("issued certificate for bookstore"))
            .level(log::Level::Warn)
            .file(Some("src/pki/manager.rs"))
            .line(Some(42))
            .build();

        let formatted = format_record(&record);
        assert!(formatted.ends_with(" - WARN - src/pki/manager.rs:42: issued certificate for bookstore"));
    }

    #[test]
    #[serial]
    fn clean_summary_redacts_private_keys() {
        let dir = tempfile::tempdir().unwrap();
        let summary_file = dir.path().join("summary.yaml");
        let summary_file_clean = dir.path().join("summary-clean.yaml");

        let mut config = ControlPlaneConfig::parse_from_config_file(b"").unwrap();
        config.summary_file = Some(ConfigPath::new(summary_file.to_str().unwrap()).unwrap());
        config.summary_file_clean = Some(ConfigPath::new(summary_file_clean.to_str().unwrap()).unwrap());

        let ca = test_ca(Duration::from_secs(3600));
        let identity = Identity::from("bookstore");
        let certificate = Arc::new(ca.issue(&identity, Duration::from_secs(60)).unwrap());

        let deliveries = DeliveryStats::default();
        let jobs = PoolStats::default();

        generate_summary(Summary {
            config: &config,
            ca: CaSummary {
                common_name: ca.common_name().to_string(),
                fingerprint: ca.fingerprint().to_string(),
                not_after: ca.not_after(),
                issued: ca.issued_count(),
            },
            certificates: vec![CertificateSummary {
                identity: identity.clone(),
                state: CertificateState::Valid,
                certificate: Arc::clone(&certificate),
            }],
            server_state: ServerState::Ready,
            proxies: vec![],
            deliveries: &deliveries,
            jobs: &jobs,
            dropped_events: 0,
            uptime: "1s".to_string(),
        })
        .unwrap();

        let full = std::fs::read_to_string(&summary_file).unwrap();
        let clean = std::fs::read_to_string(&summary_file_clean).unwrap();

        assert!(full.contains("PRIVATE KEY"));
        assert!(!clean.contains("PRIVATE KEY"));
        assert!(clean.contains("bookstore"));
        assert!(clean.contains("logs:"));
        assert!(!REDACT_SECRETS.load(Relaxed));
    }
}
