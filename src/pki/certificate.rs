use super::keys::{PrivateKey, PublicKey};
use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt::Display, time::Duration};
use x509_certificate::{rfc5280, CapturedX509Certificate, X509Certificate};

/// The name a workload certificate is bound to, used as the certificate common name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub(crate) struct Identity(String);

impl Identity {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        ensure!(!value.is_empty(), "identity must not be empty");
        ensure!(!value.contains(char::is_whitespace), "identity must not contain whitespace: {:?}", value);
        Ok(Self(value.to_string()))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub(crate) struct SerialNumber(pub(crate) u64);

impl SerialNumber {
    /// Random, positive and non-zero so it encodes as a valid DER serial
    pub(crate) fn random() -> Self {
        Self(rand::random::<u64>() % (i64::MAX as u64) + 1)
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A leaf certificate issued by our CA together with its private key
#[derive(Clone, Debug, Serialize)]
pub(crate) struct Certificate {
    pub(crate) identity: Identity,
    pub(crate) serial_number: SerialNumber,
    pub(crate) public_key: PublicKey,
    pub(crate) private_key: PrivateKey,
    /// SHA-256 fingerprint of the CA certificate that signed this one
    pub(crate) issuing_ca: String,
    pub(crate) not_before: DateTime<Utc>,
    pub(crate) not_after: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub(crate) signature: bytes::Bytes,
    #[serde(serialize_with = "serialize_as_pem")]
    pub(crate) original: CapturedX509Certificate,
}

fn serialize_as_pem<S: serde::Serializer>(certificate: &CapturedX509Certificate, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&certificate.encode_pem())
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.serial_number == other.serial_number && self.issuing_ca == other.issuing_ca
    }
}

impl Eq for Certificate {}

impl Certificate {
    pub(crate) fn from_der(
        identity: Identity,
        serial_number: SerialNumber,
        der: Vec<u8>,
        private_key: PrivateKey,
        issuing_ca: String,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self> {
        let original = CapturedX509Certificate::from_der(der).context("parsing issued certificate")?;
        let cert: &X509Certificate = &original;
        let certificate: &rfc5280::Certificate = cert.as_ref();

        ensure!(
            original.subject_common_name().as_deref() == Some(identity.as_str()),
            "issued certificate common name does not match identity {}",
            identity
        );

        Ok(Self {
            public_key: PublicKey::from_der_bytes(certificate.tbs_certificate.subject_public_key_info.subject_public_key.octet_bytes()),
            signature: certificate.signature.octet_bytes(),
            identity,
            serial_number,
            private_key,
            issuing_ca,
            not_before,
            not_after,
            original,
        })
    }

    pub(crate) fn pem(&self) -> String {
        self.original.encode_pem()
    }

    pub(crate) fn validity_period(&self) -> Duration {
        (self.not_after - self.not_before).to_std().unwrap_or_default()
    }

    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// The instant at which `threshold` (a fraction in (0, 1)) of the validity period has elapsed
    pub(crate) fn renew_at(&self, threshold: f64) -> DateTime<Utc> {
        let elapsed = (self.not_after - self.not_before).num_milliseconds() as f64 * threshold;
        self.not_before + chrono::Duration::milliseconds(elapsed as i64)
    }
}

impl Display for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cert {} serial {} valid {} - {}",
            self.identity,
            self.serial_number,
            self.not_before.format("%Y-%m-%d %H:%M:%S"),
            self.not_after.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}
