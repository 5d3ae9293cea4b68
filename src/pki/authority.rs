use super::{
    certificate::{Certificate, Identity, SerialNumber},
    key_pool::KeyPool,
    keys::{generate_key_pair, PrivateKey},
};
use crate::error::PkiError;
use anyhow::{ensure, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use fn_error_context::context;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};
use x509_certificate::{asn1time::Time, rfc5280, CapturedX509Certificate, X509Certificate};

/// Anything that can sign leaf certificates for an identity. The certificate manager only talks to
/// the CA through this trait.
pub(crate) trait CertificateIssuer: Send + Sync {
    fn issue(&self, identity: &Identity, validity_period: Duration) -> Result<Certificate, PkiError>;

    fn root_certificate_pem(&self) -> &str;
}

/// The mesh root CA. Holds the root key pair and signs leaf certificates for workload identities.
/// Stateless per call apart from an issuance counter, so it is safe to share between tasks.
pub(crate) struct CertificateAuthority {
    organization: String,
    common_name: String,
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    key_pem: String,
    fingerprint: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    key_pool: Arc<KeyPool>,
    issued: AtomicU64,
}

impl CertificateAuthority {
    pub(crate) fn new(common_name: &str, organization: &str, validity_period: Duration, key_pool: Arc<KeyPool>) -> Result<Self> {
        let key_pair = generate_key_pair(key_pool.algorithm()).context("generating CA key")?;

        let not_before = Utc::now().trunc_subsecs(0);
        let not_after = (not_before + chrono::Duration::from_std(validity_period).context("CA validity period out of range")?).trunc_subsecs(0);

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(rcgen::SerialNumber::from(SerialNumber::random().0));
        params.not_before = to_offset_date_time(not_before)?;
        params.not_after = to_offset_date_time(not_after)?;

        let cert = params.self_signed(&key_pair).context("self-signing CA certificate")?;

        Ok(Self {
            organization: organization.to_string(),
            common_name: common_name.to_string(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            fingerprint: fingerprint(cert.der().as_ref()),
            issuer: Issuer::new(params, key_pair),
            not_before,
            not_after,
            key_pool,
            issued: AtomicU64::new(0),
        })
    }

    /// Load CA material previously produced by [`CertificateAuthority::export_ca`] (or any PEM
    /// bundle holding one CA certificate and its PKCS#8 private key).
    pub(crate) fn load_ca(bytes: &[u8], organization: &str, key_pool: Arc<KeyPool>) -> Result<Self, PkiError> {
        let (cert_pem, key_pem) = parse_ca_bundle(bytes).map_err(|error| PkiError::InvalidCaMaterial(format!("{:#}", error)))?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|error| PkiError::InvalidCaMaterial(format!("CA private key: {}", error)))?;

        let captured = CapturedX509Certificate::from_pem(&cert_pem)
            .map_err(|error| PkiError::InvalidCaMaterial(format!("CA certificate: {}", error)))?;
        let cert: &X509Certificate = &captured;
        let certificate: &rfc5280::Certificate = cert.as_ref();

        if certificate.tbs_certificate.subject_public_key_info.subject_public_key.octet_bytes().as_ref() != key_pair.public_key_raw() {
            return Err(PkiError::InvalidCaMaterial(
                "CA private key does not match the CA certificate".to_string(),
            ));
        }

        let validity = &certificate.tbs_certificate.validity;
        let (not_before, not_after) = (to_date_time(&validity.not_before), to_date_time(&validity.not_after));
        if Utc::now() >= not_after {
            return Err(PkiError::InvalidCaMaterial(format!("CA certificate expired at {}", not_after)));
        }

        let common_name = captured.subject_common_name().unwrap_or_default();
        let fingerprint = fingerprint(captured.constructed_data());
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|error| PkiError::InvalidCaMaterial(format!("CA issuer metadata: {}", error)))?;

        Ok(Self {
            organization: organization.to_string(),
            common_name,
            issuer,
            cert_pem,
            key_pem,
            fingerprint,
            not_before,
            not_after,
            key_pool,
            issued: AtomicU64::new(0),
        })
    }

    /// Serialize the CA certificate and private key as a PEM bundle for an external secret store
    pub(crate) fn export_ca(&self) -> Vec<u8> {
        format!("{}{}", self.cert_pem, self.key_pem).into_bytes()
    }

    pub(crate) fn common_name(&self) -> &str {
        &self.common_name
    }

    pub(crate) fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub(crate) fn issued_count(&self) -> u64 {
        self.issued.load(Relaxed)
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn issue(&self, identity: &Identity, validity_period: Duration) -> Result<Certificate, PkiError> {
        let not_before = Utc::now().trunc_subsecs(0);
        // Truncated like the DER encoding is
        let requested_not_after = (not_before
            + chrono::Duration::from_std(validity_period)
                .map_err(|error| PkiError::SigningFailure(format!("validity period out of range: {}", error)))?)
        .trunc_subsecs(0);

        // The CA must outlive everything it signs
        if requested_not_after > self.not_after {
            return Err(PkiError::CaValidityExceeded {
                identity: identity.clone(),
                requested_not_after,
                ca_not_after: self.not_after,
            });
        }

        let key_pair = self
            .key_pool
            .get()
            .map_err(|error| PkiError::SigningFailure(format!("generating key: {:#}", error)))?;
        let serial_number = SerialNumber::random();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(identity.as_str(), &self.organization);
        if let Ok(dns_name) = Ia5String::try_from(identity.as_str()) {
            params.subject_alt_names = vec![SanType::DnsName(dns_name)];
        }
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(rcgen::SerialNumber::from(serial_number.0));
        params.not_before = to_offset_date_time(not_before).map_err(|error| PkiError::SigningFailure(format!("{:#}", error)))?;
        params.not_after = to_offset_date_time(requested_not_after).map_err(|error| PkiError::SigningFailure(format!("{:#}", error)))?;

        let cert = params.signed_by(&key_pair, &self.issuer)?;

        self.issued.fetch_add(1, Relaxed);

        Certificate::from_der(
            identity.clone(),
            serial_number,
            cert.der().to_vec(),
            PrivateKey::from_key_pair(&key_pair),
            self.fingerprint.clone(),
            not_before,
            requested_not_after,
        )
        .map_err(|error| PkiError::SigningFailure(format!("{:#}", error)))
    }

    fn root_certificate_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl std::fmt::Display for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CA {} ({}) valid {} - {}",
            self.common_name,
            self.fingerprint,
            self.not_before.format("%Y-%m-%d %H:%M:%S"),
            self.not_after.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    distinguished_name.push(DnType::OrganizationName, organization);
    distinguished_name
}

fn to_offset_date_time(date_time: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(date_time.timestamp()).context("converting timestamp")
}

fn to_date_time(time: &Time) -> DateTime<Utc> {
    match time {
        Time::UtcTime(utc_time) => **utc_time,
        Time::GeneralTime(generalized_time) => generalized_time.clone().into(),
    }
}

fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

#[context("parsing CA PEM bundle")]
fn parse_ca_bundle(bytes: &[u8]) -> Result<(String, String)> {
    let pems = pem::parse_many(bytes).context("invalid PEM")?;

    let certs = pems.iter().filter(|pem| pem.tag() == "CERTIFICATE").collect::<Vec<_>>();
    ensure!(certs.len() == 1, "expected exactly one CERTIFICATE block, found {}", certs.len());

    let key = pems
        .iter()
        .find(|pem| pem.tag() == "PRIVATE KEY")
        .context("no PKCS#8 PRIVATE KEY block")?;

    Ok((pem::encode(certs[0]), pem::encode(key)))
}
