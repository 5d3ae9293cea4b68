use crate::logging::REDACT_SECRETS;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as base64_standard, Engine as _};
use bytes::Bytes;
use rcgen::KeyPair;
use rsa::{
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};
use serde::Serialize;
use std::{fmt::Formatter, sync::atomic::Ordering::Relaxed};
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, clap::ValueEnum)]
pub(crate) enum KeyAlgorithm {
    #[value(name = "ecdsa-p256")]
    #[strum(serialize = "ecdsa-p256")]
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    #[value(name = "ecdsa-p384")]
    #[strum(serialize = "ecdsa-p384")]
    #[serde(rename = "ecdsa-p384")]
    EcdsaP384,
    #[value(name = "rsa-2048")]
    #[strum(serialize = "rsa-2048")]
    #[serde(rename = "rsa-2048")]
    Rsa2048,
    #[value(name = "rsa-4096")]
    #[strum(serialize = "rsa-4096")]
    #[serde(rename = "rsa-4096")]
    Rsa4096,
}

impl KeyAlgorithm {
    fn rsa_bits(&self) -> Option<usize> {
        match self {
            KeyAlgorithm::Rsa2048 => Some(2048),
            KeyAlgorithm::Rsa4096 => Some(4096),
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => None,
        }
    }
}

/// Generate a brand new key pair. ECDSA keys come straight from rcgen, RSA keys are generated with
/// the rsa crate (rcgen's ring backend cannot generate them) and then loaded into rcgen.
pub(crate) fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    Ok(match algorithm.rsa_bits() {
        Some(bits) => {
            let rsa_private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits).context("generating rsa key")?;
            let pkcs8_pem = rsa_private_key.to_pkcs8_pem(LineEnding::LF).context("rsa key to pkcs8")?;
            KeyPair::from_pem(&pkcs8_pem).context("rsa pair from pem")?
        }
        None => KeyPair::generate_for(match algorithm {
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            _ => &rcgen::PKCS_ECDSA_P256_SHA256,
        })
        .context("generating ecdsa key")?,
    })
}

#[derive(Clone, PartialEq, Eq)]
pub(crate) struct PrivateKey(String);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<private_key>")
    }
}

impl PrivateKey {
    pub(crate) fn from_key_pair(key_pair: &KeyPair) -> Self {
        Self(key_pair.serialize_pem())
    }

    pub(crate) fn pem(&self) -> &str {
        &self.0
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if REDACT_SECRETS.load(Relaxed) {
            serializer.serialize_str("<redacted>")
        } else {
            serializer.serialize_str(self.pem())
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct PublicKey(Bytes);

impl PublicKey {
    pub(crate) fn from_der_bytes(der_bytes: Bytes) -> Self {
        Self(der_bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<pub: {}>", base64_standard.encode(self.0.as_ref()))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64_standard.encode(self.0.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn algorithm_names_round_trip() {
        for algorithm in KeyAlgorithm::iter() {
            assert_eq!(KeyAlgorithm::from_str(&algorithm.to_string()).unwrap(), algorithm);
        }
        assert_eq!(KeyAlgorithm::from_str("rsa-2048").unwrap(), KeyAlgorithm::Rsa2048);
    }

    #[test]
    fn ecdsa_keys_are_fresh_every_call() {
        let first = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        let second = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        assert_ne!(first.serialize_der(), second.serialize_der());
    }

    #[test]
    fn rsa_keys_load_into_rcgen() {
        let key_pair = generate_key_pair(KeyAlgorithm::Rsa2048).unwrap();
        assert!(PrivateKey::from_key_pair(&key_pair).pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn private_key_debug_is_redacted() {
        let key_pair = generate_key_pair(KeyAlgorithm::EcdsaP256).unwrap();
        assert_eq!(format!("{:?}", PrivateKey::from_key_pair(&key_pair)), "<private_key>");
    }
}
