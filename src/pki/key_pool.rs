use super::keys::{generate_key_pair, KeyAlgorithm};
use anyhow::{Context, Result};
use futures_util::future::join_all;
use rcgen::KeyPair;
use std::sync::{Mutex, PoisonError};

/// Pre-generated key pairs, handed out at most once each. Key generation (RSA in particular) is
/// slow, so we generate a batch in parallel at startup instead of on the issuance path.
pub(crate) struct KeyPool {
    algorithm: KeyAlgorithm,
    keys: Mutex<Vec<KeyPair>>,
}

impl KeyPool {
    pub(crate) async fn fill(algorithm: KeyAlgorithm, num_keys: usize) -> Result<Self> {
        Ok(Self {
            algorithm,
            keys: Mutex::new(
                join_all(
                    (0..num_keys)
                        .map(|_| tokio::task::spawn_blocking(move || generate_key_pair(algorithm)))
                        .collect::<Vec<_>>(),
                )
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .context("joining key generation tasks")?
                .into_iter()
                .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    pub(crate) fn empty(algorithm: KeyAlgorithm) -> Self {
        Self {
            algorithm,
            keys: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub(crate) fn remaining(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn get(&self) -> Result<KeyPair> {
        if let Some(key) = self.keys.lock().unwrap_or_else(PoisonError::into_inner).pop() {
            return Ok(key);
        }

        log::debug!("Key pool miss for {}, generating synchronously", self.algorithm);

        generate_key_pair(self.algorithm)
    }
}
