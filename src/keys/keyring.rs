// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use log::debug;
use signature::Signer;
use ssh_key::{public::KeyData, PrivateKey, PublicKey, Signature};
use tokio::sync::RwLock;

use crate::error::{self, Result};

use super::LoadedKey;

struct Entry {
    key: PrivateKey,
    comment: String,
}

/// The keys the agent offers to clients.
pub(crate) struct Keyring {
    entries: RwLock<Vec<Entry>>,
}

impl Keyring {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Adds `key`, replacing any entry for the same public key.
    pub(crate) async fn add(&self, key: PrivateKey, comment: String) -> Result<()> {
        if key.is_encrypted() {
            return Err(error::Agent::Encoding(ssh_key::Error::Encrypted).into());
        }

        let mut entries = self.entries.write().await;
        entries.retain(|entry| entry.key.public_key().key_data() != key.public_key().key_data());
        debug!("Adding {} key {:?}", key.algorithm(), comment);
        entries.push(Entry { key, comment });
        Ok(())
    }

    /// Removes the key with the given algorithm and public key blob.
    pub(crate) async fn remove(&self, algorithm: &str, blob: &[u8]) -> Result<()> {
        let public = PublicKey::from_bytes(blob).map_err(error::Agent::Encoding)?;

        let mut entries = self.entries.write().await;
        let pos = entries
            .iter()
            .position(|entry| {
                entry.key.algorithm().as_str() == algorithm
                    && entry.key.public_key().key_data() == public.key_data()
            })
            .ok_or(error::Agent::KeyNotFound)?;
        let entry = entries.remove(pos);
        debug!("Removed {} key {:?}", algorithm, entry.comment);
        Ok(())
    }

    pub(crate) async fn list(&self) -> Result<Vec<LoadedKey>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|entry| {
                Ok(LoadedKey {
                    type_: entry.key.algorithm().as_str().to_owned(),
                    blob: entry
                        .key
                        .public_key()
                        .to_bytes()
                        .map_err(error::Agent::Encoding)?,
                    comment: entry.comment.clone(),
                })
            })
            .collect()
    }

    pub(crate) async fn identities(&self) -> Vec<(KeyData, String)> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|entry| (entry.key.public_key().key_data().clone(), entry.comment.clone()))
            .collect()
    }

    pub(crate) async fn sign(&self, key: &KeyData, data: &[u8]) -> Result<Signature> {
        let entries = self.entries.read().await;
        let entry = entries
            .iter()
            .find(|entry| entry.key.public_key().key_data() == key)
            .ok_or(error::Agent::KeyNotFound)?;

        debug!("Signing {} bytes with key {:?}", data.len(), entry.comment);
        Ok(entry.key.try_sign(data).map_err(error::Agent::Signature)?)
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring").finish_non_exhaustive()
    }
}
