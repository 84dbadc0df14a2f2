// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use log::{debug, info, warn};
use secrecy::SecretString;
use ssh_key::LineEnding;
use tokio::{sync::Mutex, task};

use crate::{
    error::{self, Result},
    storage::{Area, IsPersistent, KeyStore},
};

use super::{
    decode, ConfiguredKey, ConfiguredKeyInfo, Id, Keyring, LoadedKey, SessionKey, COMMENT_PREFIX,
};

const CONFIGURED_PREFIX: &str = "key";
const SESSION_PREFIX: &str = "session";

/// Keeps configured keys, the agent's keyring and the session cache of
/// decrypted keys in step with each other.
///
/// Operations that change anything are serialized, so two requests for the
/// same key never interleave their storage and keyring updates.
pub(crate) struct Manager {
    keyring: Arc<Keyring>,
    configured: KeyStore<ConfiguredKey>,
    sessions: KeyStore<SessionKey>,
    lock: Mutex<()>,
}

fn comment_for(id: &Id) -> String {
    format!("{COMMENT_PREFIX}{id}")
}

impl Manager {
    pub(crate) fn new(keyring: Arc<Keyring>, persistent: Box<dyn Area>, session: Box<dyn Area>) -> Self {
        if session.is_persistent() {
            warn!("Decrypted keys will be kept in persistent storage");
        }

        Self {
            keyring,
            configured: KeyStore::new(CONFIGURED_PREFIX, persistent),
            sessions: KeyStore::new(SESSION_PREFIX, session),
            lock: Mutex::new(()),
        }
    }

    pub(crate) async fn configured(&self) -> Result<Vec<ConfiguredKeyInfo>> {
        Ok(self
            .configured
            .read_all()
            .await?
            .into_iter()
            .map(|key| ConfiguredKeyInfo {
                encrypted: decode::is_encrypted(&key.pem_private_key),
                id: key.id,
                name: key.name,
            })
            .collect())
    }

    /// Stores a new key under a freshly generated ID. The key material is
    /// not checked until it is loaded.
    pub(crate) async fn add(&self, name: &str, pem_private_key: &str) -> Result<Id> {
        if name.is_empty() {
            return Err(error::Key::InvalidName.into());
        }

        let _guard = self.lock.lock().await;
        let id = Id::generate();
        self.configured
            .add(&ConfiguredKey {
                id: id.clone(),
                name: name.to_owned(),
                pem_private_key: pem_private_key.to_owned(),
            })
            .await?;
        info!("Added key {:?} as {}", name, id);
        Ok(id)
    }

    /// Forgets a key and its cached decrypted form. Removing a key that does
    /// not exist succeeds. A key already in the agent stays there until it
    /// is unloaded.
    pub(crate) async fn remove(&self, id: &Id) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.configured.delete(|key| key.id == *id).await?;
        self.sessions.delete(|key| key.id == *id).await?;
        info!("Removed key {}", id);
        Ok(())
    }

    pub(crate) async fn loaded(&self) -> Result<Vec<LoadedKey>> {
        self.keyring.list().await
    }

    pub(crate) async fn load(&self, id: &Id, passphrase: SecretString) -> Result<()> {
        let _guard = self.lock.lock().await;

        let key = self
            .configured
            .read(|key| key.id == *id)
            .await?
            .ok_or_else(|| error::Key::NotFound(id.to_string()))?;

        // Key derivation for some formats is deliberately slow.
        let pem = key.pem_private_key;
        let private = task::spawn_blocking(move || decode::decrypt(&pem, &passphrase)).await??;
        let encoding = |e| error::Key::AgentLoadFailed(Box::new(error::Agent::Encoding(e).into()));
        let canonical = private.to_openssh(LineEnding::LF).map_err(encoding)?;
        let algorithm = private.algorithm();
        let blob = private.public_key().to_bytes().map_err(encoding)?;
        let was_loaded = self
            .keyring
            .list()
            .await?
            .iter()
            .any(|loaded| loaded.blob == blob);

        self.keyring
            .add(private, comment_for(id))
            .await
            .map_err(|e| error::Key::AgentLoadFailed(Box::new(e)))?;

        if let Err(e) = self.remember(id, canonical.as_str()).await {
            if was_loaded {
                warn!("Key {} stays loaded but will not be restored after a restart: {}", id, e);
            } else {
                warn!("Could not record key {} for this session, so it is being unloaded: {}", id, e);
                if let Err(e) = self.keyring.remove(algorithm.as_str(), &blob).await {
                    warn!("Key {} remains in the agent: {}", id, e);
                }
            }
            return Err(e);
        }
        info!("Loaded key {}", id);
        Ok(())
    }

    // Replaces the session entry for `id`.
    async fn remember(&self, id: &Id, decrypted_private_key: &str) -> Result<()> {
        self.sessions.delete(|key| key.id == *id).await?;
        self.sessions
            .add(&SessionKey {
                id: id.clone(),
                decrypted_private_key: decrypted_private_key.to_owned(),
            })
            .await
    }

    pub(crate) async fn unload(&self, id: &Id) -> Result<()> {
        let not_loaded =
            || error::Key::AgentUnloadFailed(Box::new(error::Agent::NotLoaded(id.to_string()).into()));
        if !id.is_valid() {
            return Err(not_loaded().into());
        }

        let _guard = self.lock.lock().await;
        let loaded = self
            .keyring
            .list()
            .await?
            .into_iter()
            .find(|key| key.id() == *id)
            .ok_or_else(not_loaded)?;

        self.keyring
            .remove(&loaded.type_, &loaded.blob)
            .await
            .map_err(|e| error::Key::AgentUnloadFailed(Box::new(e)))?;

        self.sessions
            .delete(|key| key.id == *id)
            .await
            .map_err(|e| error::Key::StorageUnloadFailed(Box::new(e)))?;
        info!("Unloaded key {}", id);
        Ok(())
    }

    /// Puts every key cached for this session back into the agent. Entries
    /// that cannot be restored are skipped.
    pub(crate) async fn load_from_session(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let empty = SecretString::new(String::new());

        for session in self.sessions.read_all().await? {
            let restored = match decode::decrypt(&session.decrypted_private_key, &empty) {
                Ok(private) => self.keyring.add(private, comment_for(&session.id)).await,
                Err(e) => Err(e),
            };

            match restored {
                Ok(()) => debug!("Restored key {} from session", session.id),
                Err(e) => warn!("Skipping session key {}: {}", session.id, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        keys::fixtures::FIXTURES,
        storage::{Items, Memory},
    };

    struct Harness {
        manager: Manager,
        keyring: Arc<Keyring>,
        persistent: Memory,
        session: Memory,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_session(Memory::new())
        }

        fn with_session(session: Memory) -> Self {
            let keyring = Arc::new(Keyring::new());
            let persistent = Memory::new();
            Self {
                manager: Manager::new(
                    Arc::clone(&keyring),
                    Box::new(persistent.clone()),
                    Box::new(session.clone()),
                ),
                keyring,
                persistent,
                session,
            }
        }

        /// Another manager over the same stores, as after a restart.
        fn restarted(&self) -> Self {
            let keyring = Arc::new(Keyring::new());
            Self {
                manager: Manager::new(
                    Arc::clone(&keyring),
                    Box::new(self.persistent.clone()),
                    Box::new(self.session.clone()),
                ),
                keyring,
                persistent: self.persistent.clone(),
                session: self.session.clone(),
            }
        }

        async fn session_ids(&self) -> Result<Vec<Id>> {
            let mut ids: Vec<Id> = self
                .manager
                .sessions
                .read_all()
                .await?
                .into_iter()
                .map(|key| key.id)
                .collect();
            ids.sort();
            Ok(ids)
        }

        async fn loaded_ids(&self) -> Result<Vec<Id>> {
            let mut ids: Vec<Id> = self
                .manager
                .loaded()
                .await?
                .iter()
                .map(LoadedKey::id)
                .collect();
            ids.sort();
            Ok(ids)
        }
    }

    fn passphrase(text: &str) -> SecretString {
        SecretString::new(text.to_owned())
    }

    #[tokio::test]
    async fn add_lists_with_encryption_flag() -> Result<()> {
        let harness = Harness::new();
        for fixture in FIXTURES {
            let id = harness.manager.add(fixture.name, fixture.pem).await?;
            let configured = harness.manager.configured().await?;
            let info = configured.iter().find(|info| info.id == id);
            assert_eq!(
                info,
                Some(&ConfiguredKeyInfo {
                    id: id.clone(),
                    name: fixture.name.to_owned(),
                    encrypted: fixture.encrypted,
                }),
            );
        }
        assert_eq!(harness.manager.configured().await?.len(), FIXTURES.len());
        Ok(())
    }

    #[tokio::test]
    async fn add_requires_name() -> Result<()> {
        let harness = Harness::new();
        assert!(matches!(
            harness.manager.add("", FIXTURES[0].pem).await,
            Err(error::Error::Key(error::Key::InvalidName))
        ));
        assert!(harness.manager.configured().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_names_get_distinct_ids() -> Result<()> {
        let harness = Harness::new();
        let first = harness.manager.add("same", FIXTURES[0].pem).await?;
        let second = harness.manager.add("same", FIXTURES[0].pem).await?;
        assert_ne!(first, second);

        let mut ids: Vec<Id> = harness
            .manager
            .configured()
            .await?
            .into_iter()
            .map(|info| info.id)
            .collect();
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);
        Ok(())
    }

    #[tokio::test]
    async fn remove_forgets_key() -> Result<()> {
        let harness = Harness::new();
        let kept = harness.manager.add("kept", FIXTURES[0].pem).await?;
        let removed = harness.manager.add("removed", FIXTURES[2].pem).await?;

        harness.manager.remove(&removed).await?;
        harness.manager.remove(&Id::generate()).await?;
        harness.manager.remove(&removed).await?;

        let configured = harness.manager.configured().await?;
        assert_eq!(configured.len(), 1);
        assert_eq!(configured[0].id, kept);
        Ok(())
    }

    #[tokio::test]
    async fn load_and_unload_every_format() -> Result<()> {
        for fixture in FIXTURES {
            let harness = Harness::new();
            let id = harness.manager.add(fixture.name, fixture.pem).await?;

            harness.manager.load(&id, fixture.passphrase()).await?;
            let loaded = harness.manager.loaded().await?;
            assert_eq!(loaded.len(), 1, "{}", fixture.name);
            assert_eq!(loaded[0].id(), id, "{}", fixture.name);
            assert_eq!(base64::encode(&loaded[0].blob), fixture.blob(), "{}", fixture.name);
            assert_eq!(harness.session_ids().await?, vec![id.clone()]);

            harness.manager.unload(&id).await?;
            assert!(harness.manager.loaded().await?.is_empty(), "{}", fixture.name);
            assert!(harness.session_ids().await?.is_empty(), "{}", fixture.name);
            assert_eq!(harness.manager.configured().await?.len(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn load_twice_keeps_one_copy() -> Result<()> {
        let harness = Harness::new();
        let id = harness.manager.add("twice", FIXTURES[2].pem).await?;
        harness.manager.load(&id, passphrase("")).await?;
        harness.manager.load(&id, passphrase("")).await?;

        assert_eq!(harness.loaded_ids().await?, vec![id.clone()]);
        assert_eq!(harness.session_ids().await?, vec![id]);
        Ok(())
    }

    #[tokio::test]
    async fn incorrect_passphrase_changes_nothing() -> Result<()> {
        let harness = Harness::new();
        let loaded = harness.manager.add("loaded", FIXTURES[0].pem).await?;
        harness.manager.load(&loaded, passphrase("")).await?;

        for fixture in FIXTURES.iter().filter(|fixture| fixture.encrypted) {
            let id = harness.manager.add(fixture.name, fixture.pem).await?;
            let err = harness.manager.load(&id, passphrase("wrong")).await.err();
            assert!(
                err.as_ref().map_or(false, error::Error::is_incorrect_passphrase),
                "{}: {:?}",
                fixture.name,
                err
            );
        }

        assert_eq!(harness.loaded_ids().await?, vec![loaded.clone()]);
        assert_eq!(harness.session_ids().await?, vec![loaded]);
        Ok(())
    }

    #[tokio::test]
    async fn load_failures() -> Result<()> {
        let harness = Harness::new();
        assert!(matches!(
            harness.manager.load(&Id::generate(), passphrase("")).await,
            Err(error::Error::Key(error::Key::NotFound(_)))
        ));

        let bogus = harness.manager.add("bogus", "bogus-key-data").await?;
        assert!(matches!(
            harness.manager.load(&bogus, passphrase("")).await,
            Err(error::Error::Key(error::Key::DecodeFailed(_)))
        ));
        assert!(harness.manager.loaded().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unload_requires_loaded_key() -> Result<()> {
        let harness = Harness::new();
        let id = harness.manager.add("configured", FIXTURES[0].pem).await?;

        for candidate in [Id::generate(), Id::INVALID, id] {
            assert!(matches!(
                harness.manager.unload(&candidate).await,
                Err(error::Error::Key(error::Key::AgentUnloadFailed(_)))
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn external_keys_are_unidentifiable() -> Result<()> {
        let harness = Harness::new();
        let external = decode::decrypt(FIXTURES[6].pem, &passphrase(""))?;
        harness.keyring.add(external, "user@host".to_owned()).await?;

        assert_eq!(harness.loaded_ids().await?, vec![Id::INVALID]);
        assert!(harness.manager.unload(&Id::INVALID).await.is_err());
        assert_eq!(harness.manager.loaded().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn remove_purges_session_but_not_agent() -> Result<()> {
        let harness = Harness::new();
        let id = harness.manager.add("doomed", FIXTURES[4].pem).await?;
        harness.manager.load(&id, passphrase("")).await?;

        harness.manager.remove(&id).await?;
        assert!(harness.manager.configured().await?.is_empty());
        assert!(harness.session_ids().await?.is_empty());
        assert_eq!(harness.loaded_ids().await?, vec![id]);
        Ok(())
    }

    #[tokio::test]
    async fn session_restores_after_restart() -> Result<()> {
        let harness = Harness::new();
        let first = harness.manager.add("first", FIXTURES[1].pem).await?;
        let second = harness.manager.add("second", FIXTURES[5].pem).await?;
        let idle = harness.manager.add("idle", FIXTURES[2].pem).await?;
        harness.manager.load(&first, FIXTURES[1].passphrase()).await?;
        harness.manager.load(&second, FIXTURES[5].passphrase()).await?;

        harness
            .session
            .set(Items::from([
                ("session.corrupt".to_owned(), json!({"id": "broken", "decryptedPrivateKey": "nonsense"})),
                ("session.unreadable".to_owned(), json!(42_i32)),
            ]))
            .await?;

        let restarted = harness.restarted();
        assert!(restarted.manager.loaded().await?.is_empty());
        restarted.manager.load_from_session().await?;

        let mut expected = vec![first.clone(), second];
        expected.sort();
        assert_eq!(restarted.loaded_ids().await?, expected);
        assert!(!restarted.loaded_ids().await?.contains(&idle));

        restarted.manager.unload(&first).await?;
        assert_eq!(restarted.manager.loaded().await?.len(), 1);
        assert!(!restarted.session_ids().await?.contains(&first));
        Ok(())
    }

    struct Unwritable(Memory);

    impl IsPersistent for Unwritable {
        fn is_persistent(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl Area for Unwritable {
        async fn set(&self, items: Items) -> Result<()> {
            self.0.set(items).await
        }

        async fn get(&self) -> Result<Items> {
            self.0.get().await
        }

        async fn delete(&self, _keys: &[String]) -> Result<()> {
            Err(error::Error::Io(std::io::ErrorKind::PermissionDenied.into()))
        }
    }

    struct ReadOnly(Memory);

    impl IsPersistent for ReadOnly {
        fn is_persistent(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl Area for ReadOnly {
        async fn set(&self, _items: Items) -> Result<()> {
            Err(error::Error::Io(std::io::ErrorKind::PermissionDenied.into()))
        }

        async fn get(&self) -> Result<Items> {
            self.0.get().await
        }

        async fn delete(&self, keys: &[String]) -> Result<()> {
            self.0.delete(keys).await
        }
    }

    #[tokio::test]
    async fn load_unloads_key_when_session_write_fails() -> Result<()> {
        let keyring = Arc::new(Keyring::new());
        let manager = Manager::new(
            Arc::clone(&keyring),
            Box::new(Memory::new()),
            Box::new(ReadOnly(Memory::new())),
        );

        let id = manager.add("key", FIXTURES[6].pem).await?;
        assert!(matches!(
            manager.load(&id, passphrase("")).await,
            Err(error::Error::Io(_))
        ));
        assert!(keyring.list().await?.is_empty());
        assert!(manager.loaded().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unload_reports_session_failure() -> Result<()> {
        let keyring = Arc::new(Keyring::new());
        let session = Memory::new();
        let manager = Manager::new(
            Arc::clone(&keyring),
            Box::new(Memory::new()),
            Box::new(Unwritable(session.clone())),
        );

        let id = manager.add("key", FIXTURES[6].pem).await?;
        // The first load has no earlier session entry to delete.
        manager.load(&id, passphrase("")).await?;
        assert!(matches!(
            manager.unload(&id).await,
            Err(error::Error::Key(error::Key::StorageUnloadFailed(_)))
        ));
        assert!(manager.loaded().await?.is_empty());
        Ok(())
    }
}
