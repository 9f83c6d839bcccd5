//! Single source of truth for the session credential
//!
//! Holds the current credential in a `watch` channel so the request pipeline
//! and the realtime channel both observe rotations and clears without
//! polling. Reads are synchronous and lock-free for callers; writes are
//! serialized by an async mutex so the in-memory value and the credential
//! file never disagree about which write happened last.

use std::path::PathBuf;

use common::Secret;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::credentials::{Credential, CredentialFile};
use crate::error::Result;

pub struct TokenStore {
    tx: watch::Sender<Option<Credential>>,
    file: Option<CredentialFile>,
    write_lock: Mutex<()>,
}

impl TokenStore {
    /// Store with no backing file, starting logged out.
    pub fn in_memory() -> Self {
        Self::with_initial(None, None)
    }

    /// Store seeded with a credential and no backing file.
    pub fn with_credential(credential: Credential) -> Self {
        Self::with_initial(Some(credential), None)
    }

    /// File-backed store. A missing file starts logged out.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let file = CredentialFile::new(path);
        let initial = file.read().await?;
        Ok(Self::with_initial(initial, Some(file)))
    }

    fn with_initial(initial: Option<Credential>, file: Option<CredentialFile>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            file,
            write_lock: Mutex::new(()),
        }
    }

    /// Current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    /// Current access token, if a non-empty one is stored.
    pub fn access_token(&self) -> Option<Secret<String>> {
        self.tx
            .borrow()
            .as_ref()
            .filter(|c| c.has_access_token())
            .map(|c| c.access_token.clone())
    }

    /// Whether a refresh token is available.
    pub fn can_refresh(&self) -> bool {
        self.tx
            .borrow()
            .as_ref()
            .is_some_and(Credential::has_refresh_token)
    }

    /// Replace the credential, notify observers, then persist.
    ///
    /// Observers see the new credential even when persisting fails; the
    /// error only reports that it will not survive a restart.
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.tx.send_replace(Some(credential.clone()));
        debug!(expires_at = ?credential.expires_at, "credential updated");
        match &self.file {
            Some(file) => file.write(&credential).await,
            None => Ok(()),
        }
    }

    /// Wipe the credential in memory and on disk, and notify observers.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let had_credential = self.tx.send_replace(None).is_some();
        if had_credential {
            info!("credential cleared");
        }
        match &self.file {
            Some(file) => file.remove().await,
            None => Ok(()),
        }
    }

    /// Watch handle over the current credential.
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(n: u32) -> Credential {
        Credential::new(format!("at_{n}"), format!("rt_{n}"), None)
    }

    #[tokio::test]
    async fn in_memory_starts_empty() {
        let store = TokenStore::in_memory();
        assert!(store.get().is_none());
        assert!(store.access_token().is_none());
        assert!(!store.can_refresh());
    }

    #[tokio::test]
    async fn set_notifies_subscribers() {
        let store = TokenStore::in_memory();
        let mut rx = store.subscribe();

        store.set(credential(1)).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().as_ref().unwrap().access_token.as_str(),
            "at_1"
        );
        assert_eq!(store.access_token().unwrap().as_str(), "at_1");
    }

    #[tokio::test]
    async fn clear_notifies_subscribers() {
        let store = TokenStore::with_credential(credential(1));
        let mut rx = store.subscribe();

        store.clear().await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn empty_access_token_is_not_attached() {
        let store = TokenStore::with_credential(Credential::from_refresh_token("rt_seed"));
        assert!(store.access_token().is_none());
        assert!(store.can_refresh());
    }

    #[tokio::test]
    async fn file_backed_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = TokenStore::load(&path).await.unwrap();
        assert!(store.get().is_none());
        store.set(credential(7)).await.unwrap();

        let reloaded = TokenStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().unwrap().refresh_token.as_str(), "rt_7");
    }

    #[tokio::test]
    async fn clear_removes_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = TokenStore::load(&path).await.unwrap();
        store.set(credential(1)).await.unwrap();
        assert!(path.exists());

        store.clear().await.unwrap();
        assert!(!path.exists());
        assert!(TokenStore::load(&path).await.unwrap().get().is_none());
    }

    #[tokio::test]
    async fn concurrent_sets_leave_file_matching_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = std::sync::Arc::new(TokenStore::load(&path).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set(credential(i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let in_memory = store.get().unwrap();
        let on_disk = CredentialFile::new(&path).read().await.unwrap().unwrap();
        assert_eq!(in_memory, on_disk);
    }
}
