//! The durable credential slot and the transient return-URL slot

use std::{error, fmt, sync::Arc};

use url::Url;

use crate::storage::KeyValueStorage;
use crate::Credential;

/// Storage key holding the serialized [`Credential`]
pub const CREDENTIAL_KEY: &str = "tether.credential";

/// Storage key holding the URL to return to after a navigation-based login
pub const RETURN_URL_KEY: &str = "tether.return_url";

/// Persists the current credential in storage shared by every browsing context
///
/// Storage failures are never surfaced: an unreadable store behaves as an
/// empty one and writes to it are dropped.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn KeyValueStorage>,
}

impl CredentialStore {
    /// Constructs a new credential store over `storage`
    pub fn new(storage: impl KeyValueStorage + 'static) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    /// The underlying storage
    pub fn storage(&self) -> &Arc<dyn KeyValueStorage> {
        &self.storage
    }

    /// Reads the stored credential, if there is a readable one
    pub async fn read(&self) -> Option<Credential> {
        let data = match self.storage.get(CREDENTIAL_KEY).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::trace!("no credential in storage");
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to read credential from storage, treating as empty"
                );
                return None;
            }
        };

        match serde_json::from_str(&data) {
            Ok(credential) => Some(credential),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "stored credential is unreadable, treating as empty"
                );
                None
            }
        }
    }

    /// Overwrites the stored credential
    pub async fn write(&self, credential: &Credential) {
        let data = match serde_json::to_string(credential) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to serialize credential"
                );
                return;
            }
        };

        match self.storage.set(CREDENTIAL_KEY, &data).await {
            Ok(()) => tracing::trace!(expiry = credential.expiry().0, "stored credential"),
            Err(error) => tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to write credential to storage"
            ),
        }
    }

    /// Removes the stored credential
    pub async fn clear(&self) {
        if let Err(error) = self.storage.remove(CREDENTIAL_KEY).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to clear credential from storage"
            );
        }
    }

    /// Remembers where to send the user once a navigation-based login completes
    pub async fn remember_return_url(&self, url: &Url) {
        if let Err(error) = self.storage.set(RETURN_URL_KEY, url.as_str()).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to remember return URL"
            );
        }
    }

    /// Takes the remembered return URL, clearing it
    pub async fn take_return_url(&self) -> Option<Url> {
        let raw = match self.storage.get(RETURN_URL_KEY).await {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to read return URL"
                );
                return None;
            }
        };

        if let Err(error) = self.storage.remove(RETURN_URL_KEY).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to clear return URL"
            );
        }

        match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "remembered return URL is invalid"
                );
                None
            }
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("key", &CREDENTIAL_KEY)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DurationSecs, TestClock, UnixTime};
    use crate::storage::MemoryStorage;
    use crate::{AccessToken, CredentialLifetimeConfig};

    fn credential(token: &'static str) -> Credential {
        CredentialLifetimeConfig::default()
            .with_clock(TestClock::new(UnixTime(1_000)))
            .create_credential(AccessToken::from_static(token), Some(DurationSecs(3600)))
    }

    #[tokio::test]
    async fn empty_store_reads_nothing() {
        let store = CredentialStore::new(MemoryStorage::new());
        assert_eq!(store.read().await, None);
    }

    #[tokio::test]
    async fn later_writes_overwrite_earlier_ones() {
        let store = CredentialStore::new(MemoryStorage::new());

        store.write(&credential("first")).await;
        store.write(&credential("second")).await;

        let read = store.read().await.unwrap();
        assert_eq!(read.access_token().as_str(), "second");
    }

    #[tokio::test]
    async fn clear_removes_the_credential() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.write(&credential("tok")).await;

        store.clear().await;

        assert_eq!(store.read().await, None);
    }

    #[tokio::test]
    async fn stores_sharing_storage_see_each_others_writes() {
        let storage = MemoryStorage::new();
        let main_window = CredentialStore::new(storage.clone());
        let popup = CredentialStore::new(storage);

        popup.write(&credential("from-popup")).await;

        assert_eq!(
            main_window.read().await.unwrap().access_token().as_str(),
            "from-popup"
        );
    }

    mod when_storage_is_unavailable {
        use tracing_test::traced_test;

        use super::*;

        #[tokio::test]
        #[traced_test]
        async fn read_is_empty_and_write_is_a_no_op() {
            let storage = MemoryStorage::new();
            let store = CredentialStore::new(storage.clone());
            storage.set_unavailable(true);

            store.write(&credential("tok")).await;
            assert_eq!(store.read().await, None);

            storage.set_unavailable(false);
            assert_eq!(store.read().await, None);

            assert!(logs_contain("unable to write credential to storage"));
        }
    }

    #[tokio::test]
    async fn garbage_in_storage_reads_as_empty() {
        let storage = MemoryStorage::new();
        storage.set(CREDENTIAL_KEY, "not json").await.unwrap();

        let store = CredentialStore::new(storage);
        assert_eq!(store.read().await, None);
    }

    #[tokio::test]
    async fn return_url_is_consumed_once() {
        let store = CredentialStore::new(MemoryStorage::new());
        let url = Url::parse("https://app.example.com/dashboard?tab=2").unwrap();

        store.remember_return_url(&url).await;

        assert_eq!(store.take_return_url().await, Some(url));
        assert_eq!(store.take_return_url().await, None);
    }
}
