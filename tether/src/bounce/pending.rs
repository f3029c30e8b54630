use std::{error, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStorage, StorageError};
use crate::{CodeVerifier, StateRef};

const PENDING_PREFIX: &str = "tether.pending.";

/// What a bounce context was asked to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceMode {
    /// Obtain a token without showing any UI (`prompt=none`)
    Silent,
    /// Obtain a token, letting the provider interact with the user
    Login,
}

impl BounceMode {
    /// The value of the `mode` query parameter selecting this mode
    pub fn as_str(self) -> &'static str {
        match self {
            BounceMode::Silent => "silent",
            BounceMode::Login => "login",
        }
    }
}

impl fmt::Display for BounceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognized `mode` directive
#[derive(Debug, thiserror::Error)]
#[error("unrecognized bounce mode")]
pub struct UnknownMode;

impl FromStr for BounceMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silent" => Ok(BounceMode::Silent),
            "login" => Ok(BounceMode::Login),
            _ => Err(UnknownMode),
        }
    }
}

/// An authorization request awaiting its callback
///
/// Kept in storage because the bounce context navigates away to the provider
/// and back, losing everything held in memory.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PendingAuthorization {
    pub(super) verifier: CodeVerifier,
    pub(super) mode: BounceMode,
}

fn key_for(state: &StateRef) -> String {
    format!("{}{}", PENDING_PREFIX, state.as_str())
}

pub(super) async fn save(
    storage: &dyn KeyValueStorage,
    state: &StateRef,
    pending: &PendingAuthorization,
) -> Result<(), StorageError> {
    let data = serde_json::to_string(pending)
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    storage.set(&key_for(state), &data).await
}

/// Removes and returns the pending authorization for `state`
pub(super) async fn take(
    storage: &dyn KeyValueStorage,
    state: &StateRef,
) -> Option<PendingAuthorization> {
    let key = key_for(state);
    let data = match storage.get(&key).await {
        Ok(data) => data?,
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to read pending authorization"
            );
            return None;
        }
    };

    if let Err(error) = storage.remove(&key).await {
        tracing::warn!(
            error = (&error as &dyn error::Error),
            "unable to remove pending authorization"
        );
    }

    match serde_json::from_str(&data) {
        Ok(pending) => Some(pending),
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "pending authorization is unreadable"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::State;

    #[tokio::test]
    async fn pending_authorization_is_single_use() {
        let storage = MemoryStorage::new();
        let state = State::from_static("abc");

        save(
            &storage,
            &state,
            &PendingAuthorization {
                verifier: CodeVerifier::from_static("verifier"),
                mode: BounceMode::Silent,
            },
        )
        .await
        .unwrap();

        let pending = take(&storage, &state).await.unwrap();
        assert_eq!(pending.mode, BounceMode::Silent);
        assert_eq!(pending.verifier.as_str(), "verifier");

        assert!(take(&storage, &state).await.is_none());
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn modes_parse_from_directives() {
        assert_eq!("silent".parse::<BounceMode>().unwrap(), BounceMode::Silent);
        assert_eq!("login".parse::<BounceMode>().unwrap(), BounceMode::Login);
        assert!("popup".parse::<BounceMode>().is_err());
    }
}
