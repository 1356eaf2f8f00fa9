//! Credential holder consulted when building the logon message.
//!
//! Obtaining or refreshing tokens is up to the application; the gateway only
//! reads the current values and asks for a refresh once when the server
//! rejects them.

use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use steamcm_core::{CmResult, SteamId};

/// Process-wide account credentials.
pub trait Credentials: Send + Sync {
    fn username(&self) -> String;

    fn steam_id(&self) -> SteamId;

    fn access_token(&self) -> String;

    /// Replace the credentials after the server rejected them.
    fn refresh(&self) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>>;
}

/// Fixed credentials. `refresh` re-reads nothing and succeeds, so the single
/// retry after a rejection uses the same token against another server.
pub struct StaticCredentials {
    username: String,
    steam_id: SteamId,
    access_token: RwLock<String>,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, steam_id: SteamId, access_token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            steam_id,
            access_token: RwLock::new(access_token.into()),
        }
    }

    /// Swap in a new token, e.g. from a refresh performed elsewhere.
    pub fn set_access_token(&self, token: impl Into<String>) {
        if let Ok(mut t) = self.access_token.write() {
            *t = token.into();
        }
    }
}

impl Credentials for StaticCredentials {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn steam_id(&self) -> SteamId {
        self.steam_id
    }

    fn access_token(&self) -> String {
        self.access_token
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn refresh(&self) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swapped_token_is_read_by_next_logon() {
        let creds = StaticCredentials::new("alice", SteamId::individual(22202), "old");
        assert_eq!(creds.access_token(), "old");
        creds.set_access_token("new");
        creds.refresh().await.unwrap();
        assert_eq!(creds.access_token(), "new");
        assert_eq!(creds.username(), "alice");
        assert_eq!(creds.steam_id().account_id(), 22202);
    }
}
