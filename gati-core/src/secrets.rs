//! Secrets access.
//!
//! The runtime consults a [`SecretStore`] through the global context; the
//! default resolves from process environment variables. Backends that hit
//! a vault are expected to be slow, hence the async signature.

use crate::error::GatiError;
use std::future::Future;
use std::pin::Pin;

type SecretFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<String>, GatiError>> + Send + 'a>>;

/// Pluggable secret backend. Failures propagate to the caller.
pub trait SecretStore: Send + Sync + 'static {
    fn get<'a>(&'a self, name: &'a str) -> SecretFuture<'a>;
}

/// Resolves secrets from process environment variables.
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
        Box::pin(async move {
            match std::env::var(name) {
                Ok(value) => Ok(Some(value)),
                Err(std::env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(GatiError::Internal(format!("secret '{name}': {err}"))),
            }
        })
    }
}

/// Fixed map of secrets, for tests.
pub struct StaticSecretStore {
    entries: std::collections::HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        StaticSecretStore {
            entries: entries.into_iter().collect(),
        }
    }
}

impl SecretStore for StaticSecretStore {
    fn get<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
        Box::pin(async move { Ok(self.entries.get(name).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_store_returns_known_entries() {
        let store = StaticSecretStore::new([("db.password".to_string(), "hunter2".to_string())]);
        assert_eq!(store.get("db.password").await.unwrap().as_deref(), Some("hunter2"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn env_store_reads_process_environment() {
        std::env::set_var("GATI_TEST_SECRET", "value");
        let store = EnvSecretStore;
        assert_eq!(
            store.get("GATI_TEST_SECRET").await.unwrap().as_deref(),
            Some("value")
        );
        assert_eq!(store.get("GATI_TEST_SECRET_ABSENT").await.unwrap(), None);
    }
}
