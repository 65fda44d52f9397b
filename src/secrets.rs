//! Signing secret lookup
//!
//! A secret is a named key/value map held by some external store. The
//! dispatcher reads one key (the signing key) from it. Lookup failures are
//! logged where they happen and degrade to an empty secret, which never
//! verifies.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, Result};
use crate::{SecretBackend, SecretsConfig};

pub type SecretMap = HashMap<String, String>;

#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Resolves a named secret to its key/value map.
    async fn get_secret(&self, name: &str) -> Result<SecretMap>;

    /// Drops any locally held copy of `name`. Returns true if one was held.
    async fn invalidate(&self, _name: &str) -> bool {
        false
    }
}

/// Parses a secret string holding a flat JSON object.
pub fn parse_secret_string(name: &str, raw: &str) -> Result<SecretMap> {
    serde_json::from_str(raw).map_err(|e| {
        DispatchError::SecretUnavailable(format!(
            "secret '{}' is not a JSON object of strings: {}",
            name, e
        ))
    })
}

/// Reads secrets from environment variables.
///
/// The variable name is the secret name upper-cased with every character
/// outside `[A-Z0-9]` replaced by `_` (`webhook/github` -> `WEBHOOK_GITHUB`).
#[derive(Debug, Default, Clone)]
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn env_key(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretMap> {
        let key = Self::env_key(name);
        let raw = std::env::var(&key).map_err(|_| {
            DispatchError::SecretUnavailable(format!(
                "environment variable '{}' for secret '{}' is not set",
                key, name
            ))
        })?;
        parse_secret_string(name, &raw)
    }
}

/// Reads secrets from `<directory>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    directory: PathBuf,
}

impl FileSecretProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn secret_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(DispatchError::SecretUnavailable(format!(
                "invalid secret name '{}'",
                name
            )));
        }
        Ok(self.directory.join(format!("{}.json", name)))
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretMap> {
        let path = self.secret_path(name)?;
        debug!("Reading secret '{}' from {:?}", name, path);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            DispatchError::SecretUnavailable(format!(
                "failed to read secret '{}' from {:?}: {}",
                name, path, e
            ))
        })?;
        parse_secret_string(name, &raw)
    }
}

/// In-memory secrets, for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, SecretMap>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, key: &str, value: &str) -> Self {
        self.secrets
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretMap> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::SecretUnavailable(format!("no secret named '{}'", name)))
    }
}

/// Caches successful lookups of the wrapped provider until invalidated.
pub struct CachedSecretProvider<P> {
    inner: P,
    cache: RwLock<HashMap<String, SecretMap>>,
}

impl<P: SecretProvider> CachedSecretProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<P: SecretProvider> SecretProvider for CachedSecretProvider<P> {
    async fn get_secret(&self, name: &str) -> Result<SecretMap> {
        if let Some(hit) = self.cache.read().await.get(name) {
            return Ok(hit.clone());
        }

        let secret = self.inner.get_secret(name).await?;
        if !secret.is_empty() {
            self.cache
                .write()
                .await
                .insert(name.to_string(), secret.clone());
        }
        Ok(secret)
    }

    async fn invalidate(&self, name: &str) -> bool {
        let evicted = self.cache.write().await.remove(name).is_some();
        if evicted {
            debug!("Evicted cached secret '{}'", name);
        }
        evicted
    }
}

/// Builds the configured secret store.
pub fn build_secret_provider(config: &SecretsConfig) -> Result<Arc<dyn SecretProvider>> {
    let provider: Arc<dyn SecretProvider> = match (config.backend, config.cache) {
        (SecretBackend::Env, false) => Arc::new(EnvSecretProvider::new()),
        (SecretBackend::Env, true) => Arc::new(CachedSecretProvider::new(EnvSecretProvider::new())),
        (SecretBackend::File, cache) => {
            let directory = config.directory.clone().ok_or_else(|| {
                DispatchError::ConfigError(
                    "secrets backend 'file' requires 'secrets.directory'".to_string(),
                )
            })?;
            if cache {
                Arc::new(CachedSecretProvider::new(FileSecretProvider::new(directory)))
            } else {
                Arc::new(FileSecretProvider::new(directory))
            }
        }
    };
    Ok(provider)
}

/// Reads `secret_key` from the secret `secret_name`.
///
/// Never fails: an unset name, an unreachable store, a missing secret or a
/// missing key are logged and yield an empty string.
pub async fn fetch_secret_value(
    provider: &dyn SecretProvider,
    secret_name: &str,
    secret_key: &str,
) -> String {
    if secret_name.is_empty() {
        error!("Secret name is not configured");
        return String::new();
    }

    let secrets = match provider.get_secret(secret_name).await {
        Ok(secrets) => secrets,
        Err(e) => {
            error!("Failed to fetch secret '{}': {}", secret_name, e);
            return String::new();
        }
    };

    match secrets.get(secret_key) {
        Some(value) => value.clone(),
        None => {
            warn!("Secret '{}' has no key '{}'", secret_name, secret_key);
            String::new()
        }
    }
}
