//! Secret store used to fetch ACME account material and cloud credentials,
//! and to persist issued certificate/key pairs.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret {namespace}/{name} not found")]
    NotFound { name: String, namespace: String },

    #[error("Secret {namespace}/{name} has no key '{key}'")]
    MissingKey {
        name: String,
        namespace: String,
        key: String,
    },

    #[error("Secret {namespace}/{name} key '{key}' is not valid UTF-8")]
    InvalidUtf8 {
        name: String,
        namespace: String,
        key: String,
    },

    #[error("Invalid secret path component '{0}'")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A named bag of binary values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn require(&self, key: &str) -> Result<&[u8], SecretError> {
        self.get(key).ok_or_else(|| SecretError::MissingKey {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            key: key.to_string(),
        })
    }

    pub fn require_str(&self, key: &str) -> Result<&str, SecretError> {
        std::str::from_utf8(self.require(key)?).map_err(|_| SecretError::InvalidUtf8 {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            key: key.to_string(),
        })
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync + Debug {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret, SecretError>;

    /// Create or replace a secret
    async fn put_secret(&self, secret: &Secret) -> Result<(), SecretError>;
}

/// Secrets laid out as `<root>/<namespace>/<name>/<key>`, the way mounted
/// Kubernetes secrets look on disk.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn secret_dir(&self, name: &str, namespace: &str) -> Result<PathBuf, SecretError> {
        check_component(namespace)?;
        check_component(name)?;
        Ok(self.root.join(namespace).join(name))
    }
}

fn check_component(component: &str) -> Result<(), SecretError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(SecretError::InvalidName(component.to_string()));
    }
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret, SecretError> {
        let dir = self.secret_dir(name, namespace)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut secret = Secret::new(name, namespace);
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            // Skip kubelet style hidden files
            if key.starts_with('.') {
                continue;
            }
            let value = tokio::fs::read(entry.path()).await?;
            secret.data.insert(key, value);
        }

        debug!(namespace, name, keys = secret.data.len(), "Loaded secret");
        Ok(secret)
    }

    async fn put_secret(&self, secret: &Secret) -> Result<(), SecretError> {
        let dir = self.secret_dir(&secret.name, &secret.namespace)?;
        tokio::fs::create_dir_all(&dir).await?;

        for (key, value) in &secret.data {
            check_component(key)?;
            let tmp = dir.join(format!(".{}.tmp", key));
            tokio::fs::write(&tmp, value).await?;
            tokio::fs::rename(&tmp, dir.join(key)).await?;
        }

        debug!(
            namespace = %secret.namespace,
            name = %secret.name,
            "Stored secret"
        );
        Ok(())
    }
}

/// In-memory secret store
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<(String, String), Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: Secret) {
        self.secrets
            .write()
            .insert((secret.namespace.clone(), secret.name.clone()), secret);
    }

    pub fn contains(&self, name: &str, namespace: &str) -> bool {
        self.secrets
            .read()
            .contains_key(&(namespace.to_string(), name.to_string()))
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret, SecretError> {
        self.secrets
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    async fn put_secret(&self, secret: &Secret) -> Result<(), SecretError> {
        self.insert(secret.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemorySecretStore::new();
        let err = store.get_secret("missing", "ns").await.unwrap_err();
        assert!(matches!(err, SecretError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        store
            .put_secret(&Secret::new("creds", "ns").with("token", "abc"))
            .await
            .unwrap();

        let secret = store.get_secret("creds", "ns").await.unwrap();
        assert_eq!(secret.require_str("token").unwrap(), "abc");
        assert!(matches!(
            secret.require("other"),
            Err(SecretError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_require_str_rejects_binary() {
        let secret = Secret::new("bin", "ns").with("blob", vec![0xff, 0xfe]);
        assert!(matches!(
            secret.require_str("blob"),
            Err(SecretError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn test_path_components_are_checked() {
        assert!(check_component("ok-name").is_ok());
        assert!(check_component("..").is_err());
        assert!(check_component("a/b").is_err());
        assert!(check_component("").is_err());
    }
}
