//! Key/value access to the cluster configuration store.
//!
//! Keys are slash separated paths in a flat keyspace, the way Xline and etcd
//! lay them out. A "directory" is any path segment that has keys below it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, DeleteOptions, GetOptions, PutOptions};
use tokio::sync::{Mutex, RwLock};

use crate::config::XlineConfig;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error("value of {key} is not valid utf-8")]
    Utf8 { key: String },
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key` and everything below it. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Names of the directories directly below `key`.
    async fn child_dirs(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;
}

fn dir_prefix(key: &str) -> String {
    format!("{}/", key.trim_end_matches('/'))
}

/// First segment of every key below `prefix` that has further segments.
fn collect_child_dirs<'a>(prefix: &str, keys: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    keys.filter_map(|k| k.strip_prefix(prefix))
        .filter_map(|rest| rest.split_once('/'))
        .map(|(dir, _)| dir.to_string())
        .filter(|dir| !dir.is_empty())
        .collect()
}

/// like etcd, k:/rk8s/services/ceph/osd/desired/<node>/device/<uuid>/osd-id-data v:"3"
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
}

impl XlineStore {
    pub async fn new(config: &XlineConfig) -> Result<Self, StoreError> {
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            ConnectOptions::default().with_user(user.clone(), pass.clone())
        } else {
            ConnectOptions::default()
        };
        let client = Client::connect(config.endpoints.clone(), Some(opts)).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }
}

#[async_trait]
impl ConfigStore for XlineStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => kv
                .value_str()
                .map(|v| Some(v.to_string()))
                .map_err(|_| StoreError::Utf8 {
                    key: key.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut client = self.client.write().await;
        client.put(key, value, Some(PutOptions::new())).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.write().await;
        client.delete(key, None).await?;
        client
            .delete(dir_prefix(key), Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }

    async fn child_dirs(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let prefix = dir_prefix(key);
        let mut client = self.client.write().await;
        let resp = client
            .get(
                prefix.clone(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        let keys: Vec<String> = resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key()).to_string())
            .collect();
        Ok(collect_child_dirs(&prefix, keys.iter().map(String::as_str)))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    values: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key currently stored, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.values.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ConfigStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let prefix = dir_prefix(key);
        self.values
            .lock()
            .await
            .retain(|k, _| k != key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn child_dirs(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let prefix = dir_prefix(key);
        let values = self.values.lock().await;
        Ok(collect_child_dirs(&prefix, values.keys().map(String::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_store_get_set() {
        let store = MemStore::new();
        assert_eq!(store.get("/a/b").await.unwrap(), None);
        store.set("/a/b", "1").await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap().as_deref(), Some("1"));
        store.set("/a/b", "2").await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_mem_store_delete_is_recursive() {
        let store = MemStore::new();
        store.set("/a/b/c", "1").await.unwrap();
        store.set("/a/b/d/e", "2").await.unwrap();
        store.set("/a/bb", "3").await.unwrap();

        store.delete("/a/b").await.unwrap();
        assert_eq!(store.keys().await, vec!["/a/bb".to_string()]);

        // deleting something that is not there is fine
        store.delete("/nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_child_dirs_skip_leaf_keys() {
        let store = MemStore::new();
        store.set("/root/x/one", "1").await.unwrap();
        store.set("/root/x/two", "2").await.unwrap();
        store.set("/root/y/deep/key", "3").await.unwrap();
        store.set("/root/leaf", "4").await.unwrap();
        store.set("/rootless/z/k", "5").await.unwrap();

        let dirs = store.child_dirs("/root").await.unwrap();
        assert_eq!(
            dirs.into_iter().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
        assert!(store.child_dirs("/missing").await.unwrap().is_empty());
    }
}
