//! 持久化存储契约
//!
//! 记忆层对外只依赖这一组窄接口：get / set / delete / clear / keys(prefix)，全部异步。
//! trait 以 JSON 值为载体以保持对象安全；类型化读写由 MemoryStoreExt 提供。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(String),
    #[error("serde: {0}")]
    Serde(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// 持久化后端
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// 按前缀列出键（None 为全部），结果有序
    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError>;
}

/// 类型化读写
#[async_trait]
pub trait MemoryStoreExt: MemoryStore {
    async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set(key, serde_json::to_value(value)?).await
    }
}

impl<S: MemoryStore + ?Sized> MemoryStoreExt for S {}

/// 进程内实现（测试与未配置 store_dir 时使用）
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Todo {
        title: String,
        done: bool,
    }

    #[tokio::test]
    async fn test_in_memory_crud_and_prefix() {
        let store = InMemoryStore::new();
        store.set("context:todo:a", json!(1)).await.unwrap();
        store.set("context:todo:b", json!(2)).await.unwrap();
        store.set("other", json!(3)).await.unwrap();

        assert_eq!(store.get("context:todo:a").await.unwrap(), Some(json!(1)));
        assert_eq!(
            store.keys(Some("context:")).await.unwrap(),
            vec!["context:todo:a", "context:todo:b"]
        );

        store.delete("context:todo:a").await.unwrap();
        assert_eq!(store.get("context:todo:a").await.unwrap(), None);
        store.clear().await.unwrap();
        assert!(store.keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_typed_access() {
        let store = InMemoryStore::new();
        let todo = Todo {
            title: "milk".to_string(),
            done: false,
        };
        store.set_as("t", &todo).await.unwrap();
        let back: Option<Todo> = store.get_as("t").await.unwrap();
        assert_eq!(back, Some(todo));

        store.set("bad", json!("not a todo")).await.unwrap();
        let err = store.get_as::<Todo>("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Serde(_)));
    }
}
