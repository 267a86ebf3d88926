//! 上下文实例管理：进程内 LRU 缓存 + 持久化存储
//!
//! get_or_create 依次查缓存、查存储、调用 create 钩子初始化并立即落盘；
//! save 在每次变更后写回存储并刷新缓存。缓存淘汰只影响内存，不会删除存储中的数据。

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::MemorySection;
use crate::memory::context::{storage_key, ContextDefinition, ContextInstance};
use crate::memory::store::{InMemoryStore, MemoryStore, MemoryStoreExt, StoreError};
use crate::memory::FileStore;

pub struct ContextManager {
    store: Arc<dyn MemoryStore>,
    /// 按最近使用排序，末尾最新
    cache: Mutex<IndexMap<String, ContextInstance>>,
    capacity: usize,
}

impl ContextManager {
    pub fn new(store: Arc<dyn MemoryStore>, capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// 配置了 store_dir 用文件存储，否则用进程内存储
    pub fn from_config(section: &MemorySection) -> Self {
        let store: Arc<dyn MemoryStore> = match &section.store_dir {
            Some(dir) => Arc::new(FileStore::new(dir)),
            None => Arc::new(InMemoryStore::new()),
        };
        Self::new(store, section.cache_capacity)
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub async fn get_or_create(
        &self,
        definition: &ContextDefinition,
        args: &Value,
    ) -> Result<ContextInstance, StoreError> {
        let key = definition.key_for(args);
        if let Some(instance) = self.get(&definition.context_type, &key).await? {
            return Ok(instance);
        }

        let instance = ContextInstance::new(definition, args.clone());
        tracing::info!(context = %instance.id(), "Context instance created");
        self.save(&instance).await?;
        Ok(instance)
    }

    /// 缓存优先，其次存储；都没有返回 None
    pub async fn get(
        &self,
        context_type: &str,
        key: &str,
    ) -> Result<Option<ContextInstance>, StoreError> {
        let id = storage_key(context_type, key);
        if let Some(instance) = self.touch(&id) {
            return Ok(Some(instance));
        }

        match self.store.get_as::<ContextInstance>(&id).await? {
            Some(instance) => {
                tracing::debug!(context = %instance.id(), "Context instance loaded from store");
                self.put(id, instance.clone());
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// 写回存储；成功后才更新缓存，存储失败时缓存仍是上一次提交的状态
    pub async fn save(&self, instance: &ContextInstance) -> Result<(), StoreError> {
        let id = instance.storage_key();
        self.store.set_as(&id, instance).await?;
        self.put(id, instance.clone());
        Ok(())
    }

    /// 每轮开始时执行 on_turn 钩子（有则执行并保存），返回最新实例
    pub async fn begin_turn(
        &self,
        definition: &ContextDefinition,
        args: &Value,
    ) -> Result<ContextInstance, StoreError> {
        let mut instance = self.get_or_create(definition, args).await?;
        if let Some(hook) = &definition.on_turn {
            hook(&mut instance);
            self.save(&instance).await?;
        }
        Ok(instance)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// 清空进程内缓存（下一次访问从存储重新加载）
    pub fn evict_all(&self) {
        self.cache.lock().clear();
    }

    fn touch(&self, id: &str) -> Option<ContextInstance> {
        let mut cache = self.cache.lock();
        let instance = cache.shift_remove(id)?;
        cache.insert(id.to_string(), instance.clone());
        Some(instance)
    }

    fn put(&self, id: String, instance: ContextInstance) {
        let mut cache = self.cache.lock();
        cache.shift_remove(&id);
        cache.insert(id, instance);
        while cache.len() > self.capacity {
            if let Some((evicted, _)) = cache.shift_remove_index(0) {
                tracing::debug!(context = %evicted, "Context instance evicted from cache");
            }
        }
    }
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("cached", &self.cached_len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_context() -> ContextDefinition {
        ContextDefinition::new("todo")
            .with_key(|args| args["user"].as_str().unwrap_or("anon").to_string())
            .with_create(|_| json!({ "tasks": [] }))
    }

    #[tokio::test]
    async fn test_persist_then_reload_yields_identical_memory() {
        let dir = tempfile::tempdir().unwrap();
        let def = todo_context();
        let args = json!({ "user": "userA" });

        let manager = ContextManager::new(Arc::new(FileStore::new(dir.path())), 8);
        let mut instance = manager.get_or_create(&def, &args).await.unwrap();
        instance.memory["tasks"] = json!([{ "title": "milk", "done": false }]);
        manager.save(&instance).await.unwrap();

        // 新进程：新的管理器、空缓存、同一目录
        let reloaded = ContextManager::new(Arc::new(FileStore::new(dir.path())), 8);
        let back = reloaded.get_or_create(&def, &args).await.unwrap();
        assert_eq!(back, instance);
    }

    #[tokio::test]
    async fn test_create_hook_runs_once() {
        let def = todo_context();
        let manager = ContextManager::new(Arc::new(InMemoryStore::new()), 8);
        let args = json!({ "user": "u1" });
        let first = manager.get_or_create(&def, &args).await.unwrap();
        let second = manager.get_or_create(&def, &args).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(
            manager.store().keys(Some("context:todo:")).await.unwrap(),
            vec!["context:todo:u1"]
        );
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_store() {
        let def = todo_context();
        let manager = ContextManager::new(Arc::new(InMemoryStore::new()), 2);
        for user in ["a", "b", "c"] {
            manager
                .get_or_create(&def, &json!({ "user": user }))
                .await
                .unwrap();
        }
        assert_eq!(manager.cached_len(), 2);
        // "a" 已被淘汰出缓存，但仍能从存储读回
        let a = manager.get("todo", "a").await.unwrap();
        assert!(a.is_some());
        assert_eq!(manager.cached_len(), 2);
    }

    #[tokio::test]
    async fn test_begin_turn_runs_hook_and_saves() {
        let def = todo_context().on_turn(|instance| {
            let turns = instance.memory["turns"].as_u64().unwrap_or(0);
            instance.memory["turns"] = json!(turns + 1);
        });
        let manager = ContextManager::new(Arc::new(InMemoryStore::new()), 8);
        let args = json!({ "user": "u" });
        manager.begin_turn(&def, &args).await.unwrap();
        let instance = manager.begin_turn(&def, &args).await.unwrap();
        assert_eq!(instance.memory["turns"], 2);

        manager.evict_all();
        let stored = manager.get("todo", "u").await.unwrap().unwrap();
        assert_eq!(stored.memory["turns"], 2);
    }
}
