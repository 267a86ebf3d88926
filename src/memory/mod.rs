//! 记忆层：上下文定义与实例、实例缓存与持久化、动作结果轨迹

pub mod context;
pub mod file_store;
pub mod manager;
pub mod store;
pub mod trace;

pub use context::{ContextDefinition, ContextInstance, DEFAULT_CONTEXT_KEY};
pub use file_store::FileStore;
pub use manager::ContextManager;
pub use store::{InMemoryStore, MemoryStore, MemoryStoreExt, StoreError};
pub use trace::ResultTrace;
