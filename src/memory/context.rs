//! 上下文定义与上下文实例
//!
//! 上下文 = 某类实体的持久状态（如某个用户的待办列表）。同一 (type, key) 只有一个实例，
//! 首次引用时惰性创建，之后每次变更都写回存储。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actions::ActionDefinition;

/// 未配置 key 函数时所有参数都落到同一个实例
pub const DEFAULT_CONTEXT_KEY: &str = "default";

/// 存储中的键：`context:{type}:{key}`
pub fn storage_key(context_type: &str, key: &str) -> String {
    format!("context:{context_type}:{key}")
}

pub type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
pub type CreateFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type TurnHook = Arc<dyn Fn(&mut ContextInstance) + Send + Sync>;

/// 上下文类型定义：key 计算、初始记忆、绑定的动作、每轮钩子
#[derive(Clone)]
pub struct ContextDefinition {
    pub context_type: String,
    pub key_fn: Option<KeyFn>,
    pub create: Option<CreateFn>,
    pub actions: Vec<Arc<ActionDefinition>>,
    pub on_turn: Option<TurnHook>,
}

impl ContextDefinition {
    pub fn new(context_type: impl Into<String>) -> Self {
        Self {
            context_type: context_type.into(),
            key_fn: None,
            create: None,
            actions: Vec::new(),
            on_turn: None,
        }
    }

    pub fn with_key(mut self, f: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(f));
        self
    }

    pub fn with_create(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.create = Some(Arc::new(f));
        self
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub fn on_turn(mut self, f: impl Fn(&mut ContextInstance) + Send + Sync + 'static) -> Self {
        self.on_turn = Some(Arc::new(f));
        self
    }

    pub fn key_for(&self, args: &Value) -> String {
        match &self.key_fn {
            Some(f) => f(args),
            None => DEFAULT_CONTEXT_KEY.to_string(),
        }
    }

    pub fn initial_memory(&self, args: &Value) -> Value {
        match &self.create {
            Some(f) => f(args),
            None => json!({}),
        }
    }

    pub fn storage_key(&self, key: &str) -> String {
        storage_key(&self.context_type, key)
    }
}

impl fmt::Debug for ContextDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextDefinition")
            .field("context_type", &self.context_type)
            .field(
                "actions",
                &self.actions.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            )
            .field("on_turn", &self.on_turn.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInstance {
    #[serde(rename = "type")]
    pub context_type: String,
    pub key: String,
    pub args: Value,
    pub memory: Value,
    /// 毫秒时间戳
    pub created_at: i64,
}

impl ContextInstance {
    pub fn new(definition: &ContextDefinition, args: Value) -> Self {
        let memory = definition.initial_memory(&args);
        Self {
            context_type: definition.context_type.clone(),
            key: definition.key_for(&args),
            args,
            memory,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.context_type, self.key)
    }

    pub fn storage_key(&self) -> String {
        storage_key(&self.context_type, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_is_constant() {
        let def = ContextDefinition::new("todo");
        assert_eq!(def.key_for(&json!({ "user": "a" })), "default");
        assert_eq!(def.key_for(&json!({ "user": "b" })), "default");
        assert_eq!(def.storage_key("default"), "context:todo:default");
    }

    #[test]
    fn test_key_fn_and_create_hook() {
        let def = ContextDefinition::new("todo")
            .with_key(|args| args["user"].as_str().unwrap_or("anon").to_string())
            .with_create(|args| json!({ "owner": args["user"], "tasks": [] }));
        let instance = ContextInstance::new(&def, json!({ "user": "userA" }));
        assert_eq!(instance.key, "userA");
        assert_eq!(instance.id(), "todo:userA");
        assert_eq!(instance.memory["owner"], "userA");
    }

    #[test]
    fn test_instance_wire_shape() {
        let def = ContextDefinition::new("todo");
        let instance = ContextInstance::new(&def, json!({}));
        let wire = serde_json::to_value(&instance).unwrap();
        assert_eq!(wire["type"], "todo");
        assert!(wire.get("createdAt").is_some());
    }
}
