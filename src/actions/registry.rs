//! 动作注册表与解析
//!
//! 每轮开始时由 Agent 级动作与各活跃上下文实例的动作构建一次，之后只读；
//! 按 (name, contextKey) 查找，注册顺序中第一个匹配者胜出。

use std::sync::Arc;

use serde_json::Value;

use crate::actions::{ActionCall, ActionDefinition};
use crate::core::AgentError;
use crate::memory::ContextDefinition;

/// 动作所绑定的上下文实例
#[derive(Debug, Clone)]
pub struct ContextBinding {
    pub context: Arc<ContextDefinition>,
    pub key: String,
    pub args: Value,
}

/// 注册表中的一项：动作定义 + 可选的上下文绑定
#[derive(Debug, Clone)]
pub struct RegisteredAction {
    pub definition: Arc<ActionDefinition>,
    pub binding: Option<ContextBinding>,
}

impl RegisteredAction {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn context_key(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.key.as_str())
    }
}

/// 不可变注册表
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    entries: Vec<RegisteredAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent 级动作（不绑定上下文）
    pub fn register(&mut self, definition: Arc<ActionDefinition>) {
        self.entries.push(RegisteredAction {
            definition,
            binding: None,
        });
    }

    pub fn register_bound(&mut self, definition: Arc<ActionDefinition>, binding: ContextBinding) {
        self.entries.push(RegisteredAction {
            definition,
            binding: Some(binding),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn action_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    /// 有 contextKey 时只匹配绑定到该 key 的动作；否则任何同名动作都可匹配
    pub fn resolve(&self, call: &ActionCall) -> Result<RegisteredAction, AgentError> {
        let scope = call.context_key();
        let found = self.entries.iter().find(|entry| {
            entry.name() == call.name
                && match scope {
                    Some(key) => entry.context_key() == Some(key),
                    None => true,
                }
        });

        match found {
            Some(entry) => Ok(entry.clone()),
            None => {
                if self.entries.is_empty() {
                    tracing::warn!(
                        action = %call.name,
                        "No actions registered for this turn; cannot resolve call"
                    );
                } else {
                    tracing::debug!(
                        action = %call.name,
                        context_key = ?scope,
                        "Action not found"
                    );
                }
                Err(AgentError::NotFound {
                    name: call.name.clone(),
                    context_key: scope.map(str::to_string),
                })
            }
        }
    }

    /// 返回 (name, description, schema)，用于生成 prompt 中的 Available actions 段落
    pub fn to_schema_json(&self) -> String {
        let actions: Vec<Value> = self
            .entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name(),
                    "description": e.definition.description,
                    "contextKey": e.context_key(),
                    "format": e.definition.format,
                    "parameters": e.definition.schema.to_json(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&actions).unwrap_or_else(|_| "[]".to_string())
    }
}
