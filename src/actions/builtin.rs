//! 内置动作：echo（无上下文、可缓存）与待办列表上下文（add-task / complete-task）
//!
//! 主要用于演示二进制与集成测试。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::actions::{ActionContext, ActionDefinition, ActionHandler, ArgumentSchema};
use crate::core::AgentError;
use crate::memory::{ContextDefinition, DEFAULT_CONTEXT_KEY};

/// Echo：回显文本
pub struct EchoAction;

#[async_trait]
impl ActionHandler for EchoAction {
    async fn handle(&self, args: Value, _ctx: &mut ActionContext) -> Result<Value, AgentError> {
        let text = args.as_str().unwrap_or_default();
        Ok(json!({ "text": text }))
    }
}

pub fn echo() -> ActionDefinition {
    ActionDefinition::new("echo", EchoAction)
        .describe("Echo text back (for testing). Content: the text to echo.")
        .with_schema(ArgumentSchema::Text)
        .cacheable()
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddTaskArgs {
    /// 任务标题
    pub title: String,
    /// 优先级，数字越小越优先
    pub priority: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompleteTaskArgs {
    pub id: i64,
}

fn tasks_mut(ctx: &mut ActionContext) -> Result<&mut Value, AgentError> {
    let memory = ctx
        .memory_mut()
        .ok_or_else(|| AgentError::ActionFailed("todo actions need a todo context".to_string()))?;
    if !memory.get("tasks").is_some_and(Value::is_array) {
        memory["tasks"] = json!([]);
    }
    Ok(memory)
}

pub struct AddTaskAction;

#[async_trait]
impl ActionHandler for AddTaskAction {
    async fn handle(&self, args: Value, ctx: &mut ActionContext) -> Result<Value, AgentError> {
        let args: AddTaskArgs =
            serde_json::from_value(args).map_err(|e| AgentError::ActionFailed(e.to_string()))?;
        let memory = tasks_mut(ctx)?;
        let id = memory["nextId"].as_i64().unwrap_or(1);
        let task = json!({
            "id": id,
            "title": args.title,
            "priority": args.priority.unwrap_or(3),
            "done": false,
        });
        if let Some(tasks) = memory["tasks"].as_array_mut() {
            tasks.push(task.clone());
        }
        memory["nextId"] = json!(id + 1);
        Ok(task)
    }
}

pub struct CompleteTaskAction;

#[async_trait]
impl ActionHandler for CompleteTaskAction {
    async fn handle(&self, args: Value, ctx: &mut ActionContext) -> Result<Value, AgentError> {
        let args: CompleteTaskArgs =
            serde_json::from_value(args).map_err(|e| AgentError::ActionFailed(e.to_string()))?;
        let memory = tasks_mut(ctx)?;
        let task = memory["tasks"]
            .as_array_mut()
            .and_then(|tasks| tasks.iter_mut().find(|t| t["id"].as_i64() == Some(args.id)))
            .ok_or_else(|| AgentError::ActionFailed(format!("no task with id {}", args.id)))?;
        task["done"] = json!(true);
        Ok(task.clone())
    }
}

/// 待办列表上下文：按 args.user 区分实例
pub fn todo_context() -> ContextDefinition {
    ContextDefinition::new("todo")
        .with_key(|args| {
            args.get("user")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_CONTEXT_KEY)
                .to_string()
        })
        .with_create(|args| {
            json!({
                "owner": args.get("user").cloned().unwrap_or(Value::Null),
                "tasks": [],
                "nextId": 1,
            })
        })
        .with_action(
            ActionDefinition::new("add-task", AddTaskAction)
                .describe("Add a task to the user's todo list.")
                .with_schema(ArgumentSchema::of::<AddTaskArgs>())
                .with_formatter(|result| {
                    format!(
                        "Added task #{}: {}",
                        result.data["id"],
                        result.data["title"].as_str().unwrap_or_default()
                    )
                }),
        )
        .with_action(
            ActionDefinition::new("complete-task", CompleteTaskAction)
                .describe("Mark a task as done.")
                .with_schema(ArgumentSchema::of::<CompleteTaskArgs>())
                .sensitive(),
        )
        .on_turn(|instance| {
            let turns = instance.memory["turns"].as_u64().unwrap_or(0);
            instance.memory["turns"] = json!(turns + 1);
        })
}
