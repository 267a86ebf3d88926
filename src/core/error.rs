//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 EmitResult（转为带错误的 ActionResult）或 AbortTurn。

use thiserror::Error;

use crate::actions::ActionCall;
use crate::memory::StoreError;

/// 动作执行核心中可能出现的错误（解析、解析失败、处理器失败、持久化等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 动作名无法解析到已注册的定义
    #[error("Action not found: {name}")]
    NotFound {
        name: String,
        context_key: Option<String>,
    },

    /// 调用内容不合法；携带原始调用便于诊断
    #[error("Parsing error in '{}': {message}", call.name)]
    Parsing {
        message: String,
        call: Box<ActionCall>,
    },

    /// 单次处理器尝试失败（可重试）
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// 重试耗尽后仍失败
    #[error("Task failed after {attempts} attempt(s): {message}")]
    TaskRunner { attempts: u32, message: String },

    #[error("Cancelled")]
    Cancelled,

    /// 持久化 I/O 失败：对本轮是致命的
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),

    /// 模型流无法建立
    #[error("LLM error: {0}")]
    Llm(String),
}

impl AgentError {
    /// 是否值得由 TaskRunner 再试一次；只有处理器自身的失败可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::ActionFailed(_))
    }

    /// 写入 ActionResult.data.error 的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::NotFound { .. } => "NOT_FOUND",
            AgentError::Parsing { .. } => "PARSING_ERROR",
            AgentError::ActionFailed(_) => "ACTION_FAILED",
            AgentError::TaskRunner { .. } => "TASK_RUNNER_ERROR",
            AgentError::Cancelled => "CANCELLED",
            AgentError::Store(_) => "STORE_ERROR",
            AgentError::Config(_) => "CONFIG_ERROR",
            AgentError::Llm(_) => "LLM_ERROR",
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 转为带错误的 ActionResult 写回对话，让模型下一轮自行处理
    EmitResult(serde_json::Value),
    /// 终止本轮（记忆视图可能已不一致）
    AbortTurn,
}
