//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction：除持久化失败外，所有错误都只影响出错的那一次调用，
//! 以结构化结果的形式回到对话，Agent 循环继续。

use serde_json::json;

use crate::core::{AgentError, RecoveryAction};

/// 将错误映射为可执行动作（写回错误结果 / 终止本轮）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            // 记忆视图不一致时继续执行有静默丢数据的风险
            AgentError::Store(_) => RecoveryAction::AbortTurn,
            AgentError::TaskRunner { attempts, message } => RecoveryAction::EmitResult(json!({
                "error": err.code(),
                "message": message,
                "attempts": attempts,
            })),
            AgentError::NotFound { name, context_key } => RecoveryAction::EmitResult(json!({
                "error": err.code(),
                "message": err.to_string(),
                "action": name,
                "contextKey": context_key,
            })),
            AgentError::Parsing { message, call } => RecoveryAction::EmitResult(json!({
                "error": err.code(),
                "message": message,
                "content": call.content,
            })),
            _ => RecoveryAction::EmitResult(json!({
                "error": err.code(),
                "message": err.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionCall;
    use crate::memory::StoreError;

    #[test]
    fn test_recovery_store_error_aborts_turn() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Store(StoreError::Io("disk full".to_string()));
        assert!(matches!(engine.handle(&err), RecoveryAction::AbortTurn));
    }

    #[test]
    fn test_recovery_task_runner_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::TaskRunner {
            attempts: 3,
            message: "gateway timeout".to_string(),
        };
        match engine.handle(&err) {
            RecoveryAction::EmitResult(data) => {
                assert_eq!(data["error"], "TASK_RUNNER_ERROR");
                assert_eq!(data["attempts"], 3);
            }
            _ => panic!("Expected EmitResult"),
        }
    }

    #[test]
    fn test_recovery_parsing_keeps_content() {
        let engine = RecoveryEngine::new();
        let call = ActionCall::new("add-task", "{not json");
        let err = AgentError::Parsing {
            message: "expected value".to_string(),
            call: Box::new(call),
        };
        match engine.handle(&err) {
            RecoveryAction::EmitResult(data) => {
                assert_eq!(data["error"], "PARSING_ERROR");
                assert_eq!(data["content"], "{not json");
            }
            _ => panic!("Expected EmitResult"),
        }
    }

    #[test]
    fn test_recovery_not_found() {
        let engine = RecoveryEngine::new();
        let err = AgentError::NotFound {
            name: "refundOrder".to_string(),
            context_key: None,
        };
        match engine.handle(&err) {
            RecoveryAction::EmitResult(data) => {
                assert_eq!(data["error"], "NOT_FOUND");
                assert_eq!(data["action"], "refundOrder");
            }
            _ => panic!("Expected EmitResult"),
        }
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        match engine.handle(&AgentError::Cancelled) {
            RecoveryAction::EmitResult(data) => assert_eq!(data["error"], "CANCELLED"),
            _ => panic!("Expected EmitResult"),
        }
    }
}
