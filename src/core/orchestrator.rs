//! 动作调用编排：解析 -> 参数解析 -> 准入 -> 入队 -> 提交
//!
//! 解析、参数解析、准入在调用处同步完成；只有处理器执行交给 TaskRunner 的 lane。
//! 处理器拿到的是上下文实例的副本，成功后才写回存储；每个结束的任务输出一条 JSON 审计日志。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actions::{
    parse_call, ActionCall, ActionContext, ActionRegistry, ActionResult, RegisteredAction,
};
use crate::admission::{AdmissionController, AdmissionDecision, Fingerprint};
use crate::core::state::{CallPhase, CallTracker};
use crate::core::task_runner::{EnqueueOptions, TaskOutcome, TaskRunner};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::{ContextInstance, ContextManager};

/// 一轮内共享的解析与取消范围
#[derive(Debug, Clone)]
pub struct TurnScope {
    pub registry: Arc<ActionRegistry>,
    pub cancel: CancellationToken,
}

/// 已分派的调用：要么已有结果，要么在 lane 中执行
#[derive(Debug)]
pub struct DispatchedCall {
    pub call: ActionCall,
    pub tracker: Arc<CallTracker>,
    state: Dispatch,
}

#[derive(Debug)]
enum Dispatch {
    Ready(ActionResult),
    Pending(JoinHandle<Result<ActionResult, AgentError>>),
}

impl DispatchedCall {
    pub fn is_pending(&self) -> bool {
        matches!(self.state, Dispatch::Pending(_))
    }

    /// 等待终态结果。只有需要终止本轮的错误（持久化失败）以 Err 返回
    pub async fn settle(self) -> Result<ActionResult, AgentError> {
        let result = match self.state {
            Dispatch::Ready(result) => result,
            Dispatch::Pending(handle) => match handle.await {
                Ok(result) => result?,
                Err(e) => {
                    tracing::error!(call_id = %self.call.id, error = %e, "Action task aborted");
                    self.tracker.advance(CallPhase::Failed);
                    let err = AgentError::TaskRunner {
                        attempts: 0,
                        message: e.to_string(),
                    };
                    error_result(&self.call, &err).unwrap_or_else(|| {
                        ActionResult::new(&self.call, json!({ "error": err.code() }))
                    })
                }
            },
        };
        self.tracker.advance(CallPhase::ResultEmitted);
        Ok(result)
    }
}

/// 把错误转成带 error 字段的结果；需要终止本轮时返回 None
fn error_result(call: &ActionCall, err: &AgentError) -> Option<ActionResult> {
    match RecoveryEngine::new().handle(err) {
        RecoveryAction::EmitResult(data) => Some(ActionResult::new(call, data)),
        RecoveryAction::AbortTurn => None,
    }
}

/// 调用编排器：由 AgentBuilder 构建一次，准入控制器、执行器、上下文管理器显式注入
#[derive(Debug, Clone)]
pub struct ActionOrchestrator {
    admission: Arc<AdmissionController>,
    runner: TaskRunner,
    contexts: Arc<ContextManager>,
}

impl ActionOrchestrator {
    pub fn new(
        admission: Arc<AdmissionController>,
        runner: TaskRunner,
        contexts: Arc<ContextManager>,
    ) -> Self {
        Self {
            admission,
            runner,
            contexts,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// 同步完成解析、参数解析与准入；放行的调用进入 lane。
    /// 返回时调用已排好队，同一队列键下的执行顺序即 dispatch 的顺序。
    pub fn dispatch(&self, mut call: ActionCall, turn: &TurnScope) -> DispatchedCall {
        let tracker = Arc::new(CallTracker::new(call.id.clone()));

        let action = match turn.registry.resolve(&call) {
            Ok(action) => action,
            Err(err) => return self.reject(call, tracker, err),
        };
        tracker.advance(CallPhase::Resolved);

        // 未带 contextKey 却解析到了绑定动作：补上实例 key，
        // 指纹与 lane 都按实例计算，同一实例的记忆只会在一条 lane 里被改写
        if call.context_key().is_none() {
            if let Some(key) = action.context_key() {
                call.params.context_key = Some(key.to_string());
            }
        }

        let args = match parse_call(&call, &action.definition) {
            Ok(args) => args,
            Err(err) => return self.reject(call, tracker, err),
        };
        tracker.advance(CallPhase::Parsed);

        let decision = self
            .admission
            .should_execute(&action.definition, &call, &args);
        let fingerprint = match decision {
            AdmissionDecision::Execute { fingerprint } => fingerprint,
            AdmissionDecision::Cached { result, .. } => {
                tracker.advance(CallPhase::Cached);
                tracing::info!(action = %call.name, call_id = %call.id, "Served from admission cache");
                return ready(call, tracker, result);
            }
            other => {
                let phase = if other.allow_with_confirmation() {
                    CallPhase::ConfirmRequired
                } else {
                    CallPhase::Blocked
                };
                tracker.advance(phase);
                tracing::info!(
                    action = %call.name,
                    call_id = %call.id,
                    conflicting = ?other.conflicting_call_id(),
                    phase = %phase,
                    "Call not admitted"
                );
                let data = other.rejection_data().unwrap_or(Value::Null);
                let result = ActionResult::new(&call, data);
                return ready(call, tracker, result);
            }
        };
        tracker.advance(CallPhase::Admitted);

        // 先记 QUEUED：lane 可能在 enqueue 返回前就开始执行
        tracker.advance(CallPhase::Queued);
        let handle = self.enqueue(&call, action, args, fingerprint, turn, tracker.clone());

        DispatchedCall {
            call,
            tracker,
            state: Dispatch::Pending(handle),
        }
    }

    fn reject(&self, call: ActionCall, tracker: Arc<CallTracker>, err: AgentError) -> DispatchedCall {
        tracker.advance(CallPhase::Failed);
        tracing::debug!(action = %call.name, call_id = %call.id, error = %err, "Call rejected before admission");
        let result = error_result(&call, &err)
            .unwrap_or_else(|| ActionResult::new(&call, json!({ "error": err.code() })));
        ready(call, tracker, result)
    }

    fn enqueue(
        &self,
        call: &ActionCall,
        action: RegisteredAction,
        args: Value,
        fingerprint: Fingerprint,
        turn: &TurnScope,
        tracker: Arc<CallTracker>,
    ) -> JoinHandle<Result<ActionResult, AgentError>> {
        let definition = action.definition.clone();
        let options = EnqueueOptions {
            retry: definition.retry.clone(),
            cancel: turn.cancel.clone(),
            queue_key: definition.queue_key_for(call, &args),
            label: definition.name.clone(),
        };

        let attempt_call = call.clone();
        let attempt_args = args.clone();
        let attempt_tracker = tracker.clone();
        let contexts = self.contexts.clone();
        let handle = self.runner.enqueue(options, move |attempt, scope| {
            let call = attempt_call.clone();
            let args = attempt_args.clone();
            let tracker = attempt_tracker.clone();
            let contexts = contexts.clone();
            let action = action.clone();
            async move {
                if attempt == 1 {
                    tracker.advance(CallPhase::Running);
                }
                // 实例在 lane 内读取，拿到的是该 key 上前一个任务提交后的状态
                let instance = match &action.binding {
                    Some(binding) => {
                        Some(contexts.get_or_create(&binding.context, &binding.args).await?)
                    }
                    None => None,
                };
                let mut ctx = ActionContext::new(call, attempt, instance, scope);
                let data = action.definition.handler.handle(args, &mut ctx).await?;
                if let Some(instance) = &ctx.instance {
                    contexts.save(instance).await?;
                }
                Ok::<_, AgentError>((data, ctx.instance))
            }
        });

        let admission = self.admission.clone();
        let call = call.clone();
        tokio::spawn(async move {
            let outcome = handle.join().await;
            finalize(&admission, &call, &definition, &args, &fingerprint, &tracker, outcome)
        })
    }
}

fn ready(call: ActionCall, tracker: Arc<CallTracker>, result: ActionResult) -> DispatchedCall {
    DispatchedCall {
        call,
        tracker,
        state: Dispatch::Ready(result),
    }
}

/// 任务结束：生成结果、格式化、成功钩子、登记准入历史、写审计日志
fn finalize(
    admission: &AdmissionController,
    call: &ActionCall,
    definition: &crate::actions::ActionDefinition,
    args: &Value,
    fingerprint: &Fingerprint,
    tracker: &CallTracker,
    outcome: TaskOutcome<(Value, Option<ContextInstance>)>,
) -> Result<ActionResult, AgentError> {
    let TaskOutcome {
        result,
        attempts,
        elapsed,
    } = outcome;

    match result {
        Ok((data, instance)) => {
            let mut result = ActionResult::new(call, data);
            if let Some(formatter) = &definition.formatter {
                result.formatted = Some(formatter(&result));
            }
            if let Some(hook) = &definition.on_success {
                hook(&result, instance.as_ref());
            }
            admission.complete(fingerprint, &result, true);
            tracker.advance(CallPhase::Succeeded);
            audit(call, args, true, "succeeded", attempts, elapsed);
            Ok(result)
        }
        Err(err) => {
            tracker.advance(CallPhase::Failed);
            audit(call, args, false, err.code(), attempts, elapsed);
            match error_result(call, &err) {
                Some(result) => {
                    admission.complete(fingerprint, &result, false);
                    Ok(result)
                }
                None => {
                    let placeholder = ActionResult::new(call, json!({ "error": err.code() }));
                    admission.complete(fingerprint, &placeholder, false);
                    Err(err)
                }
            }
        }
    }
}

fn audit(call: &ActionCall, args: &Value, ok: bool, outcome: &str, attempts: u32, elapsed: Duration) {
    let audit = json!({
        "event": "action_audit",
        "action": call.name,
        "call_id": call.id,
        "context_key": call.context_key(),
        "ok": ok,
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit.to_string(), "action");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionDefinition, ActionHandler, ArgumentSchema, ContextBinding};
    use crate::admission::AdmissionPolicy;
    use crate::core::task_runner::RetryPolicy;
    use crate::memory::{ContextDefinition, InMemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl ActionHandler for Counter {
        async fn handle(&self, args: Value, ctx: &mut ActionContext) -> Result<Value, AgentError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(memory) = ctx.memory_mut() {
                memory["last"] = args.clone();
            }
            Ok(json!({ "n": n }))
        }
    }

    struct Failing;

    #[async_trait]
    impl ActionHandler for Failing {
        async fn handle(&self, _args: Value, ctx: &mut ActionContext) -> Result<Value, AgentError> {
            if let Some(memory) = ctx.memory_mut() {
                memory["dirty"] = json!(true);
            }
            Err(AgentError::ActionFailed("upstream down".to_string()))
        }
    }

    fn orchestrator() -> ActionOrchestrator {
        ActionOrchestrator::new(
            Arc::new(AdmissionController::new(AdmissionPolicy::default())),
            TaskRunner::new(4, Duration::from_secs(5), RetryPolicy::none()),
            Arc::new(ContextManager::new(Arc::new(InMemoryStore::new()), 16)),
        )
    }

    fn scope(registry: ActionRegistry) -> TurnScope {
        TurnScope {
            registry: Arc::new(registry),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_becomes_not_found_result() {
        let orch = orchestrator();
        let turn = scope(ActionRegistry::new());
        let dispatched = orch.dispatch(ActionCall::new("refundOrder", ""), &turn);
        assert!(!dispatched.is_pending());
        let tracker = dispatched.tracker.clone();
        let result = dispatched.settle().await.unwrap();
        assert_eq!(result.data["error"], "NOT_FOUND");
        assert_eq!(
            tracker.history(),
            vec![CallPhase::Received, CallPhase::Failed, CallPhase::ResultEmitted]
        );
    }

    #[tokio::test]
    async fn test_success_commits_memory_and_formats() {
        let orch = orchestrator();
        let hits = Arc::new(AtomicU32::new(0));
        let context = Arc::new(ContextDefinition::new("user"));
        let definition = ActionDefinition::new("note", Counter(hits.clone()))
            .with_schema(ArgumentSchema::Text)
            .with_formatter(|r| format!("note #{}", r.data["n"]));
        let mut registry = ActionRegistry::new();
        registry.register_bound(
            Arc::new(definition),
            ContextBinding {
                context: context.clone(),
                key: "default".to_string(),
                args: json!({}),
            },
        );
        let turn = scope(registry);

        let call = ActionCall::new("note", " hello ").with_context_key("default");
        let dispatched = orch.dispatch(call, &turn);
        let tracker = dispatched.tracker.clone();
        let result = dispatched.settle().await.unwrap();
        assert_eq!(result.formatted.as_deref(), Some("note #1"));
        assert_eq!(tracker.phase(), CallPhase::ResultEmitted);
        assert!(tracker.history().contains(&CallPhase::Succeeded));

        let stored = orch.contexts().get("user", "default").await.unwrap().unwrap();
        assert_eq!(stored.memory["last"], "hello");
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_memory_untouched() {
        let orch = orchestrator();
        let context = Arc::new(ContextDefinition::new("user"));
        let mut registry = ActionRegistry::new();
        registry.register_bound(
            Arc::new(ActionDefinition::new("break", Failing).with_retry(RetryPolicy::attempts(2, 1))),
            ContextBinding {
                context: context.clone(),
                key: "default".to_string(),
                args: json!({}),
            },
        );
        let turn = scope(registry);
        let result = orch
            .dispatch(ActionCall::new("break", ""), &turn)
            .settle()
            .await
            .unwrap();
        assert_eq!(result.data["error"], "TASK_RUNNER_ERROR");
        assert_eq!(result.data["attempts"], 2);

        let stored = orch.contexts().get("user", "default").await.unwrap().unwrap();
        assert!(stored.memory.get("dirty").is_none());
    }

    #[tokio::test]
    async fn test_unscoped_call_shares_bound_instance_fingerprint() {
        let orch = orchestrator();
        let hits = Arc::new(AtomicU32::new(0));
        let context = Arc::new(ContextDefinition::new("user"));
        let mut registry = ActionRegistry::new();
        registry.register_bound(
            Arc::new(ActionDefinition::new("note", Counter(hits.clone())).with_schema(ArgumentSchema::Text)),
            ContextBinding {
                context,
                key: "alice".to_string(),
                args: json!({}),
            },
        );
        let turn = scope(registry);

        let scoped = orch.dispatch(ActionCall::new("note", "x").with_context_key("alice"), &turn);
        let unscoped = orch.dispatch(ActionCall::new("note", "x"), &turn);
        assert_eq!(unscoped.call.context_key(), Some("alice"));
        assert!(!unscoped.is_pending());

        let first = scoped.settle().await.unwrap();
        let second = unscoped.settle().await.unwrap();
        assert_eq!(first.data["n"], 1);
        assert_eq!(second.status(), Some("blocked"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parse_error_is_result_not_abort() {
        let orch = orchestrator();
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(
            ActionDefinition::new("strict", Failing).with_format(crate::actions::CallFormat::Json),
        ));
        let turn = scope(registry);
        let result = orch
            .dispatch(ActionCall::new("strict", "{not json"), &turn)
            .settle()
            .await
            .unwrap();
        assert_eq!(result.data["error"], "PARSING_ERROR");
    }
}
