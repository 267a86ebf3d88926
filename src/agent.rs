//! Agent 运行时：一轮 = 构建注册表 -> 消费模型流 -> 分派调用 -> 按准入顺序收集结果
//!
//! 供 CLI 与其他接入方调用。每轮开始时对活跃上下文执行 on_turn 钩子，并以
//! Agent 级动作 + 各上下文实例的动作构建只读注册表；模型输出中的调用边解析边分派，
//! 处理器在 TaskRunner 的 lane 中执行。只有持久化失败会终止本轮。

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::actions::{ActionDefinition, ActionRegistry, ActionResult, CallParams, ContextBinding};
use crate::core::orchestrator::{ActionOrchestrator, DispatchedCall, TurnScope};
use crate::core::{AgentError, SessionSupervisor};
use crate::llm::{LlmClient, Message};
use crate::memory::{ContextDefinition, ContextManager, ResultTrace};
use crate::stream::{StreamEvent, StreamInterpreter};

/// 本轮参与的上下文：定义 + 用于计算实例 key 的参数
#[derive(Debug, Clone)]
pub struct ActiveContext {
    pub definition: Arc<ContextDefinition>,
    pub args: Value,
}

impl ActiveContext {
    pub fn new(definition: Arc<ContextDefinition>, args: Value) -> Self {
        Self { definition, args }
    }
}

/// `<output>` 块
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputBlock {
    pub output_type: String,
    pub content: String,
    pub params: CallParams,
}

/// 一轮的产出
#[derive(Debug, Default, Serialize)]
pub struct TurnOutcome {
    /// 每个调用一条，同一队列键内按准入顺序
    pub results: Vec<ActionResult>,
    /// 标签之外的文本
    pub text: String,
    pub outputs: Vec<OutputBlock>,
    /// 本轮是否在读完模型流之前被取消
    pub cancelled: bool,
}

pub struct Agent {
    orchestrator: ActionOrchestrator,
    actions: Vec<Arc<ActionDefinition>>,
    llm: Arc<dyn LlmClient>,
    supervisor: SessionSupervisor,
    trace: Mutex<ResultTrace>,
    system_prompt: String,
}

impl Agent {
    pub(crate) fn new(
        orchestrator: ActionOrchestrator,
        actions: Vec<Arc<ActionDefinition>>,
        llm: Arc<dyn LlmClient>,
        system_prompt: String,
        trace_capacity: usize,
    ) -> Self {
        Self {
            orchestrator,
            actions,
            llm,
            supervisor: SessionSupervisor::new(),
            trace: Mutex::new(ResultTrace::new(trace_capacity)),
            system_prompt,
        }
    }

    pub fn orchestrator(&self) -> &ActionOrchestrator {
        &self.orchestrator
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        self.orchestrator.contexts()
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 取消当前轮：排队中的任务不再启动，已越过不可撤销点的任务会跑完
    pub fn cancel_turn(&self) -> bool {
        self.supervisor.cancel_turn()
    }

    pub fn shutdown(&self) {
        tracing::info!("Agent shutting down");
        self.supervisor.cancel();
    }

    /// 尚未回灌给模型的结果（取出即标记 processed）
    pub fn take_unprocessed_results(&self) -> Vec<ActionResult> {
        self.trace.lock().take_unprocessed()
    }

    pub fn trace_len(&self) -> usize {
        self.trace.lock().len()
    }

    /// 执行 on_turn 钩子并构建本轮注册表
    pub async fn prepare_turn(&self, active: &[ActiveContext]) -> Result<TurnScope, AgentError> {
        let cancel = self.supervisor.begin_turn();
        let mut registry = ActionRegistry::new();
        for action in &self.actions {
            registry.register(action.clone());
        }

        for context in active {
            let instance = self
                .contexts()
                .begin_turn(&context.definition, &context.args)
                .await?;
            for action in &context.definition.actions {
                registry.register_bound(
                    action.clone(),
                    ContextBinding {
                        context: context.definition.clone(),
                        key: instance.key.clone(),
                        args: context.args.clone(),
                    },
                );
            }
        }

        if registry.is_empty() {
            tracing::warn!("No actions available for this turn");
        }
        tracing::debug!(actions = ?registry.action_names(), "Turn registry built");

        Ok(TurnScope {
            registry: Arc::new(registry),
            cancel,
        })
    }

    pub async fn run_turn<S>(&self, active: &[ActiveContext], stream: S) -> Result<TurnOutcome, AgentError>
    where
        S: Stream<Item = Result<String, String>> + Unpin,
    {
        let turn = self.prepare_turn(active).await?;
        self.execute_stream(&turn, stream).await
    }

    /// 组装 prompt（系统提示 + 可用动作 + 上轮未回灌的结果 + 用户输入），调用模型并执行本轮
    pub async fn respond(&self, active: &[ActiveContext], input: &str) -> Result<TurnOutcome, AgentError> {
        let turn = self.prepare_turn(active).await?;

        let mut messages = vec![Message::system(format!(
            "{}\n\n## Available actions\n```json\n{}\n```",
            self.system_prompt,
            turn.registry.to_schema_json()
        ))];
        let pending = self.take_unprocessed_results();
        if !pending.is_empty() {
            messages.push(Message::system(format!(
                "## Action results\n{}",
                ResultTrace::render(&pending)
            )));
        }
        messages.push(Message::user(input));

        let stream = self
            .llm
            .complete_stream(&messages)
            .await
            .map_err(AgentError::Llm)?;
        self.execute_stream(&turn, stream).await
    }

    pub async fn execute_stream<S>(&self, turn: &TurnScope, mut stream: S) -> Result<TurnOutcome, AgentError>
    where
        S: Stream<Item = Result<String, String>> + Unpin,
    {
        let mut interpreter = StreamInterpreter::new();
        let mut outcome = TurnOutcome::default();
        let mut dispatched = Vec::new();

        while let Some(chunk) = stream.next().await {
            if turn.cancel.is_cancelled() {
                tracing::warn!("Turn cancelled; remaining model output ignored");
                outcome.cancelled = true;
                break;
            }
            match chunk {
                Ok(text) => {
                    for event in interpreter.push(&text) {
                        self.on_event(event, turn, &mut outcome, &mut dispatched);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Model stream failed; ending turn early");
                    break;
                }
            }
        }
        for event in interpreter.finish() {
            self.on_event(event, turn, &mut outcome, &mut dispatched);
        }

        for call in dispatched {
            match call.settle().await {
                Ok(result) => outcome.results.push(result),
                Err(err) => {
                    tracing::error!(error = %err, "Turn aborted");
                    turn.cancel.cancel();
                    return Err(err);
                }
            }
        }

        self.trace.lock().extend(outcome.results.iter().cloned());
        tracing::info!(
            results = outcome.results.len(),
            outputs = outcome.outputs.len(),
            cancelled = outcome.cancelled,
            "Turn finished"
        );
        Ok(outcome)
    }

    fn on_event(
        &self,
        event: StreamEvent,
        turn: &TurnScope,
        outcome: &mut TurnOutcome,
        dispatched: &mut Vec<DispatchedCall>,
    ) {
        match event {
            StreamEvent::TextDelta { text } => outcome.text.push_str(&text),
            StreamEvent::OutputCallDetected {
                output_type,
                content,
                params,
            } => outcome.outputs.push(OutputBlock {
                output_type,
                content,
                params,
            }),
            StreamEvent::StreamEnd => tracing::debug!("Model stream ended"),
            event @ StreamEvent::ActionCallDetected { .. } => {
                if let Some(call) = event.into_action_call() {
                    tracing::debug!(action = %call.name, call_id = %call.id, "Action call detected");
                    dispatched.push(self.orchestrator.dispatch(call, turn));
                }
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("orchestrator", &self.orchestrator)
            .field("actions", &self.actions.len())
            .finish_non_exhaustive()
    }
}
