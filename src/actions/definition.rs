//! 动作定义
//!
//! 所有动作处理器实现 ActionHandler（异步 handle），由 ActionDefinition 携带参数 Schema、
//! 调用格式、重试策略、队列键、结果格式化与成功钩子等元数据。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::{ActionCall, ActionResult, ArgumentSchema, CallFormat};
use crate::core::task_runner::{CancelScope, RetryPolicy};
use crate::core::AgentError;
use crate::memory::ContextInstance;

/// 动作处理器：args 为已校验的参数，ctx 持有上下文实例的工作副本
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, args: Value, ctx: &mut ActionContext) -> Result<Value, AgentError>;
}

pub type ParserFn = Arc<dyn Fn(&ActionCall) -> Result<Value, String> + Send + Sync>;
pub type QueueKeyFn = Arc<dyn Fn(&ActionCall, &Value) -> Option<String> + Send + Sync>;
pub type FormatterFn = Arc<dyn Fn(&ActionResult) -> String + Send + Sync>;
pub type SuccessHook = Arc<dyn Fn(&ActionResult, Option<&ContextInstance>) + Send + Sync>;

/// 处理器每次尝试拿到的执行上下文
///
/// `instance` 是本次尝试独占的副本：成功后才整体提交，失败则丢弃，
/// 因此处理器失败不会留下半写入的记忆。
pub struct ActionContext {
    pub call: ActionCall,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub instance: Option<ContextInstance>,
    scope: CancelScope,
}

impl ActionContext {
    pub fn new(
        call: ActionCall,
        attempt: u32,
        instance: Option<ContextInstance>,
        scope: CancelScope,
    ) -> Self {
        Self {
            call,
            attempt,
            instance,
            scope,
        }
    }

    pub fn memory(&self) -> Option<&Value> {
        self.instance.as_ref().map(|i| &i.memory)
    }

    pub fn memory_mut(&mut self) -> Option<&mut Value> {
        self.instance.as_mut().map(|i| &mut i.memory)
    }

    /// 安全点：已取消且未越过不可撤销点时返回 Cancelled
    pub fn checkpoint(&self) -> Result<(), AgentError> {
        self.scope.checkpoint()
    }

    /// 即将提交不可撤销的外部副作用；此后取消只作参考，任务会跑完
    pub fn mark_irrevocable(&self) {
        self.scope.mark_irrevocable();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }
}

/// 已注册的动作
#[derive(Clone)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub schema: ArgumentSchema,
    pub format: CallFormat,
    pub handler: Arc<dyn ActionHandler>,
    pub retry: Option<RetryPolicy>,
    pub queue_key: Option<QueueKeyFn>,
    pub formatter: Option<FormatterFn>,
    pub on_success: Option<SuccessHook>,
    pub parser: Option<ParserFn>,
    /// 幂等：窗口内相同指纹可直接返回缓存结果
    pub cacheable: bool,
    /// 非幂等且敏感：同名不同参的近期调用需要确认
    pub sensitive: bool,
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema: ArgumentSchema::empty(),
            format: CallFormat::default(),
            handler: Arc::new(handler),
            retry: None,
            queue_key: None,
            formatter: None,
            on_success: None,
            parser: None,
            cacheable: false,
            sensitive: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: ArgumentSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_format(mut self, format: CallFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_queue_key(
        mut self,
        f: impl Fn(&ActionCall, &Value) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.queue_key = Some(Arc::new(f));
        self
    }

    pub fn with_formatter(
        mut self,
        f: impl Fn(&ActionResult) -> String + Send + Sync + 'static,
    ) -> Self {
        self.formatter = Some(Arc::new(f));
        self
    }

    pub fn on_success(
        mut self,
        f: impl Fn(&ActionResult, Option<&ContextInstance>) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn with_parser(
        mut self,
        f: impl Fn(&ActionCall) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.parser = Some(Arc::new(f));
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// 队列键：自定义函数优先，否则取调用的 contextKey（无则走全局 lane）。
    /// 解析到绑定动作的调用在进入这里之前已由编排器补齐 contextKey
    pub fn queue_key_for(&self, call: &ActionCall, args: &Value) -> Option<String> {
        match &self.queue_key {
            Some(f) => f(call, args),
            None => call.context_key().map(str::to_string),
        }
    }
}

impl fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("retry", &self.retry)
            .field("cacheable", &self.cacheable)
            .field("sensitive", &self.sensitive)
            .finish_non_exhaustive()
    }
}
