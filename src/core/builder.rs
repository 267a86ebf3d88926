//! Agent 构建器：统一的 Agent 初始化逻辑
//!
//! 准入控制器、任务执行器、上下文管理器都在这里按配置构建一次，显式注入编排器，
//! 不存在全局单例或惰性挂载的引擎。

use std::path::PathBuf;
use std::sync::Arc;

use crate::actions::ActionDefinition;
use crate::admission::{AdmissionController, AdmissionPolicy};
use crate::agent::Agent;
use crate::config::AppConfig;
use crate::core::orchestrator::ActionOrchestrator;
use crate::core::task_runner::TaskRunner;
use crate::llm::{LlmClient, MockLlmClient};
use crate::memory::{ContextManager, MemoryStore};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Hive, an assistant that acts through actions. \
Invoke an action with <action name=\"...\" contextKey=\"...\">arguments</action>; \
put user-facing content in <output type=\"text\">...</output>.";

/// 对话轨迹默认保留的结果条数
const DEFAULT_TRACE_CAPACITY: usize = 200;

/// Agent 构建器：统一配置和初始化 Agent 的各个组件
pub struct AgentBuilder {
    config: AppConfig,
    actions: Vec<Arc<ActionDefinition>>,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn MemoryStore>>,
    system_prompt: String,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            actions: Vec::new(),
            llm: None,
            store: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// 注册 Agent 级动作（不绑定上下文）
    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 覆盖配置中的存储选择（测试常用）
    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// 从文件加载系统提示词，找不到时保留默认值
    pub fn with_system_prompt_from_file(mut self) -> Self {
        if let Some(prompt) = ["config/prompts/system.md", "../config/prompts/system.md"]
            .into_iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
        {
            self.system_prompt = prompt;
        }
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_components(&self) -> AgentComponents {
        let contexts = match &self.store {
            Some(store) => ContextManager::new(store.clone(), self.config.memory.cache_capacity),
            None => ContextManager::from_config(&self.config.memory),
        };
        AgentComponents {
            admission: Arc::new(AdmissionController::new(AdmissionPolicy::from(
                &self.config.admission,
            ))),
            runner: TaskRunner::from_config(&self.config.runner),
            contexts: Arc::new(contexts),
        }
    }

    pub fn build(self) -> Agent {
        let components = self.build_components();
        let llm = self.llm.unwrap_or_else(|| {
            tracing::warn!("No LLM client configured, using Mock LLM");
            Arc::new(MockLlmClient::new()) as Arc<dyn LlmClient>
        });
        tracing::info!(
            app = self.config.app.name.as_deref().unwrap_or("hive"),
            max_concurrency = self.config.runner.max_concurrency,
            actions = self.actions.len(),
            "Agent built"
        );
        Agent::new(
            components.into_orchestrator(),
            self.actions,
            llm,
            self.system_prompt,
            DEFAULT_TRACE_CAPACITY,
        )
    }
}

/// 预构建的执行核心组件，可被多个 Agent 共享
#[derive(Debug, Clone)]
pub struct AgentComponents {
    pub admission: Arc<AdmissionController>,
    pub runner: TaskRunner,
    pub contexts: Arc<ContextManager>,
}

impl AgentComponents {
    pub fn into_orchestrator(self) -> ActionOrchestrator {
        ActionOrchestrator::new(self.admission, self.runner, self.contexts)
    }
}

/// 便捷函数：从默认路径加载配置并创建 AgentBuilder
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    AgentBuilder::new(config).with_system_prompt_from_file()
}
