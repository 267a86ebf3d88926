//! Hive - Agent 动作执行核心
//!
//! 模块划分：
//! - **actions**: 动作调用 / 结果类型、参数 Schema、注册表解析、调用内容解析、内置动作
//! - **admission**: 调用指纹与准入 / 去重控制
//! - **agent**: Agent 运行时（一轮的完整流程）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、调用状态机、会话监管、任务执行器、编排、构建器
//! - **llm**: LLM 客户端抽象与脚本化 Mock
//! - **memory**: 上下文定义 / 实例、缓存与持久化、结果轨迹
//! - **stream**: 模型输出流解析

pub mod actions;
pub mod admission;
pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod stream;

pub use agent::{ActiveContext, Agent, OutputBlock, TurnOutcome};
pub use core::{AgentBuilder, AgentError};
