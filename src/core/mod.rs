//! 核心编排层：错误与恢复、调用状态机、会话监管、任务执行器、调用编排、构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_runner;

pub use builder::{create_agent_builder, AgentBuilder, AgentComponents};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{ActionOrchestrator, DispatchedCall, TurnScope};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{validate_transition, CallPhase, CallTracker};
pub use task_runner::{CancelScope, EnqueueOptions, RetryPolicy, TaskHandle, TaskOutcome, TaskRunner};
