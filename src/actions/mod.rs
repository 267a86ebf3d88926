//! 动作层：调用与结果类型、参数 Schema、动作定义、注册表解析、调用内容解析、内置动作

pub mod builtin;
pub mod definition;
pub mod parser;
pub mod registry;
pub mod schema;
pub mod types;

pub use definition::{ActionContext, ActionDefinition, ActionHandler};
pub use parser::parse_call;
pub use registry::{ActionRegistry, ContextBinding, RegisteredAction};
pub use schema::{ArgumentSchema, CallFormat};
pub use types::{ActionCall, ActionResult, CallParams};
