//! 流式响应解析：模型输出 -> 文本 / 动作调用 / 输出调用事件

pub mod events;
pub mod interpreter;

pub use events::StreamEvent;
pub use interpreter::StreamInterpreter;
