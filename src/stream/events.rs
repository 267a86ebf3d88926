//! 流式解析事件：文本片段、动作调用、输出调用、流结束

use serde::Serialize;

use crate::actions::{ActionCall, CallParams};

/// 一次生成过程中按顺序产生的事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 标签之外的普通文本
    TextDelta { text: String },
    /// `<action name="..">..</action>`
    ActionCallDetected {
        name: String,
        content: String,
        params: CallParams,
    },
    /// `<output type="..">..</output>`
    OutputCallDetected {
        output_type: String,
        content: String,
        params: CallParams,
    },
    StreamEnd,
}

impl StreamEvent {
    /// 动作调用事件转为 ActionCall（分配新的调用 id）
    pub fn into_action_call(self) -> Option<ActionCall> {
        match self {
            StreamEvent::ActionCallDetected {
                name,
                content,
                params,
            } => Some(ActionCall::new(name, content).with_params(params)),
            _ => None,
        }
    }
}
