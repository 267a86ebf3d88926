//! 动作调用与动作结果（对外的 JSON 形状与对话轨迹中的记录一致）

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 调用参数：contextKey 限定作用域，其余属性原样保留
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallParams {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// 调用方确认过的重发（confirmed="true"）
    pub fn is_confirmed(&self) -> bool {
        match self.extra.get("confirmed") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// 从模型输出中检测到的一次动作调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCall {
    pub id: String,
    pub name: String,
    /// 原始调用内容（未 trim）
    pub content: String,
    #[serde(default)]
    pub params: CallParams,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl ActionCall {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            content: content.into(),
            params: CallParams::default(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_params(mut self, params: CallParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.params.context_key = Some(key.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.extra.insert(key.into(), value.into());
        self
    }

    pub fn context_key(&self) -> Option<&str> {
        self.params.context_key.as_deref()
    }
}

fn action_result_ref() -> String {
    "action_result".to_string()
}

/// 一次调用的终态结果（成功、失败、缓存、拦截、待确认都会产生一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    #[serde(rename = "ref", default = "action_result_ref")]
    pub kind: String,
    pub id: String,
    pub call_id: String,
    pub data: Value,
    pub name: String,
    pub timestamp: i64,
    /// 是否已经回灌给模型
    #[serde(default)]
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

impl ActionResult {
    pub fn new(call: &ActionCall, data: Value) -> Self {
        Self {
            kind: action_result_ref(),
            id: format!("result_{}", uuid::Uuid::new_v4()),
            call_id: call.id.clone(),
            data,
            name: call.name.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            processed: false,
            formatted: None,
        }
    }

    /// 用缓存结果回应新的调用：数据沿用，id / callId / 时间戳换新
    pub fn reissue_for(&self, call: &ActionCall) -> Self {
        let mut result = Self::new(call, self.data.clone());
        result.formatted = self.formatted.clone();
        result
    }

    /// data 中带 error 字段即视为失败结果
    pub fn is_error(&self) -> bool {
        self.data.get("error").is_some()
    }

    pub fn status(&self) -> Option<&str> {
        self.data.get("status").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_are_unique() {
        let a = ActionCall::new("echo", "hi");
        let b = ActionCall::new("echo", "hi");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_result_wire_shape() {
        let call = ActionCall::new("add-task", "{}").with_context_key("userA");
        let result = ActionResult::new(&call, serde_json::json!({"ok": true}));
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["ref"], "action_result");
        assert_eq!(wire["callId"], call.id.as_str());
        assert_eq!(wire["processed"], false);
        assert!(wire.get("formatted").is_none());
    }

    #[test]
    fn test_call_params_flatten() {
        let json = r#"{"id":"c1","name":"pay","content":"","params":{"contextKey":"u1","confirmed":"true"},"timestamp":1}"#;
        let call: ActionCall = serde_json::from_str(json).unwrap();
        assert_eq!(call.context_key(), Some("u1"));
        assert!(call.params.is_confirmed());
    }

    #[test]
    fn test_reissue_keeps_data() {
        let first = ActionCall::new("add-task", "a");
        let second = ActionCall::new("add-task", "a");
        let cached = ActionResult::new(&first, serde_json::json!({"id": 1}));
        let reissued = cached.reissue_for(&second);
        assert_eq!(reissued.call_id, second.id);
        assert_eq!(reissued.data, cached.data);
        assert_ne!(reissued.id, cached.id);
    }
}
