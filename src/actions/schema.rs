//! 动作参数 Schema（schemars 自动生成，jsonschema 校验）
//!
//! 每个动作声明一种调用格式（XML 标签 / JSON 对象）和参数 Schema；
//! 单字符串 Schema 的动作直接透传 trim 后的原始内容。

use std::fmt;
use std::sync::{Arc, OnceLock};

use jsonschema::JSONSchema;
use schemars::{gen::SchemaGenerator, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 模型书写调用内容的约定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallFormat {
    /// `<title>Buy milk</title><priority>2</priority>` 或 `<args title="Buy milk" />`
    #[default]
    Xml,
    /// `{"title": "Buy milk", "priority": 2}`
    Json,
}

/// 参数 Schema
#[derive(Debug, Clone)]
pub enum ArgumentSchema {
    /// 单个字符串标量
    Text,
    /// JSON Schema 描述的对象
    Object(ObjectSchema),
}

type Compiled = Result<Arc<JSONSchema>, String>;

/// 对象 Schema：原始 JSON + 首次校验时编译、之后复用的校验器（克隆间共享）
#[derive(Clone)]
pub struct ObjectSchema {
    schema: Value,
    compiled: Arc<OnceLock<Compiled>>,
}

impl ObjectSchema {
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            compiled: Arc::new(OnceLock::new()),
        }
    }

    pub fn as_json(&self) -> &Value {
        &self.schema
    }

    fn compiled(&self) -> &Compiled {
        self.compiled.get_or_init(|| {
            JSONSchema::compile(&self.schema)
                .map(Arc::new)
                .map_err(|e| format!("invalid schema: {e}"))
        })
    }
}

impl fmt::Debug for ObjectSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSchema")
            .field("schema", &self.schema)
            .field("compiled", &self.compiled.get().is_some())
            .finish()
    }
}

/// 声明的标量类型；`["integer", "null"]` 这类联合类型取第一个非 null 的
pub fn declared_type(schema: &Value) -> Option<&str> {
    match schema.get("type")? {
        Value::String(t) => Some(t.as_str()),
        Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .find(|t| *t != "null"),
        _ => None,
    }
}

impl ArgumentSchema {
    /// 由 Rust 类型生成 Schema
    pub fn of<T: JsonSchema>() -> Self {
        let root = SchemaGenerator::default().into_root_schema_for::<T>();
        let schema = serde_json::to_value(root).unwrap_or_else(|_| json!({ "type": "object" }));
        Self::object(schema)
    }

    /// 手写的 JSON Schema
    pub fn object(schema: Value) -> Self {
        Self::Object(ObjectSchema::new(schema))
    }

    /// 无参数动作：空对象
    pub fn empty() -> Self {
        Self::object(json!({
            "type": "object",
            "properties": {},
            "required": []
        }))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ArgumentSchema::Text)
    }

    /// 字段自身的 Schema
    pub fn property(&self, field: &str) -> Option<&Value> {
        let ArgumentSchema::Object(schema) = self else {
            return None;
        };
        schema.as_json().get("properties")?.get(field)
    }

    /// 字段声明的标量类型（忽略 "null"，用于 XML 叶子值的类型转换）
    pub fn property_type(&self, field: &str) -> Option<&str> {
        self.property(field).and_then(declared_type)
    }

    /// 校验已解析的参数；错误信息合并为一行
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        match self {
            ArgumentSchema::Text => match value {
                Value::String(_) => Ok(()),
                other => Err(format!("expected a string, got {other}")),
            },
            ArgumentSchema::Object(schema) => {
                let compiled = schema.compiled().as_ref().map_err(Clone::clone)?;
                if let Err(errors) = compiled.validate(value) {
                    let msgs: Vec<String> = errors
                        .map(|e| {
                            let path = e.instance_path.to_string();
                            if path.is_empty() {
                                e.to_string()
                            } else {
                                format!("{path}: {e}")
                            }
                        })
                        .collect();
                    return Err(msgs.join("; "));
                }
                Ok(())
            }
        }
    }

    /// 供 prompt 展示的 Schema JSON
    pub fn to_json(&self) -> Value {
        match self {
            ArgumentSchema::Text => json!({ "type": "string" }),
            ArgumentSchema::Object(schema) => schema.as_json().clone(),
        }
    }
}
