//! 调用内容解析
//!
//! 三条路径：动作自带的解析函数 / 按 Schema 的结构化解析（XML 标签或 JSON 对象）/
//! 单字符串 Schema 直接透传。原始内容总是先 trim；任何失败都包装为 Parsing 错误，不做默认值替换。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::actions::schema::declared_type;
use crate::actions::{ActionCall, ActionDefinition, ArgumentSchema, CallFormat};
use crate::core::AgentError;

static ATTR_RE: OnceLock<Regex> = OnceLock::new();

/// 解析标签属性 `key="value"`（值做 XML 实体反转义）
pub(crate) fn parse_attributes(s: &str) -> Vec<(String, String)> {
    let re = ATTR_RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w\-:.]*)\s*=\s*"([^"]*)""#).expect("attribute pattern")
    });
    re.captures_iter(s)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

/// 开标签结束的 `>` 位置；双引号或单引号内的 `>` 属于属性值，跳过
pub(crate) fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

pub(crate) fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// 将调用内容解析为已校验的参数
pub fn parse_call(call: &ActionCall, action: &ActionDefinition) -> Result<Value, AgentError> {
    let fail = |message: String| AgentError::Parsing {
        message,
        call: Box::new(call.clone()),
    };

    if let Some(parser) = &action.parser {
        return parser(call).map_err(fail);
    }

    let content = call.content.trim();
    if action.schema.is_text() {
        return Ok(Value::String(content.to_string()));
    }

    let value = if content.is_empty() {
        Value::Object(Map::new())
    } else {
        match action.format {
            CallFormat::Json => parse_json_object(content).map_err(fail)?,
            CallFormat::Xml => parse_xml_object(content, &action.schema).map_err(fail)?,
        }
    };

    action.schema.validate(&value).map_err(fail)?;
    Ok(value)
}

fn parse_json_object(content: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))?;
    if !value.is_object() {
        return Err(format!("expected a JSON object, got {value}"));
    }
    Ok(value)
}

/// 一个 XML 元素：标签名、属性、内部原文
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    body: String,
}

/// 顶层元素序列；元素外出现非空白文本视为错误
fn scan_elements(input: &str) -> Result<Vec<Element>, String> {
    let mut elements = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        if !rest.starts_with('<') {
            let preview: String = rest.chars().take(40).collect();
            return Err(format!("unexpected text outside tags: '{preview}'"));
        }
        let close = find_tag_end(rest).ok_or_else(|| "unterminated tag".to_string())?;
        let open = &rest[1..close];
        let self_closing = open.ends_with('/');
        let open = open.trim_end_matches('/');
        let name_end = open
            .find(|c: char| c.is_whitespace())
            .unwrap_or(open.len());
        let name = &open[..name_end];
        if name.is_empty() || name.starts_with('/') {
            return Err(format!("malformed tag '<{open}>'"));
        }
        let attrs = parse_attributes(&open[name_end..]);
        rest = &rest[close + 1..];

        let body = if self_closing {
            String::new()
        } else {
            let end_tag = format!("</{name}>");
            let end = rest
                .find(&end_tag)
                .ok_or_else(|| format!("missing closing tag {end_tag}"))?;
            let body = rest[..end].to_string();
            rest = &rest[end + end_tag.len()..];
            body
        };

        elements.push(Element {
            name: name.to_string(),
            attrs,
            body,
        });
        rest = rest.trim_start();
    }

    Ok(elements)
}

/// 叶子值：含子元素则递归为对象，否则为反转义后的文本
fn element_value(element: &Element) -> Result<Value, String> {
    let body = element.body.trim();
    if body.starts_with('<') {
        if let Ok(children) = scan_elements(body) {
            return Ok(Value::Object(collect_fields(children)?));
        }
    }
    Ok(Value::String(unescape(body)))
}

/// 同名元素重复出现时收集为数组
fn collect_fields(elements: Vec<Element>) -> Result<Map<String, Value>, String> {
    let mut fields = Map::new();
    for element in elements {
        let value = element_value(&element)?;
        match fields.get_mut(&element.name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                fields.insert(element.name, value);
            }
        }
    }
    Ok(fields)
}

fn parse_xml_object(content: &str, schema: &ArgumentSchema) -> Result<Value, String> {
    let mut elements = scan_elements(content)?;

    // 单个带属性的空元素：属性即字段（<args title="..." priority="2" />）
    let fields = if elements.len() == 1
        && !elements[0].attrs.is_empty()
        && elements[0].body.trim().is_empty()
    {
        let element = elements.remove(0);
        element
            .attrs
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect()
    } else {
        collect_fields(elements)?
    };

    let mut coerced = Map::new();
    for (key, value) in fields {
        let value = coerce(&key, value, schema.property(&key))?;
        coerced.insert(key, value);
    }
    Ok(Value::Object(coerced))
}

/// 按字段 Schema 转换 XML 值。数组字段只出现一次时包成单元素数组，元素按 items 的类型转换
fn coerce(field: &str, value: Value, property: Option<&Value>) -> Result<Value, String> {
    let declared = property.and_then(declared_type);
    if declared == Some("array") {
        let items = property.and_then(|p| p.get("items"));
        let values = match value {
            Value::Array(values) => values,
            Value::String(text) if text.trim_start().starts_with('[') => {
                return serde_json::from_str(text.trim())
                    .map_err(|_| format!("field '{field}': '{}' is not a valid array", text.trim()));
            }
            single => vec![single],
        };
        return values
            .into_iter()
            .map(|v| coerce(field, v, items))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }

    let Value::String(text) = value else {
        return Ok(value);
    };
    let text = text.trim();
    let bad = |kind: &str| format!("field '{field}': '{text}' is not a valid {kind}");
    match declared {
        Some("integer") => text
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| bad("integer")),
        Some("number") => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| bad("number")),
        Some("boolean") => match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(bad("boolean")),
        },
        Some("object") => serde_json::from_str(text).map_err(|_| bad("object")),
        _ => Ok(Value::String(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionContext, ActionHandler};
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl ActionHandler for Noop {
        async fn handle(&self, _args: Value, _ctx: &mut ActionContext) -> Result<Value, AgentError> {
            Ok(Value::Null)
        }
    }

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct AddTask {
        title: String,
        priority: Option<i64>,
        done: Option<bool>,
    }

    fn add_task(format: CallFormat) -> ActionDefinition {
        ActionDefinition::new("add-task", Noop)
            .with_schema(ArgumentSchema::of::<AddTask>())
            .with_format(format)
    }

    #[test]
    fn test_parse_xml_children_with_coercion() {
        let call = ActionCall::new(
            "add-task",
            "\n  <title>Buy milk &amp; eggs</title>\n  <priority>2</priority><done>false</done>\n",
        );
        let args = parse_call(&call, &add_task(CallFormat::Xml)).unwrap();
        assert_eq!(
            args,
            json!({ "title": "Buy milk & eggs", "priority": 2, "done": false })
        );
    }

    #[test]
    fn test_parse_xml_attributes_form() {
        let call = ActionCall::new("add-task", r#"<args title="Call mom" priority="1" />"#);
        let args = parse_call(&call, &add_task(CallFormat::Xml)).unwrap();
        assert_eq!(args, json!({ "title": "Call mom", "priority": 1 }));
    }

    #[test]
    fn test_parse_xml_bad_integer_is_error() {
        let call = ActionCall::new("add-task", "<title>x</title><priority>high</priority>");
        let err = parse_call(&call, &add_task(CallFormat::Xml)).unwrap_err();
        match err {
            AgentError::Parsing { message, call: original } => {
                assert!(message.contains("priority"));
                assert_eq!(original.id, call.id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_json_object() {
        let call = ActionCall::new("add-task", r#"  {"title": "Write report", "priority": 3}  "#);
        let args = parse_call(&call, &add_task(CallFormat::Json)).unwrap();
        assert_eq!(args["priority"], 3);
    }

    #[test]
    fn test_parse_json_schema_violation_is_error() {
        let call = ActionCall::new("add-task", r#"{"priority": 3}"#);
        assert!(matches!(
            parse_call(&call, &add_task(CallFormat::Json)),
            Err(AgentError::Parsing { .. })
        ));
    }

    #[test]
    fn test_parse_json_rejects_non_object() {
        let call = ActionCall::new("add-task", "[1, 2]");
        assert!(parse_call(&call, &add_task(CallFormat::Json)).is_err());
    }

    #[test]
    fn test_empty_content_is_not_defaulted() {
        // 空内容解析为空对象，仍要经过 required 校验
        let call = ActionCall::new("add-task", "   ");
        assert!(parse_call(&call, &add_task(CallFormat::Xml)).is_err());
    }

    #[test]
    fn test_text_schema_passthrough_trims() {
        let action = ActionDefinition::new("say", Noop).with_schema(ArgumentSchema::Text);
        let call = ActionCall::new("say", "  hello there \n");
        assert_eq!(parse_call(&call, &action).unwrap(), json!("hello there"));
    }

    #[test]
    fn test_custom_parser_wins() {
        let action = ActionDefinition::new("csv", Noop).with_parser(|call| {
            Ok(Value::Array(
                call.content.trim().split(',').map(|s| json!(s)).collect(),
            ))
        });
        let call = ActionCall::new("csv", "a,b");
        assert_eq!(parse_call(&call, &action).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_custom_parser_error_wrapped() {
        let action =
            ActionDefinition::new("csv", Noop).with_parser(|_| Err("bad row".to_string()));
        let call = ActionCall::new("csv", "a,b");
        assert!(matches!(
            parse_call(&call, &action),
            Err(AgentError::Parsing { ref message, .. }) if message == "bad row"
        ));
    }

    #[test]
    fn test_repeated_tags_become_array() {
        let schema = ArgumentSchema::object(json!({
            "type": "object",
            "properties": { "tag": { "type": "array" } }
        }));
        let action = ActionDefinition::new("tag", Noop).with_schema(schema);
        let call = ActionCall::new("tag", "<tag>a</tag><tag>b</tag>");
        assert_eq!(parse_call(&call, &action).unwrap(), json!({ "tag": ["a", "b"] }));
    }

    #[test]
    fn test_single_tag_for_array_field_becomes_one_item_list() {
        let schema = ArgumentSchema::object(json!({
            "type": "object",
            "properties": { "tag": { "type": "array" } }
        }));
        let action = ActionDefinition::new("tag", Noop).with_schema(schema);
        let call = ActionCall::new("tag", "<tag>a</tag>");
        assert_eq!(parse_call(&call, &action).unwrap(), json!({ "tag": ["a"] }));
    }

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Scores {
        values: Vec<i64>,
        labels: Option<Vec<String>>,
    }

    #[test]
    fn test_array_items_coerced_by_item_type() {
        let action = ActionDefinition::new("scores", Noop).with_schema(ArgumentSchema::of::<Scores>());
        let one = ActionCall::new("scores", "<values>7</values>");
        assert_eq!(parse_call(&one, &action).unwrap(), json!({ "values": [7] }));

        let many = ActionCall::new("scores", "<values>1</values><values>2</values><labels>x</labels>");
        assert_eq!(
            parse_call(&many, &action).unwrap(),
            json!({ "values": [1, 2], "labels": ["x"] })
        );

        let inline = ActionCall::new("scores", "<values>[3, 4]</values>");
        assert_eq!(parse_call(&inline, &action).unwrap(), json!({ "values": [3, 4] }));

        let bad = ActionCall::new("scores", "<values>1</values><values>two</values>");
        assert!(matches!(
            parse_call(&bad, &action),
            Err(AgentError::Parsing { .. })
        ));
    }

    #[test]
    fn test_tag_end_skips_quoted_values() {
        assert_eq!(find_tag_end(r#"<a note="x>y">"#), Some(13));
        assert_eq!(find_tag_end("<a note='>'>"), Some(11));
        assert_eq!(find_tag_end(r#"<a note="open"#), None);
    }

    #[test]
    fn test_attribute_value_with_gt_in_attributes_form() {
        let call = ActionCall::new("add-task", r#"<args title="a > b" priority="1" />"#);
        let args = parse_call(&call, &add_task(CallFormat::Xml)).unwrap();
        assert_eq!(args, json!({ "title": "a > b", "priority": 1 }));
    }

    #[test]
    fn test_parse_attributes_unescapes() {
        let attrs = parse_attributes(r#" name="add-task" note="a &lt; b""#);
        assert_eq!(attrs[0], ("name".to_string(), "add-task".to_string()));
        assert_eq!(attrs[1].1, "a < b");
    }
}
