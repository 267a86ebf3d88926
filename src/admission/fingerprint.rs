//! 调用指纹：动作名 + 规范化参数 + contextKey 的 SHA-256

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(action: &str, args: &Value, context_key: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(action.as_bytes());
        hasher.update([0u8]);
        // 无 contextKey 与空字符串 key 是两个不同的作用域
        match context_key {
            Some(key) => {
                hasher.update(b"k");
                hasher.update(key.as_bytes());
            }
            None => hasher.update(b"-"),
        }
        hasher.update([0u8]);
        hash_canonical(args, &mut hasher);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 日志里只显示前 12 位
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// 对象键排序、字符串两端空白去掉后再写入哈希
fn hash_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"d");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.trim().len() as u64).to_le_bytes());
            hasher.update(s.trim().as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_canonical(&map[key], hasher);
            }
            hasher.update(b"}");
        }
    }
}
