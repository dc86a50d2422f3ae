//! 类型化的动作访问器
//!
//! 所有 getter 都带默认值回退：字段缺失或类型不符时返回零值，
//! 数字字段允许字符串形式（模型常把 `"3"` 写成字符串）。

use serde_json::{Map, Value};

use crate::action::scanner::DISCRIMINATOR;
use crate::core::{OrchestratorError, Result};

/// 从模型输出中提取到的一个动作
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    name: String,
    fields: Map<String, Value>,
}

impl Action {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(OrchestratorError::JsonParseError(
                "action must be a JSON object".to_string(),
            ));
        };
        let name = fields
            .get(DISCRIMINATOR)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self { name, fields })
    }

    /// 判别字段原值
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 名称是否属于给定集合（忽略大小写）
    pub fn is(&self, names: &[&str]) -> bool {
        names.iter().any(|n| n.eq_ignore_ascii_case(&self.name))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.get(key).map(|v| !v.is_null()).unwrap_or(false)
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get_string_or(key, "")
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        match self.fields.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// 依次尝试多个键，返回第一个非空字符串
    pub fn get_first_string(&self, keys: &[&str]) -> String {
        keys.iter()
            .map(|k| self.get_string(k))
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.get_int_or(key, 0)
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        match self.fields.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_float(&self, key: &str) -> f64 {
        self.get_float_or(key, 0.0)
    }

    pub fn get_float_or(&self, key: &str, default: f64) -> f64 {
        match self.fields.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.fields.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(false),
            _ => false,
        }
    }

    pub fn get_object(&self, key: &str) -> Map<String, Value> {
        match self.fields.get(key) {
            Some(Value::Object(m)) => m.clone(),
            // 模型偶尔把对象再序列化成字符串
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(m)) => m,
                _ => Map::new(),
            },
            _ => Map::new(),
        }
    }

    pub fn get_array(&self, key: &str) -> Vec<Value> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn get_object_array(&self, key: &str) -> Vec<Map<String, Value>> {
        self.get_array(key)
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn get_string_array(&self, key: &str) -> Vec<String> {
        self.get_array(key)
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }

    /// 去掉判别字段后的其余字段
    pub fn params(&self) -> Map<String, Value> {
        let mut out = self.fields.clone();
        out.remove(DISCRIMINATOR);
        out
    }
}
