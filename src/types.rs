use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorCode {
    NotFound,
    InvalidArgument,
    Unavailable,
    TransportUnavailable,
    ExecutionError,
    Timeout,
    UnsupportedTool,
    WrongContext,
    Internal,
}

impl ToolErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::Unavailable => "unavailable",
            Self::TransportUnavailable => "transport_unavailable",
            Self::ExecutionError => "execution_error",
            Self::Timeout => "timeout",
            Self::UnsupportedTool => "unsupported_tool",
            Self::WrongContext => "wrong_context",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain failure of a single tool call. Never crosses the protocol boundary
/// as an error; [`ToolError::into_result`] turns it into a tagged result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    /// Entity the error refers to. A named `not_found` gets its own
    /// `not_found` status; unnamed ones are plain errors.
    pub name: Option<String>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            name: None,
        }
    }

    pub fn not_found(kind: &str, name: &str) -> Self {
        Self {
            code: ToolErrorCode::NotFound,
            message: format!("{kind} '{name}' not found"),
            name: Some(name.to_owned()),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InvalidArgument, message)
    }

    pub fn into_result(self) -> Value {
        match (self.code, &self.name) {
            (ToolErrorCode::NotFound, Some(_)) => json!({
                "status": "not_found",
                "code": self.code.as_str(),
                "name": self.name,
                "message": self.message,
            }),
            _ => json!({
                "status": "error",
                "code": self.code.as_str(),
                "message": self.message,
            }),
        }
    }
}

pub type ToolOutcome<T> = Result<T, ToolError>;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(alias = "tool")]
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub params: Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

pub fn result_status(result: &Value) -> &str {
    result
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

/// Accepts a missing/null params value as `{}` and rejects non-objects.
pub fn normalize_params(params: Value) -> ToolOutcome<Map<String, Value>> {
    match params {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(ToolError::invalid(format!(
            "tool params must be an object, got {}",
            json_kind(&other)
        ))),
    }
}

pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn first_string_arg(root: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = root.get(*key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    None
}

/// Booleans arrive from some clients as strings; accept the usual spellings.
pub fn first_bool_arg(root: &Value, keys: &[&str]) -> ToolOutcome<Option<bool>> {
    for key in keys {
        match root.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Bool(value)) => return Ok(Some(*value)),
            Some(Value::Number(value)) => return Ok(Some(value.as_f64() != Some(0.0))),
            Some(Value::String(value)) => {
                return match value.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(Some(true)),
                    "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
                    other => Err(ToolError::invalid(format!(
                        "parameter `{key}` expects a boolean, got '{other}'"
                    ))),
                };
            }
            Some(other) => {
                return Err(ToolError::invalid(format!(
                    "parameter `{key}` expects a boolean, got {}",
                    json_kind(other)
                )))
            }
        }
    }
    Ok(None)
}

pub fn first_f64_arg(root: &Value, keys: &[&str]) -> ToolOutcome<Option<f64>> {
    for key in keys {
        match root.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(value)) => return Ok(value.as_f64()),
            Some(Value::String(value)) => {
                return value.trim().parse::<f64>().map(Some).map_err(|_| {
                    ToolError::invalid(format!("parameter `{key}` expects a number"))
                })
            }
            Some(other) => {
                return Err(ToolError::invalid(format!(
                    "parameter `{key}` expects a number, got {}",
                    json_kind(other)
                )))
            }
        }
    }
    Ok(None)
}

pub fn first_i64_arg(root: &Value, keys: &[&str]) -> ToolOutcome<Option<i64>> {
    for key in keys {
        match root.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(value)) => {
                if let Some(int) = value.as_i64() {
                    return Ok(Some(int));
                }
                return match value.as_f64() {
                    Some(float) if float.fract() == 0.0 => Ok(Some(float as i64)),
                    _ => Err(ToolError::invalid(format!(
                        "parameter `{key}` expects an integer"
                    ))),
                };
            }
            Some(Value::String(value)) => {
                return value.trim().parse::<i64>().map(Some).map_err(|_| {
                    ToolError::invalid(format!("parameter `{key}` expects an integer"))
                })
            }
            Some(other) => {
                return Err(ToolError::invalid(format!(
                    "parameter `{key}` expects an integer, got {}",
                    json_kind(other)
                )))
            }
        }
    }
    Ok(None)
}

pub fn first_f64_list_arg(root: &Value, keys: &[&str]) -> ToolOutcome<Option<Vec<f64>>> {
    for key in keys {
        match root.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .map(|item| {
                        item.as_f64().ok_or_else(|| {
                            ToolError::invalid(format!("parameter `{key}` expects numbers"))
                        })
                    })
                    .collect::<ToolOutcome<Vec<_>>>()
                    .map(Some)
            }
            Some(Value::Number(value)) => return Ok(value.as_f64().map(|v| vec![v])),
            Some(other) => {
                return Err(ToolError::invalid(format!(
                    "parameter `{key}` expects a list of numbers, got {}",
                    json_kind(other)
                )))
            }
        }
    }
    Ok(None)
}

pub fn required_string_arg(root: &Value, keys: &[&str], label: &str) -> ToolOutcome<String> {
    first_string_arg(root, keys)
        .ok_or_else(|| ToolError::invalid(format!("missing required parameter `{label}`")))
}
