//! The value domain (§3 "Values") and type compatibility (§3 "Types and
//! compatibility", §4.A).

mod registry;

pub use registry::{build_model_record, TypeDescriptor, TypeRegistry};

use serde_json::{Map, Value as JsonValue};
use std::fmt;

use crate::ai::ToolCallRecord;
use crate::interp::ast::TypeAnnotation;

/// A runtime value. Every value carries its Vibe type tag via [`Value::type_tag`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Boolean(bool),
    /// A JSON *object* (arrays are not valid `json` values, per §3).
    Json(Map<String, JsonValue>),
    Array(Vec<Value>),
    Null,
    /// Text tagged as AI-role content; interchangeable with `Text` for storage.
    Prompt(String),
    Model(ModelRecord),
    Tool(ToolHandle),
    AiResult(AiResultValue),
}

/// Model records are opaque to the core: a tagged variant the AI client looks
/// up an executor for by `provider` (§9 "Dynamic dispatch").
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub provider: String,
    pub config: Map<String, JsonValue>,
    pub tools: Vec<String>,
}

/// A `tool` value: a handle into the [`crate::tools::ToolRegistry`] by name,
/// not the executable body itself (bodies are not `Clone`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolHandle {
    pub name: String,
}

/// A text/number/... value augmented with the tool-call history that produced
/// it and an optional error (§3 "Values").
#[derive(Debug, Clone, PartialEq)]
pub struct AiResultValue {
    pub value: Box<Value>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub err: Option<String>,
}

impl Value {
    /// The base Vibe type name for this value (ignoring array nesting; arrays
    /// report `"array"` and the caller inspects elements for element type).
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
            Value::Null => "null",
            Value::Prompt(_) => "prompt",
            Value::Model(_) => "model",
            Value::Tool(_) => "tool",
            Value::AiResult(_) => "ai_result",
        }
    }

    /// Renders this value the way the context formatter does: `JSON.stringify(value)`.
    pub fn to_display_json(&self) -> JsonValue {
        match self {
            Value::Text(s) | Value::Prompt(s) => JsonValue::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Json(m) => JsonValue::Object(m.clone()),
            Value::Array(items) => {
                JsonValue::Array(items.iter().map(Value::to_display_json).collect())
            }
            Value::Null => JsonValue::Null,
            Value::Model(m) => JsonValue::String(format!("<model {}>", m.provider)),
            Value::Tool(t) => JsonValue::String(format!("<tool {}>", t.name)),
            Value::AiResult(r) => r.value.to_display_json(),
        }
    }

    /// Concatenation text used by `contextKind = variable(name)` when the
    /// variable is `text[]`/`json[]` (§4.F): elements joined by a blank line.
    pub fn as_context_chunks(&self) -> Vec<String> {
        match self {
            Value::Array(items) => items
                .iter()
                .map(|v| match v {
                    Value::Text(s) | Value::Prompt(s) => s.clone(),
                    other => other.to_display_json().to_string(),
                })
                .collect(),
            Value::Text(s) | Value::Prompt(s) => vec![s.clone()],
            other => vec![other.to_display_json().to_string()],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) | Value::Prompt(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_display_json()),
        }
    }
}

/// Is `annotation` a base type this registry knows, with valid array nesting?
pub fn is_valid_type(annotation: &TypeAnnotation, registry: &TypeRegistry) -> bool {
    registry.contains(&annotation.base)
}
