//! The AI client boundary (§4.E "AI calls"). Grounded in an `LlmClient`-style
//! trait: one `invoke` entry point returning content plus any requested tool
//! calls, usage alongside. The *loop* that feeds tool results back and
//! re-invokes lives in [`crate::interp`], since each tool dispatch is itself
//! a suspension point (`awaiting_tool`) the driver crosses, not something
//! this module runs synchronously to completion.

pub mod retry;

#[cfg(any(test, feature = "mock-ai"))]
pub mod mock;

#[cfg(feature = "provider-openai")]
pub mod openai;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::interp::ast::TypeAnnotation;
use crate::tools::ToolSpec;
use crate::value::ModelRecord;

/// One request to a model: the prompt, the rendered context text, the tools
/// it may call, and the target type (drives structured-output wrapping).
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub model: ModelRecord,
    pub prompt: String,
    pub context: String,
    pub target_type: Option<TypeAnnotation>,
    pub tools: Vec<ToolSpec>,
}

/// A single tool invocation the model asked for.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

/// What the model produced: either a final answer, or one or more tool
/// calls the caller must resolve and feed back before the model continues.
#[derive(Debug, Clone)]
pub enum AiOutput {
    Message(String),
    ToolCalls(Vec<ToolCallRequest>),
}

#[derive(Debug, Clone, Default)]
pub struct AiUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct AiResponse {
    pub output: AiOutput,
    pub usage: AiUsage,
}

/// A resolved tool call, kept on the eventual `ai_result` value (§3 "Values").
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: JsonValue,
    pub result: Result<JsonValue, String>,
}

/// Failure from the model boundary. `Retryable` drives [`retry::with_retry`];
/// `Fatal` ends the program via `status = failed` immediately.
#[derive(Debug, Error, Clone)]
pub enum AiError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("model returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Fatal(String),
}

impl AiError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::RateLimited(_) | AiError::Transport(_) | AiError::Server(_)
        )
    }
}

/// The model boundary every provider (OpenAI, Anthropic, a test stub, ...)
/// implements. One call in, one response out — no looping, no retry: both
/// are layered on top by [`retry::with_retry`] and by `interp`.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn invoke(&self, request: &AiRequest) -> Result<AiResponse, AiError>;

    /// Resolves an `ask(...)` expression by putting `prompt` to an
    /// interactive user and returning their reply. The default rejects
    /// every `ask` with a fatal error; embeddings with a real user channel
    /// (a REPL, a chat UI) override this.
    async fn ask_user(&self, _prompt: &str) -> Result<String, AiError> {
        Err(AiError::Fatal(
            "this AI provider has no interactive user channel configured for ask(...)".into(),
        ))
    }
}

/// Wraps a non-text/non-json target type in `{"value": T}` so structured
/// output can be requested from providers that only support object schemas
/// (§4.E "Structured output"). `text`/`json`/absent target types pass
/// through unwrapped.
pub fn structured_output_schema(target: Option<&TypeAnnotation>) -> Option<JsonValue> {
    let target = target?;
    if target.array_depth == 0 && matches!(target.base.as_str(), "text" | "json") {
        return None;
    }
    let inner = json_schema_for(target);
    Some(serde_json::json!({
        "type": "object",
        "properties": {"value": inner},
        "required": ["value"],
    }))
}

pub(crate) fn json_schema_for(t: &TypeAnnotation) -> JsonValue {
    if t.array_depth > 0 {
        let inner = json_schema_for(&TypeAnnotation {
            base: t.base.clone(),
            array_depth: t.array_depth - 1,
        });
        return serde_json::json!({"type": "array", "items": inner});
    }
    match t.base.as_str() {
        "number" => serde_json::json!({"type": "number"}),
        "boolean" => serde_json::json!({"type": "boolean"}),
        "json" => serde_json::json!({"type": "object"}),
        "null" => serde_json::json!({"type": "null"}),
        _ => serde_json::json!({"type": "string"}),
    }
}

/// Unwraps a `{"value": T}` structured-output envelope back to `T`, the
/// inverse of [`structured_output_schema`].
pub fn unwrap_structured_output(target: Option<&TypeAnnotation>, raw: JsonValue) -> JsonValue {
    let needs_unwrap = target
        .map(|t| t.array_depth > 0 || !matches!(t.base.as_str(), "text" | "json"))
        .unwrap_or(false);
    if needs_unwrap {
        if let JsonValue::Object(mut map) = raw {
            if let Some(v) = map.remove("value") {
                return v;
            }
            return JsonValue::Object(map);
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_json_targets_pass_through_unwrapped() {
        assert!(structured_output_schema(Some(&TypeAnnotation::scalar("text"))).is_none());
        assert!(structured_output_schema(Some(&TypeAnnotation::scalar("json"))).is_none());
        assert!(structured_output_schema(None).is_none());
    }

    #[test]
    fn number_target_gets_wrapped_and_unwrapped() {
        let schema = structured_output_schema(Some(&TypeAnnotation::scalar("number"))).unwrap();
        assert_eq!(schema["properties"]["value"]["type"], "number");

        let raw = serde_json::json!({"value": 42});
        let unwrapped =
            unwrap_structured_output(Some(&TypeAnnotation::scalar("number")), raw);
        assert_eq!(unwrapped, serde_json::json!(42));
    }
}
