//! The host-code boundary (§4.G "`ts(...)` blocks"). The interpreter never
//! parses or runs the host language itself — it hands `(params,
//! param_values, body)` to whatever [`HostEvaluator`] the embedder wired up
//! and validates the result against the declaring slot's type, the same
//! "abstract over the concrete backend" shape as [`crate::ai::AiProvider`]
//! and `LlmClient`.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFailureKind {
    /// The host body itself failed to parse/compile.
    Compile,
    /// The host body ran and raised/threw.
    Runtime,
}

#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct HostFailure {
    pub kind: HostFailureKind,
    pub message: String,
    pub stack: Option<String>,
}

impl HostFailure {
    pub fn compile(message: impl Into<String>) -> Self {
        Self {
            kind: HostFailureKind::Compile,
            message: message.into(),
            stack: None,
        }
    }

    pub fn runtime(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            kind: HostFailureKind::Runtime,
            message: message.into(),
            stack,
        }
    }
}

/// One call into host code: bind `params[i]` to `param_values[i]` and run
/// `body`, returning whatever JSON value the host produced.
#[async_trait]
pub trait HostEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        params: &[String],
        param_values: &[JsonValue],
        body: &str,
    ) -> Result<JsonValue, HostFailure>;
}

/// The default evaluator when no embedder-provided backend is wired: every
/// `ts(...)` block fails with a clear compile error rather than silently
/// no-opping. A real embedding swaps this for a V8/QuickJS/Deno-backed one.
pub struct UnconfiguredHostEvaluator;

#[async_trait]
impl HostEvaluator for UnconfiguredHostEvaluator {
    async fn evaluate(
        &self,
        _params: &[String],
        _param_values: &[JsonValue],
        _body: &str,
    ) -> Result<JsonValue, HostFailure> {
        Err(HostFailure::compile(
            "no host evaluator configured: ts(...) blocks require a HostEvaluator",
        ))
    }
}
