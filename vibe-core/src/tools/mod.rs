//! Tool registration and dispatch (§4.D "Tools").
//!
//! Grounded in a [`Tool`]-style trait and its lock-wrapped registry: one
//! async-capable trait for natively implemented tools, one map from name to
//! executor, built once at startup
//! and extended as `tool` declarations execute. Vibe-defined tool bodies
//! (`ts(...)` or a further statement list) are not executed here — the
//! interpreter pushes a fresh frame and runs them as it would any call,
//! since they need the suspend/resume machinery a plain async fn does not.

pub mod builtin;
pub mod sandbox;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::interp::ast::{Param, ToolBody, TypeAnnotation};

/// A tool's advertised shape: what the AI client puts in the provider's
/// tool-calling request (§4.D).
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object.
    pub parameters: JsonValue,
}

/// Failures a tool call can produce. Never propagated as a [`crate::error::VibeError`]:
/// the dispatcher folds every variant into a `[error]` context observation
/// and the program keeps running (§4.D "Errors are values").
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("sandbox violation: {0}")]
    Sandbox(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl From<sandbox::SandboxError> for ToolError {
    fn from(e: sandbox::SandboxError) -> Self {
        ToolError::Sandbox(e.to_string())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io(e.to_string())
    }
}

/// A natively implemented tool: `readFile`, `writeFile`, `glob`, `editFile`,
/// and anything a host embedding registers alongside them.
#[async_trait]
pub trait VibeTool: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolSpec;
    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError>;
}

/// How a registered tool is actually run.
pub enum ToolExecutor {
    Native(Arc<dyn VibeTool>),
    /// A `tool` declaration whose body is Vibe code; the interpreter
    /// interprets `body` as a call, binding `params` from the call arguments.
    VibeDefined {
        params: Vec<Param>,
        return_ty: Option<TypeAnnotation>,
        body: ToolBody,
    },
}

struct ToolEntry {
    spec: ToolSpec,
    executor: ToolExecutor,
}

/// The live set of callable tools, keyed by name. Wrapped in an async
/// `RwLock` rather than a plain `Mutex` so concurrent AI-initiated tool
/// calls within one round can read specs while a `tool` declaration
/// registers, mirroring a lock-wrapped `ToolRegistry`.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_native(&self, tool: Arc<dyn VibeTool>) {
        let spec = tool.spec();
        let name = spec.name.clone();
        self.entries.write().await.insert(
            name,
            ToolEntry {
                spec,
                executor: ToolExecutor::Native(tool),
            },
        );
    }

    pub async fn register_vibe_defined(
        &self,
        name: String,
        description: Option<String>,
        params: Vec<Param>,
        return_ty: Option<TypeAnnotation>,
        body: ToolBody,
        parameters_schema: JsonValue,
    ) {
        let spec = ToolSpec {
            name: name.clone(),
            description: description.unwrap_or_default(),
            parameters: parameters_schema,
        };
        self.entries.write().await.insert(
            name,
            ToolEntry {
                spec,
                executor: ToolExecutor::VibeDefined {
                    params,
                    return_ty,
                    body,
                },
            },
        );
    }

    pub async fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.entries.read().await.get(name).map(|e| e.spec.clone())
    }

    pub async fn all_specs(&self) -> Vec<ToolSpec> {
        self.entries.read().await.values().map(|e| e.spec.clone()).collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Runs a native tool directly. Callers must check [`Self::is_native`]
    /// (or handle the `NotFound`/non-native case) before calling this; a
    /// `VibeDefined` entry is dispatched by the interpreter instead.
    pub async fn call_native(&self, name: &str, args: JsonValue) -> Result<JsonValue, ToolError> {
        let guard = self.entries.read().await;
        match guard.get(name) {
            Some(ToolEntry {
                executor: ToolExecutor::Native(tool),
                ..
            }) => {
                let tool = tool.clone();
                drop(guard);
                tool.call(args).await
            }
            Some(_) => Err(ToolError::Other(format!(
                "{name} is a Vibe-defined tool; dispatch it through the interpreter"
            ))),
            None => Err(ToolError::NotFound(name.to_string())),
        }
    }

    /// Takes out the `VibeDefined` body for the interpreter to run, cloning
    /// just the pieces needed (AST nodes are cheap to clone; bodies are
    /// read far less often than they're registered).
    pub async fn vibe_defined_body(
        &self,
        name: &str,
    ) -> Option<(Vec<Param>, Option<TypeAnnotation>, ToolBody)> {
        let guard = self.entries.read().await;
        match guard.get(name) {
            Some(ToolEntry {
                executor: ToolExecutor::VibeDefined {
                    params,
                    return_ty,
                    body,
                },
                ..
            }) => Some((params.clone(), return_ty.clone(), body.clone())),
            _ => None,
        }
    }

    pub async fn is_native(&self, name: &str) -> bool {
        matches!(
            self.entries.read().await.get(name),
            Some(ToolEntry {
                executor: ToolExecutor::Native(_),
                ..
            })
        )
    }
}

impl Clone for ToolSpec {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}
