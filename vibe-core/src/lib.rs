//! Vibe: a stepwise interpreter runtime for the Vibe scripting language
//! (§1 "Overview"). The interpreter is an explicit instruction-stack state
//! machine ([`interp::RuntimeState`]) rather than a recursive tree-walker,
//! so a program can suspend at any AI call, user prompt, tool call, or
//! host-code block and resume later. Everything else in this crate — the
//! AI client boundary, the tool registry and its built-ins, the host-code
//! boundary, and the context log — exists to be crossed by that one state
//! machine.

pub mod ai;
pub mod context;
pub mod error;
pub mod host;
pub mod interp;
pub mod tools;
pub mod value;

pub use ai::{AiError, AiOutput, AiProvider, AiRequest, AiResponse, AiUsage, ToolCallRequest};
pub use error::VibeError;
pub use host::{HostEvaluator, HostFailure, UnconfiguredHostEvaluator};
pub use interp::ast::{Location, Stmt};
pub use interp::{run, run_with_interactions, AiInteraction, RunOptions, RuntimeState, Status};
pub use tools::{ToolError, ToolRegistry, ToolSpec, VibeTool};
pub use value::Value;
