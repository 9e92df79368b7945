//! Top-level error type for the interpreter runtime.
//!
//! One variant per error kind named in the runtime spec that can actually
//! reach program-level failure: type errors, reference errors, AI errors,
//! host-evaluation errors, cancellation and timeout. Every variant carries
//! the source location of the offending AST node where one is available,
//! following the common pattern of structured context fields rather than
//! pre-formatted strings. Sandbox violations (§7 kind 6) never reach this
//! type: they are tool-scoped, folded into [`crate::tools::ToolError::Sandbox`]
//! and reported to the AI as a `[error]` observation, the same as any other
//! `ToolError` — there is no path that promotes one to a program-level failure.

use thiserror::Error;

use crate::ai::AiError;
use crate::host::HostFailure;
use crate::interp::ast::Location;
use crate::tools::ToolError;

/// A location-tagged runtime failure. `status = failed` transitions carry one of these.
#[derive(Debug, Clone, Error)]
pub enum VibeError {
    #[error("{location}: type error: {message}")]
    Type {
        message: String,
        location: Location,
    },

    #[error("{location}: reference error: {name} is not defined")]
    Reference { name: String, location: Location },

    #[error("{location}: {source}")]
    Ai {
        #[source]
        source: AiError,
        location: Location,
    },

    #[error("{location}: host evaluation failed: {source}")]
    Host {
        #[source]
        source: HostFailure,
        location: Location,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("{location}: timed out after {millis}ms")]
    Timeout { millis: u64, location: Location },

    #[error("{0}")]
    Internal(String),
}

impl VibeError {
    pub fn type_error(message: impl Into<String>, location: Location) -> Self {
        Self::Type {
            message: message.into(),
            location,
        }
    }

    pub fn reference(name: impl Into<String>, location: Location) -> Self {
        Self::Reference {
            name: name.into(),
            location,
        }
    }

    /// A mini-stack of frame names with their entry locations, for user-visible failures.
    pub fn with_frame_trace(self, trace: &[(String, Location)]) -> String {
        let mut out = self.to_string();
        for (name, loc) in trace {
            out.push_str(&format!("\n  at {name} ({loc})"));
        }
        out
    }
}

/// Structured failure produced by tool execution. Never fatal to the program:
/// the tool-calling loop folds this into a `[error]` observation instead of
/// propagating it as a `VibeError`.
#[derive(Debug, Error, Clone)]
pub enum ToolCallOutcome {
    #[error("{0}")]
    Error(String),
}

impl From<ToolError> for ToolCallOutcome {
    fn from(e: ToolError) -> Self {
        ToolCallOutcome::Error(e.to_string())
    }
}
