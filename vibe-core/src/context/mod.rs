//! The context log: an append-only, per-frame ordered history of variables,
//! prompts, and tool calls that AI calls see rendered as text (§4.B "Context
//! model"). Grounded in the shape of [`crate::interp::state`]'s call stack —
//! frames are pushed on call, popped on return, never mutated after pop.

mod format;

pub use format::{format_entries, ContextOptions};

use std::collections::HashMap;

use crate::interp::ast::{Location, TypeAnnotation};
use crate::value::Value;

/// Where a binding's current value came from (§3 "Variables"). Cleared to
/// `Code` on a plain reassignment; set to `Ai`/`Tool` by the resume code
/// right before the paired `assign` runs, so the formatter can pair a
/// `prompt`/`tool-call` line with the `variable` line it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Code,
    Ai,
    Tool,
    None,
}

/// `name -> { value, type, isConst, source, declaredAtDepth }` (§3 "Variables").
#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Value,
    pub ty: Option<TypeAnnotation>,
    pub is_const: bool,
    pub source: Source,
    pub declared_at_depth: usize,
}

/// One entry in a frame's ordered log. Order within a frame is the order
/// statements executed, never reordered or deduplicated.
#[derive(Debug, Clone)]
pub enum OrderedEntry {
    Variable {
        name: String,
        value: Value,
        ty: Option<TypeAnnotation>,
        source: Source,
    },
    Prompt {
        ai_type: &'static str,
        text: String,
    },
    ToolCall {
        name: String,
        args: serde_json::Value,
        /// `Ok` holds the tool's rendered result; `Err` the `[error]` observation text.
        result: Result<String, String>,
    },
}

/// A call frame: the function/tool name that was entered, where it was
/// called from, the locals it owns, the block-scope stack shadowing into
/// those locals, and everything logged while it was the innermost frame
/// (§3 "Scopes and frames" — one structure backs both the locals map and
/// the ordered log, since both are properties of the same frame).
#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub location: Location,
    pub entries: Vec<OrderedEntry>,
    pub depth: usize,
    /// The declared return type of the function/tool this frame belongs to,
    /// if any; validated against the value a `return` (or fallthrough)
    /// unwinds with, the same way a `let`/`const` slot validates its
    /// initializer. `None` for the program's entry frame and for callees
    /// with no declared return type.
    pub return_ty: Option<TypeAnnotation>,
    locals: HashMap<String, Binding>,
    /// A stack of block scopes; each holds the names declared in that
    /// block, innermost last. Looking up a name walks this from the end
    /// backward. Popping a block removes its names from `locals`.
    blocks: Vec<Vec<String>>,
}

impl Frame {
    pub fn new(name: impl Into<String>, location: Location) -> Self {
        Self {
            name: name.into(),
            location,
            entries: Vec::new(),
            depth: 0,
            return_ty: None,
            locals: HashMap::new(),
            blocks: vec![Vec::new()],
        }
    }

    pub fn with_depth(name: impl Into<String>, location: Location, depth: usize) -> Self {
        Self {
            depth,
            ..Self::new(name, location)
        }
    }

    pub fn with_return_ty(mut self, return_ty: Option<TypeAnnotation>) -> Self {
        self.return_ty = return_ty;
        self
    }

    /// `push_scope` (§4.F): opens a new block scope for shadowing.
    pub fn push_scope(&mut self) {
        self.blocks.push(Vec::new());
    }

    /// `pop_scope` (§4.F): removes every local declared in the innermost
    /// block scope. Top-level (function) locals live in `blocks[0]`, which
    /// is never popped by ordinary block exit.
    pub fn pop_scope(&mut self) {
        if self.blocks.len() > 1 {
            if let Some(names) = self.blocks.pop() {
                for name in names {
                    self.locals.remove(&name);
                }
            }
        }
    }

    /// `bind_let`/`const` (§4.F): declares a new local in the innermost
    /// block scope and appends the first `variable` ordered entry.
    pub fn declare(&mut self, name: impl Into<String>, binding: Binding) {
        let name = name.into();
        self.push_variable(&name, binding.value.clone(), binding.ty.clone(), binding.source);
        self.blocks.last_mut().unwrap().push(name.clone());
        self.locals.insert(name, binding);
    }

    /// Looks up a local by name in this frame only (no cross-frame lookup —
    /// §9 "No closures").
    pub fn local(&self, name: &str) -> Option<&Binding> {
        self.locals.get(name)
    }

    pub fn local_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.locals.get_mut(name)
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.locals.contains_key(name)
    }

    pub fn push_variable(
        &mut self,
        name: impl Into<String>,
        value: Value,
        ty: Option<TypeAnnotation>,
        source: Source,
    ) {
        self.entries.push(OrderedEntry::Variable {
            name: name.into(),
            value,
            ty,
            source,
        });
    }

    pub fn push_prompt(&mut self, ai_type: &'static str, text: impl Into<String>) {
        self.entries.push(OrderedEntry::Prompt {
            ai_type,
            text: text.into(),
        });
    }

    pub fn push_tool_call(
        &mut self,
        name: impl Into<String>,
        args: serde_json::Value,
        result: Result<String, String>,
    ) {
        self.entries.push(OrderedEntry::ToolCall {
            name: name.into(),
            args,
            result,
        });
    }

    /// Looks up the most recent entry binding `name`, for `contextKind =
    /// variable(name)` (§4.F). Walks backward since `const`/`let` is
    /// single-assignment but destructuring can re-push under the same name
    /// inside a loop body's fresh frame.
    pub fn find_variable(&self, name: &str) -> Option<&Value> {
        self.entries.iter().rev().find_map(|e| match e {
            OrderedEntry::Variable { name: n, value, .. } if n == name => Some(value),
            _ => None,
        })
    }
}

/// The live call stack: `stack[0]` is the program's top-level frame,
/// `stack.last()` is the innermost (currently executing) frame.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pops the innermost frame. Callers that need its accumulated entries
    /// (to fold into the caller's own log, for non-AI scopes) keep the
    /// return value; the default step loop discards it, since a callee's
    /// private log does not leak into the caller's local context (§4.B).
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The entry (outermost) frame, mutably — used when an assignment
    /// target falls back to top-level bindings from inside a callee (§4.F
    /// "Scopes").
    pub fn entry_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.first_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Entry (outermost) frame down to the innermost, in call order — the
    /// chain `globalContext` renders (§4.B: "entry→caller→callee").
    pub fn chain(&self) -> &[Frame] {
        &self.frames
    }

    /// Frame names paired with the location each was entered from, outermost
    /// first — used to build [`crate::error::VibeError::with_frame_trace`].
    pub fn trace(&self) -> Vec<(String, Location)> {
        self.frames
            .iter()
            .map(|f| (f.name.clone(), f.location.clone()))
            .collect()
    }

    /// `localContext` (§4.B): only the innermost frame's entries.
    pub fn local_context(&self, opts: &ContextOptions) -> String {
        match self.current() {
            Some(frame) => format_entries(std::slice::from_ref(frame), opts),
            None => String::new(),
        }
    }

    /// `globalContext` (§4.B): the full entry→caller→callee chain.
    pub fn global_context(&self, opts: &ContextOptions) -> String {
        format_entries(&self.frames, opts)
    }
}
