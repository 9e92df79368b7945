//! The instruction stack: the explicit, serializable continuation state
//! that replaces the Rust call stack a plain tree-walker would use (§3
//! "Instruction stack", §4.F). Popping one drives execution forward;
//! pushing happens when a block, loop, or function call is entered.
//! Nothing here borrows from the AST by reference — every instruction
//! owns what it needs, so the whole stack can sit idle across a
//! suspension (`awaiting_ai`/`awaiting_user`/`awaiting_tool`/`awaiting_ts`).
//!
//! Function calls (`call(fn,argc)`) and tool dispatch are their own named
//! instructions in §4.F's vocabulary, distinct from generic expression
//! evaluation — only a statement's *direct* value-expression (a `let`/
//! `const` initializer, an assignment's right-hand side, a `return` value,
//! or a bare expression statement) or an `if`/`while`/`for..in` condition
//! dispatches straight to `call`/`ai_call`/`ask`/`ts_eval`. A call, `do`/
//! `vibe`, `ts(...)`, or `ask` nested *inside* a larger expression (a
//! binary operand, a call argument, a template placeholder's surrounding
//! expression, and so on) is not itself one of those instructions — it is
//! hoisted at lowering time into a synthetic `let __hoistN = <expr>;`
//! pushed ahead of the statement it appears in (see `hoist_nested` in
//! `super`), so it still runs through the ordinary suspend/resume path and
//! the enclosing expression sees only the resulting value. See
//! DESIGN.md for the recorded decision.

use crate::interp::ast::{Expr, Location, Stmt, TypeAnnotation};
use crate::value::Value;

/// Where a just-completed (possibly suspended) statement-level value goes
/// once it's known — `bind_let`/`assign`/`ret` in §4.F's vocabulary.
#[derive(Debug, Clone)]
pub enum Cont {
    Let {
        name: String,
        ty: Option<TypeAnnotation>,
    },
    Const {
        name: String,
        ty: Option<TypeAnnotation>,
    },
    /// Destructuring declaration: binds each name from the corresponding
    /// array element of the produced value.
    Destructure {
        names: Vec<String>,
    },
    /// Plain assignment to an identifier, member, or index expression.
    Assign(Expr),
    /// `ExpressionStatement` — evaluated for effect, result discarded.
    Discard,
    /// `return <expr>;` — unwinds to the nearest [`Instruction::FrameExit`].
    Return,
}

/// One pending unit of work. [`crate::interp::RuntimeState`]'s instruction
/// stack is a `Vec` used as a stack: the next instruction to run is the
/// last one.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Run this statement next.
    Exec(Stmt),
    /// `push_scope` (§4.F): opens a block scope on the current frame.
    PushScope,
    /// `pop_scope` (§4.F): closes the innermost block scope, unshadowing.
    PopScope,
    /// Marks where a pushed call frame ends: when popped "naturally" (the
    /// callee fell off the end of its body with no `return`), the callee
    /// implicitly returns `null`; when reached via an explicit `return`'s
    /// unwind, the value is already known. Either way this instruction pops
    /// the call stack's current frame, validates the value against the
    /// popped frame's declared return type, and applies `cont` in the
    /// caller's now-current frame. Only used for user `FunctionDeclaration`
    /// calls — tool dispatch (native or Vibe-defined) is resolved entirely
    /// by the driver, one level up, since it needs async registry lookups
    /// `step` cannot perform.
    FrameExit {
        cont: Cont,
    },
    /// A `for..in` loop with remaining elements still to iterate. Popped
    /// once per iteration: binds the next element, pushes the body (inside
    /// a fresh block scope) and re-pushes itself with one fewer element.
    ForIn {
        var_name: String,
        remaining: Vec<Value>,
        body: Vec<Stmt>,
        loc: Location,
    },
    /// A `while` loop, re-checked every time it's popped (condition
    /// expressions may not suspend; see DESIGN.md).
    While {
        cond: Expr,
        body: Vec<Stmt>,
        loc: Location,
    },
}
