//! The interpreter core (§4.F): an explicit instruction-stack state machine
//! rather than a recursive tree-walker, so execution can pause at any of
//! four suspension points (`awaiting_ai`, `awaiting_user`, `awaiting_tool`,
//! `awaiting_ts`) and resume later from serializable state. Grounded in the
//! shape of an agent-runner's own loop (a synchronous step function plus an
//! async driver that performs the actual I/O between steps), generalized
//! from one fixed ReAct loop into a statement-by-statement machine driven
//! by an arbitrary Vibe program.
//!
//! [`RuntimeState::step`] mutates state and never awaits; [`run`] is the
//! async entry point that repeatedly drains runnable steps and crosses each
//! suspension by awaiting the right collaborator (an [`crate::ai::AiProvider`],
//! a [`crate::host::HostEvaluator`], the [`crate::tools::ToolRegistry`]) and
//! feeding the result back through the matching `resume_with_*` method.

pub mod ast;
pub mod eval;
pub mod instruction;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};

use ast::{ContextKind, ExprKind, Location, Param, Stmt, StmtKind, ToolBody, TypeAnnotation};
use instruction::{Cont, Instruction};

use crate::ai::retry::{self, RetryConfig};
use crate::ai::{AiError, AiOutput, AiProvider, AiRequest};
use crate::context::{Binding, CallStack, ContextOptions, Frame, Source};
use crate::error::VibeError;
use crate::host::{HostEvaluator, HostFailure};
use crate::tools::{ToolError, ToolRegistry};
use crate::value::{ModelRecord, TypeRegistry, Value};

/// Where execution currently stands. Exactly one of the four `Awaiting*`
/// variants is live at a time, each paired with the matching `pending_*`
/// field being `Some` (§3 "Runtime state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    AwaitingAi,
    AwaitingUser,
    AwaitingTool,
    AwaitingTs,
    Completed,
    Failed,
}

/// Tunables an embedder sets once per run (§4.E "Defaults", §9 "Context window").
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Caps how many of the innermost frame's/chain's ordered entries the
    /// context formatter renders; `None` means unbounded.
    pub context_window: Option<usize>,
    /// Caps consecutive tool-calling rounds within one `ai_call` before it's
    /// treated as a fatal error (§4.E default: 16).
    pub max_tool_rounds: u32,
    pub retry: RetryConfig,
    /// Checked at the top of every suspension crossing; an embedder flips
    /// this to request cancellation from another task.
    pub cancel: Arc<AtomicBool>,
    /// Overall wall-clock budget for one `ai_call`'s `execute`, including
    /// every retried attempt (§5 "Timeouts", default: 120s).
    pub ai_timeout: Duration,
    /// Per-call budget for a single tool dispatch, native or Vibe-defined
    /// (§5 "Timeouts", default: 30s).
    pub tool_timeout: Duration,
    /// Budget for one `ts_eval` (§5 "Timeouts", default: 30s).
    pub ts_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            context_window: None,
            max_tool_rounds: 16,
            retry: RetryConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            ai_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
            ts_timeout: Duration::from_secs(30),
        }
    }
}

/// One AI-mediated exchange (a `do`/`vibe` call, an `ask`), kept for an
/// embedder's `--log-ai`-style output; not consulted by the interpreter itself.
#[derive(Debug, Clone)]
pub struct AiInteraction {
    pub kind: &'static str,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone)]
struct FunctionDef {
    params: Vec<Param>,
    return_ty: Option<TypeAnnotation>,
    body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
struct PendingAi {
    kind: ast::AiCallKind,
    prompt: String,
    model: ModelRecord,
    context_text: String,
    target_type: Option<TypeAnnotation>,
    tool_names: Vec<String>,
    cont: Cont,
    loc: Location,
}

#[derive(Debug, Clone)]
struct PendingUser {
    prompt: String,
    target_type: Option<TypeAnnotation>,
    cont: Cont,
    loc: Location,
}

#[derive(Debug, Clone)]
struct PendingTool {
    name: String,
    args: JsonValue,
    cont: Cont,
    loc: Location,
}

#[derive(Debug, Clone)]
struct PendingTs {
    params: Vec<String>,
    param_values: Vec<JsonValue>,
    body: String,
    cont: Cont,
    loc: Location,
}

/// The whole of a program's (or a Vibe-defined tool body's) live execution:
/// the call stack, the instruction stack, and whichever suspension is
/// currently pending. Cloning the AST nodes it holds is cheap relative to
/// how rarely they're touched, so instructions and pending state own their
/// data outright rather than borrowing (§3 "Instruction stack").
pub struct RuntimeState {
    pub status: Status,
    pub frames: CallStack,
    pub last_result: Option<Value>,
    pub final_result: Option<Value>,
    pub error: Option<VibeError>,
    pub ai_interactions: Vec<AiInteraction>,
    pub options: RunOptions,
    instructions: Vec<Instruction>,
    pending_ai: Option<PendingAi>,
    pending_user: Option<PendingUser>,
    pending_tool: Option<PendingTool>,
    pending_ts: Option<PendingTs>,
    functions: HashMap<String, FunctionDef>,
    type_registry: TypeRegistry,
    /// Counter for synthetic `__hoistN` temporaries introduced by [`hoist_nested`].
    hoist_seq: u64,
}

/// Rewrites `expr` so that none of the four suspending expression kinds
/// (`CallExpression`, `VibeExpression`, `TsBlock`, `AskExpression`) appear
/// anywhere below the root except where `is_root` allows the root itself to
/// be one of them: each disallowed occurrence is replaced by a reference to
/// a synthetic `__hoistN` local, and a `let __hoistN = <original>;`
/// statement for it is appended to `lets` in evaluation order (innermost
/// first). Run the returned statements ahead of the rewritten expression via
/// instruction re-pushing — the same trick `if`/`for`/`while` already use —
/// and every suspension they contain crosses normally, since each is just an
/// ordinary statement on the instruction stack.
fn hoist_nested(expr: &ast::Expr, lets: &mut Vec<Stmt>, seq: &mut u64, is_root: bool) -> ast::Expr {
    let rebuilt_kind = match &expr.kind {
        ExprKind::CallExpression { callee, args } => ExprKind::CallExpression {
            callee: Box::new(hoist_nested(callee, lets, seq, false)),
            args: args.iter().map(|a| hoist_nested(a, lets, seq, false)).collect(),
        },
        ExprKind::BinaryExpression { op, left, right } => ExprKind::BinaryExpression {
            op: *op,
            left: Box::new(hoist_nested(left, lets, seq, false)),
            right: Box::new(hoist_nested(right, lets, seq, false)),
        },
        ExprKind::UnaryExpression { op, operand } => ExprKind::UnaryExpression {
            op: *op,
            operand: Box::new(hoist_nested(operand, lets, seq, false)),
        },
        ExprKind::MemberExpression { object, property } => ExprKind::MemberExpression {
            object: Box::new(hoist_nested(object, lets, seq, false)),
            property: property.clone(),
        },
        ExprKind::IndexExpression { object, index } => ExprKind::IndexExpression {
            object: Box::new(hoist_nested(object, lets, seq, false)),
            index: Box::new(hoist_nested(index, lets, seq, false)),
        },
        ExprKind::AssignmentExpression { target, value } => ExprKind::AssignmentExpression {
            target: target.clone(),
            value: Box::new(hoist_nested(value, lets, seq, false)),
        },
        ExprKind::ArrayLiteral(items) => {
            ExprKind::ArrayLiteral(items.iter().map(|i| hoist_nested(i, lets, seq, false)).collect())
        }
        ExprKind::ObjectLiteral(fields) => ExprKind::ObjectLiteral(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), hoist_nested(v, lets, seq, false)))
                .collect(),
        ),
        ExprKind::RangeExpression { start, end, inclusive } => ExprKind::RangeExpression {
            start: Box::new(hoist_nested(start, lets, seq, false)),
            end: Box::new(hoist_nested(end, lets, seq, false)),
            inclusive: *inclusive,
        },
        ExprKind::VibeExpression {
            kind,
            prompt,
            model,
            context,
            target_type,
        } => ExprKind::VibeExpression {
            kind: *kind,
            prompt: Box::new(hoist_nested(prompt, lets, seq, false)),
            model: model.clone(),
            context: context.clone(),
            target_type: target_type.clone(),
        },
        ExprKind::AskExpression { prompt, target_type } => ExprKind::AskExpression {
            prompt: Box::new(hoist_nested(prompt, lets, seq, false)),
            target_type: target_type.clone(),
        },
        // Identifier, literals, TemplateLiteral (placeholders are plain
        // names, not expressions) and TsBlock (params are names, body is an
        // opaque host-language string) have nothing nested to hoist.
        other => other.clone(),
    };
    let rebuilt = ast::Expr::new(rebuilt_kind, expr.loc.clone());

    let is_suspending = matches!(
        rebuilt.kind,
        ExprKind::CallExpression { .. }
            | ExprKind::VibeExpression { .. }
            | ExprKind::TsBlock { .. }
            | ExprKind::AskExpression { .. }
    );
    if is_root || !is_suspending {
        return rebuilt;
    }
    let name = format!("__hoist{}", *seq);
    *seq += 1;
    lets.push(Stmt::new(
        StmtKind::LetDeclaration {
            name: name.clone(),
            ty: None,
            init: Some(rebuilt),
        },
        expr.loc.clone(),
    ));
    ast::Expr::new(ExprKind::Identifier(name), expr.loc.clone())
}

/// Rebuilds the statement a [`Cont`] represents, so a value-expression that
/// needed hoisting can be re-entered through the instruction stack with its
/// original continuation intact.
fn cont_to_stmt(cont: Cont, expr: ast::Expr, loc: Location) -> Stmt {
    let kind = match cont {
        Cont::Let { name, ty } => StmtKind::LetDeclaration {
            name,
            ty,
            init: Some(expr),
        },
        Cont::Const { name, ty } => StmtKind::ConstDeclaration { name, ty, init: expr },
        Cont::Destructure { names } => StmtKind::DestructuringDeclaration { names, init: expr },
        Cont::Assign(target) => StmtKind::ExpressionStatement(ast::Expr::new(
            ExprKind::AssignmentExpression {
                target: Box::new(target),
                value: Box::new(expr),
            },
            loc.clone(),
        )),
        Cont::Discard => StmtKind::ExpressionStatement(expr),
        Cont::Return => StmtKind::ReturnStatement(Some(expr)),
    };
    Stmt::new(kind, loc)
}

fn hoist_functions(stmts: &[Stmt], out: &mut HashMap<String, FunctionDef>) {
    for s in stmts {
        if let StmtKind::FunctionDeclaration {
            name,
            params,
            return_ty,
            body,
        } = &s.kind
        {
            out.insert(
                name.clone(),
                FunctionDef {
                    params: params.clone(),
                    return_ty: return_ty.clone(),
                    body: body.clone(),
                },
            );
        }
    }
}

impl RuntimeState {
    /// Builds the entry-frame state for a whole program: the top-level
    /// statements become the initial instruction stack, `function`
    /// declarations are hoisted up front (§4.F "Hoisting") so forward
    /// references resolve, and a single "main" frame is pushed to hold
    /// top-level bindings.
    pub fn new(top_level: Vec<Stmt>, options: RunOptions) -> Self {
        let mut functions = HashMap::new();
        hoist_functions(&top_level, &mut functions);

        let mut frames = CallStack::new();
        frames.push(Frame::new("main", Location::synthetic()));

        let mut instructions = Vec::with_capacity(top_level.len());
        for stmt in top_level.into_iter().rev() {
            instructions.push(Instruction::Exec(stmt));
        }

        Self {
            status: Status::Running,
            frames,
            last_result: None,
            final_result: None,
            error: None,
            ai_interactions: Vec::new(),
            options,
            instructions,
            pending_ai: None,
            pending_user: None,
            pending_tool: None,
            pending_ts: None,
            functions,
            type_registry: TypeRegistry::default(),
            hoist_seq: 0,
        }
    }

    /// Builds an isolated state for one Vibe-defined tool invocation: a
    /// single frame holding the bound parameters, sharing no locals or
    /// functions with whatever called it (§9 "No closures" extends to tool
    /// bodies too — a tool only sees the arguments it was called with).
    fn new_tool_body(
        name: String,
        params: Vec<Param>,
        return_ty: Option<TypeAnnotation>,
        body: ToolBody,
        args: JsonValue,
        options: RunOptions,
    ) -> Result<Self, VibeError> {
        let type_registry = TypeRegistry::default();
        let loc = Location::synthetic();
        let mut frame = Frame::with_depth(name, loc.clone(), 0).with_return_ty(return_ty);
        for p in &params {
            let raw = args.get(&p.name).cloned().unwrap_or(JsonValue::Null);
            let value = type_registry
                .host_value_to_value(raw, p.ty.as_ref())
                .map_err(|e| VibeError::type_error(e, loc.clone()))?;
            frame.declare(
                p.name.clone(),
                Binding {
                    value,
                    ty: p.ty.clone(),
                    is_const: false,
                    source: Source::Code,
                    declared_at_depth: 0,
                },
            );
        }
        let mut frames = CallStack::new();
        frames.push(frame);

        let mut state = Self {
            status: Status::Running,
            frames,
            last_result: None,
            final_result: None,
            error: None,
            ai_interactions: Vec::new(),
            options,
            instructions: Vec::new(),
            pending_ai: None,
            pending_user: None,
            pending_tool: None,
            pending_ts: None,
            functions: HashMap::new(),
            type_registry,
            hoist_seq: 0,
        };

        match body {
            ToolBody::Statements(stmts) => {
                hoist_functions(&stmts, &mut state.functions);
                for stmt in stmts.into_iter().rev() {
                    state.instructions.push(Instruction::Exec(stmt));
                }
            }
            ToolBody::Ts {
                params: ts_params,
                body: ts_body,
            } => {
                state.dispatch_ts(&ts_params, &ts_body, Cont::Return, &loc)?;
            }
        }
        Ok(state)
    }

    /// Pops and runs exactly one instruction (§4.F "Stepping"). A no-op once
    /// the machine has left [`Status::Running`].
    pub fn step(&mut self) {
        if self.status != Status::Running {
            return;
        }
        match self.instructions.pop() {
            Some(instr) => {
                if let Err(e) = self.exec_instruction(instr) {
                    self.fail(e);
                }
            }
            None => {
                let value = self.last_result.clone().unwrap_or(Value::Null);
                self.final_result = Some(value);
                self.status = Status::Completed;
            }
        }
    }

    /// Steps until the machine leaves `Running` — either it suspends on one
    /// of the four boundaries, or it terminates.
    pub fn run_to_suspension(&mut self) {
        while self.status == Status::Running {
            self.step();
        }
    }

    fn fail(&mut self, error: VibeError) {
        tracing::debug!(%error, "vibe program failed");
        self.error = Some(error);
        self.status = Status::Failed;
    }

    fn exec_instruction(&mut self, instr: Instruction) -> Result<(), VibeError> {
        match instr {
            Instruction::Exec(stmt) => self.exec_stmt(&stmt),
            Instruction::PushScope => {
                self.current_frame_mut()?.push_scope();
                Ok(())
            }
            Instruction::PopScope => {
                self.current_frame_mut()?.pop_scope();
                Ok(())
            }
            Instruction::FrameExit { cont } => {
                let popped = self
                    .frames
                    .pop()
                    .ok_or_else(|| VibeError::Internal("frame stack underflow".into()))?;
                let value = self.validate_return(&popped, &Value::Null, &popped.location)?;
                self.last_result = Some(value.clone());
                self.apply_cont(cont, value, Source::Code, &popped.location)
            }
            Instruction::ForIn {
                var_name,
                mut remaining,
                body,
                loc,
            } => {
                if remaining.is_empty() {
                    return Ok(());
                }
                let next = remaining.remove(0);
                self.instructions.push(Instruction::ForIn {
                    var_name: var_name.clone(),
                    remaining,
                    body: body.clone(),
                    loc: loc.clone(),
                });
                self.instructions.push(Instruction::PopScope);
                for s in body.iter().rev() {
                    self.instructions.push(Instruction::Exec(s.clone()));
                }
                let frame = self.current_frame_mut()?;
                let depth = frame.depth;
                frame.push_scope();
                frame.declare(
                    var_name,
                    Binding {
                        value: next,
                        ty: None,
                        is_const: false,
                        source: Source::Code,
                        declared_at_depth: depth,
                    },
                );
                Ok(())
            }
            Instruction::While { cond, body, loc } => {
                let mut lets = Vec::new();
                let rewritten = hoist_nested(&cond, &mut lets, &mut self.hoist_seq, false);
                if !lets.is_empty() {
                    // Re-check with the original (unhoisted) condition next
                    // time: it may call something that suspends again.
                    let mut then_branch = body.clone();
                    then_branch.push(Stmt::new(
                        StmtKind::WhileStatement {
                            cond: cond.clone(),
                            body: body.clone(),
                        },
                        loc.clone(),
                    ));
                    let synthetic_if = Stmt::new(
                        StmtKind::IfStatement {
                            cond: rewritten,
                            then_branch,
                            else_branch: None,
                        },
                        loc.clone(),
                    );
                    self.instructions.push(Instruction::Exec(synthetic_if));
                    for let_stmt in lets.into_iter().rev() {
                        self.instructions.push(Instruction::Exec(let_stmt));
                    }
                    return Ok(());
                }
                let c = eval::eval_expr(self, &rewritten)?;
                let keep_going = match c {
                    Value::Boolean(b) => b,
                    other => {
                        return Err(VibeError::type_error(
                            format!("while condition must be boolean, got {}", other.type_tag()),
                            loc,
                        ))
                    }
                };
                if keep_going {
                    self.instructions.push(Instruction::While {
                        cond: cond.clone(),
                        body: body.clone(),
                        loc: loc.clone(),
                    });
                    self.push_block(&body);
                }
                Ok(())
            }
        }
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), VibeError> {
        match &stmt.kind {
            StmtKind::Program(stmts) => {
                self.push_block(stmts);
                Ok(())
            }
            StmtKind::LetDeclaration { name, ty, init } => match init {
                Some(e) => self.dispatch_value_expr(
                    e,
                    Cont::Let {
                        name: name.clone(),
                        ty: ty.clone(),
                    },
                ),
                None => self.bind_new(name.clone(), ty.clone(), Value::Null, false, Source::Code, &stmt.loc),
            },
            StmtKind::ConstDeclaration { name, ty, init } => self.dispatch_value_expr(
                init,
                Cont::Const {
                    name: name.clone(),
                    ty: ty.clone(),
                },
            ),
            StmtKind::DestructuringDeclaration { names, init } => {
                self.dispatch_value_expr(init, Cont::Destructure { names: names.clone() })
            }
            // Hoisted at construction time; nothing to do when stepped over.
            StmtKind::FunctionDeclaration { .. } => Ok(()),
            // Registered into the tool registry before driving begins.
            StmtKind::ToolDeclaration { .. } => Ok(()),
            StmtKind::ModelDeclaration { name, fields } => {
                let mut kv = Vec::with_capacity(fields.len());
                for (key, expr) in fields {
                    let value = eval::eval_expr(self, expr)?;
                    kv.push((key.clone(), value.to_display_json()));
                }
                let record = crate::value::build_model_record(&kv);
                self.bind_new(
                    name.clone(),
                    Some(TypeAnnotation::scalar("model")),
                    Value::Model(record),
                    true,
                    Source::Code,
                    &stmt.loc,
                )
            }
            StmtKind::ExpressionStatement(expr) => match &expr.kind {
                ExprKind::AssignmentExpression { target, value } => {
                    self.dispatch_value_expr(value, Cont::Assign((**target).clone()))
                }
                _ => self.dispatch_value_expr(expr, Cont::Discard),
            },
            StmtKind::ReturnStatement(opt) => match opt {
                Some(e) => self.dispatch_value_expr(e, Cont::Return),
                None => self.do_return(Value::Null, &stmt.loc),
            },
            StmtKind::IfStatement {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut lets = Vec::new();
                let rewritten = hoist_nested(cond, &mut lets, &mut self.hoist_seq, false);
                if !lets.is_empty() {
                    let requeued = Stmt::new(
                        StmtKind::IfStatement {
                            cond: rewritten,
                            then_branch: then_branch.clone(),
                            else_branch: else_branch.clone(),
                        },
                        stmt.loc.clone(),
                    );
                    self.instructions.push(Instruction::Exec(requeued));
                    for let_stmt in lets.into_iter().rev() {
                        self.instructions.push(Instruction::Exec(let_stmt));
                    }
                    return Ok(());
                }
                let c = eval::eval_expr(self, &rewritten)?;
                let take_then = match c {
                    Value::Boolean(b) => b,
                    other => {
                        return Err(VibeError::type_error(
                            format!("if condition must be boolean, got {}", other.type_tag()),
                            stmt.loc.clone(),
                        ))
                    }
                };
                let empty = Vec::new();
                let branch = if take_then {
                    then_branch
                } else {
                    else_branch.as_ref().unwrap_or(&empty)
                };
                self.push_block(branch);
                Ok(())
            }
            StmtKind::ForInStatement {
                var_name,
                iterable,
                body,
            } => {
                let mut lets = Vec::new();
                let rewritten = hoist_nested(iterable, &mut lets, &mut self.hoist_seq, false);
                if !lets.is_empty() {
                    let requeued = Stmt::new(
                        StmtKind::ForInStatement {
                            var_name: var_name.clone(),
                            iterable: rewritten,
                            body: body.clone(),
                        },
                        stmt.loc.clone(),
                    );
                    self.instructions.push(Instruction::Exec(requeued));
                    for let_stmt in lets.into_iter().rev() {
                        self.instructions.push(Instruction::Exec(let_stmt));
                    }
                    return Ok(());
                }
                let v = eval::eval_expr(self, &rewritten)?;
                let items = match v {
                    Value::Array(items) => items,
                    other => {
                        return Err(VibeError::type_error(
                            format!("for..in expects an array, got {}", other.type_tag()),
                            stmt.loc.clone(),
                        ))
                    }
                };
                self.instructions.push(Instruction::ForIn {
                    var_name: var_name.clone(),
                    remaining: items,
                    body: body.clone(),
                    loc: stmt.loc.clone(),
                });
                Ok(())
            }
            StmtKind::WhileStatement { cond, body } => {
                self.instructions.push(Instruction::While {
                    cond: cond.clone(),
                    body: body.clone(),
                    loc: stmt.loc.clone(),
                });
                Ok(())
            }
            // Names resolved dynamically against the tool registry; nothing
            // to bind up front.
            StmtKind::ImportDeclaration { .. } => Ok(()),
            StmtKind::ExportDeclaration(inner) => self.exec_stmt(inner),
            StmtKind::BlockStatement(stmts) => {
                self.push_block(stmts);
                Ok(())
            }
        }
    }

    fn push_block(&mut self, stmts: &[Stmt]) {
        self.instructions.push(Instruction::PopScope);
        for s in stmts.iter().rev() {
            self.instructions.push(Instruction::Exec(s.clone()));
        }
        self.instructions.push(Instruction::PushScope);
    }

    fn current_frame_mut(&mut self) -> Result<&mut Frame, VibeError> {
        self.frames
            .current_mut()
            .ok_or_else(|| VibeError::Internal("no current frame".into()))
    }

    /// Recognizes the four suspending expression shapes and defers to the
    /// matching `dispatch_*`; everything else runs synchronously through
    /// [`eval::eval_expr`] (§4.F: `call`/`ai_call`/`ts_eval` are instructions
    /// in their own right, not plain expression evaluation — see the module
    /// doc on [`instruction`]).
    fn dispatch_value_expr(&mut self, expr: &ast::Expr, cont: Cont) -> Result<(), VibeError> {
        // Nested calls, ai/ts/ask expressions that are not themselves the
        // statement's direct value-expression are hoisted into synthetic
        // `let`s and re-entered through the instruction stack; only the root
        // keeps its special suspend-capable dispatch below.
        let mut lets = Vec::new();
        let rewritten = hoist_nested(expr, &mut lets, &mut self.hoist_seq, true);
        if !lets.is_empty() {
            let requeued = cont_to_stmt(cont, rewritten, expr.loc.clone());
            self.instructions.push(Instruction::Exec(requeued));
            for let_stmt in lets.into_iter().rev() {
                self.instructions.push(Instruction::Exec(let_stmt));
            }
            return Ok(());
        }
        match &rewritten.kind {
            ExprKind::CallExpression { callee, args } => {
                self.dispatch_call(callee, args, cont, &rewritten.loc)
            }
            ExprKind::VibeExpression {
                kind,
                prompt,
                model,
                context,
                target_type,
            } => self.dispatch_ai_call(
                *kind,
                prompt,
                model,
                context,
                target_type.clone(),
                cont,
                &rewritten.loc,
            ),
            ExprKind::AskExpression { prompt, target_type } => {
                self.dispatch_ask(prompt, target_type.clone(), cont, &rewritten.loc)
            }
            ExprKind::TsBlock { params, body } => self.dispatch_ts(params, body, cont, &rewritten.loc),
            _ => {
                let value = eval::eval_expr(self, &rewritten)?;
                self.apply_cont(cont, value, Source::Code, &rewritten.loc)
            }
        }
    }

    fn dispatch_call(
        &mut self,
        callee: &ast::Expr,
        args: &[ast::Expr],
        cont: Cont,
        loc: &Location,
    ) -> Result<(), VibeError> {
        let name = match &callee.kind {
            ExprKind::Identifier(n) => n.clone(),
            _ => return Err(VibeError::Internal(format!("{loc}: call target must be an identifier"))),
        };
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(eval::eval_expr(self, a)?);
        }

        if let Some(func) = self.functions.get(&name).cloned() {
            if func.params.len() != values.len() {
                return Err(VibeError::type_error(
                    format!(
                        "{name} expects {} argument(s), got {}",
                        func.params.len(),
                        values.len()
                    ),
                    loc.clone(),
                ));
            }
            let depth = self.frames.depth();
            let mut frame =
                Frame::with_depth(name, loc.clone(), depth).with_return_ty(func.return_ty.clone());
            for (param, value) in func.params.iter().zip(values.into_iter()) {
                let bound = match &param.ty {
                    Some(ty) => self
                        .type_registry
                        .validate_value(&value, ty)
                        .map_err(|e| VibeError::type_error(e, loc.clone()))?,
                    None => value,
                };
                frame.declare(
                    param.name.clone(),
                    Binding {
                        value: bound,
                        ty: param.ty.clone(),
                        is_const: false,
                        source: Source::Code,
                        declared_at_depth: depth,
                    },
                );
            }
            self.frames.push(frame);
            self.instructions.push(Instruction::FrameExit { cont });
            for s in func.body.iter().rev() {
                self.instructions.push(Instruction::Exec(s.clone()));
            }
            Ok(())
        } else {
            // Not a user function — might be a native or Vibe-defined tool,
            // which only the async registry knows; deferred to the driver.
            let args_json = build_tool_call_args(&values, loc)?;
            self.pending_tool = Some(PendingTool {
                name,
                args: args_json,
                cont,
                loc: loc.clone(),
            });
            self.status = Status::AwaitingTool;
            Ok(())
        }
    }

    fn dispatch_ai_call(
        &mut self,
        kind: ast::AiCallKind,
        prompt_expr: &ast::Expr,
        model_name: &str,
        context: &ContextKind,
        target_type: Option<TypeAnnotation>,
        cont: Cont,
        loc: &Location,
    ) -> Result<(), VibeError> {
        let prompt_text = match eval::eval_expr(self, prompt_expr)? {
            Value::Text(s) | Value::Prompt(s) => s,
            other => {
                return Err(VibeError::type_error(
                    format!("ai_call prompt must be text, got {}", other.type_tag()),
                    loc.clone(),
                ))
            }
        };
        let model = match eval::lookup(self, model_name, loc)? {
            Value::Model(m) => m,
            other => {
                return Err(VibeError::type_error(
                    format!("{model_name} is not a model, got {}", other.type_tag()),
                    loc.clone(),
                ))
            }
        };
        let opts = ContextOptions {
            window: self.options.context_window,
            for_ai: true,
            header: None,
        };
        let context_text = match context {
            ContextKind::Default => self.frames.global_context(&opts),
            ContextKind::Local => self.frames.local_context(&opts),
            ContextKind::Variable(name) => {
                let v = eval::lookup(self, name, loc)?;
                v.as_context_chunks().join("\n\n")
            }
        };
        let tool_names = model.tools.clone();
        self.pending_ai = Some(PendingAi {
            kind,
            prompt: prompt_text,
            model,
            context_text,
            target_type,
            tool_names,
            cont,
            loc: loc.clone(),
        });
        self.status = Status::AwaitingAi;
        Ok(())
    }

    fn dispatch_ask(
        &mut self,
        prompt_expr: &ast::Expr,
        target_type: Option<TypeAnnotation>,
        cont: Cont,
        loc: &Location,
    ) -> Result<(), VibeError> {
        let prompt_text = match eval::eval_expr(self, prompt_expr)? {
            Value::Text(s) | Value::Prompt(s) => s,
            other => {
                return Err(VibeError::type_error(
                    format!("ask prompt must be text, got {}", other.type_tag()),
                    loc.clone(),
                ))
            }
        };
        self.pending_user = Some(PendingUser {
            prompt: prompt_text,
            target_type,
            cont,
            loc: loc.clone(),
        });
        self.status = Status::AwaitingUser;
        Ok(())
    }

    fn dispatch_ts(
        &mut self,
        params: &[String],
        body: &str,
        cont: Cont,
        loc: &Location,
    ) -> Result<(), VibeError> {
        let mut param_values = Vec::with_capacity(params.len());
        for p in params {
            let v = eval::lookup(self, p, loc)?;
            param_values.push(v.to_display_json());
        }
        self.pending_ts = Some(PendingTs {
            params: params.to_vec(),
            param_values,
            body: body.to_string(),
            cont,
            loc: loc.clone(),
        });
        self.status = Status::AwaitingTs;
        Ok(())
    }

    fn apply_cont(
        &mut self,
        cont: Cont,
        value: Value,
        source: Source,
        loc: &Location,
    ) -> Result<(), VibeError> {
        match cont {
            Cont::Let { name, ty } => self.bind_new(name, ty, value, false, source, loc),
            Cont::Const { name, ty } => self.bind_new(name, ty, value, true, source, loc),
            Cont::Destructure { names } => match value {
                Value::Array(items) => {
                    for (i, name) in names.into_iter().enumerate() {
                        let v = items.get(i).cloned().unwrap_or(Value::Null);
                        self.bind_new(name, None, v, false, source, loc)?;
                    }
                    Ok(())
                }
                other => Err(VibeError::type_error(
                    format!("expected an array to destructure, got {}", other.type_tag()),
                    loc.clone(),
                )),
            },
            Cont::Assign(target) => self.assign_into(&target, value, source),
            Cont::Discard => Ok(()),
            Cont::Return => self.do_return(value, loc),
        }
    }

    fn bind_new(
        &mut self,
        name: impl Into<String>,
        ty: Option<TypeAnnotation>,
        value: Value,
        is_const: bool,
        source: Source,
        loc: &Location,
    ) -> Result<(), VibeError> {
        let name = name.into();
        let (validated, final_ty) = match ty {
            Some(t) => {
                let v = self
                    .type_registry
                    .validate_value(&value, &t)
                    .map_err(|e| VibeError::type_error(e, loc.clone()))?;
                (v, Some(t))
            }
            None => {
                let inferred = self.type_registry.infer_from_host_value(&value.to_display_json());
                (value, inferred)
            }
        };
        let depth = self.frames.depth().saturating_sub(1);
        let frame = self.current_frame_mut()?;
        frame.declare(
            name,
            Binding {
                value: validated,
                ty: final_ty,
                is_const,
                source,
                declared_at_depth: depth,
            },
        );
        Ok(())
    }

    /// Writes `new_value` at `target`, recursing through member/index
    /// accessors until it bottoms out at the identifier that actually owns
    /// the binding, then rebuilds and reassigns each enclosing container in
    /// turn. Type validation only happens at that final identifier write,
    /// against its originally declared slot type.
    fn assign_into(&mut self, target: &ast::Expr, new_value: Value, source: Source) -> Result<(), VibeError> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                let existing = self.current_frame_mut()?.local(name).cloned();
                let existing = match existing {
                    Some(b) => b,
                    None => return self.assign_into_entry_frame(name, new_value, source, &target.loc),
                };
                if existing.is_const {
                    return Err(VibeError::type_error(
                        format!("cannot reassign const `{name}`"),
                        target.loc.clone(),
                    ));
                }
                let validated = match &existing.ty {
                    Some(ty) => self
                        .type_registry
                        .validate_value(&new_value, ty)
                        .map_err(|e| VibeError::type_error(e, target.loc.clone()))?,
                    None => new_value,
                };
                let frame = self.current_frame_mut()?;
                frame.push_variable(name.clone(), validated.clone(), existing.ty.clone(), source);
                let binding = frame
                    .local_mut(name)
                    .expect("checked present above");
                binding.value = validated;
                binding.source = source;
                Ok(())
            }
            ExprKind::MemberExpression { object, property } => {
                let base = eval::eval_expr(self, object)?;
                let updated = match base {
                    Value::Json(mut map) => {
                        map.insert(property.clone(), new_value.to_display_json());
                        Value::Json(map)
                    }
                    other => {
                        return Err(VibeError::type_error(
                            format!("cannot assign property `{property}` on {}", other.type_tag()),
                            target.loc.clone(),
                        ))
                    }
                };
                self.assign_into(object, updated, source)
            }
            ExprKind::IndexExpression { object, index } => {
                let base = eval::eval_expr(self, object)?;
                let idx = eval::eval_expr(self, index)?;
                let updated = match (base, idx) {
                    (Value::Array(mut items), Value::Number(n)) => {
                        if n < 0.0 {
                            return Err(VibeError::type_error(
                                "array index must not be negative",
                                target.loc.clone(),
                            ));
                        }
                        let i = n as usize;
                        if i >= items.len() {
                            items.resize(i + 1, Value::Null);
                        }
                        items[i] = new_value;
                        Value::Array(items)
                    }
                    (Value::Json(mut map), Value::Text(key)) => {
                        map.insert(key, new_value.to_display_json());
                        Value::Json(map)
                    }
                    (other, _) => {
                        return Err(VibeError::type_error(
                            format!("cannot index-assign into {}", other.type_tag()),
                            target.loc.clone(),
                        ))
                    }
                };
                self.assign_into(object, updated, source)
            }
            _ => Err(VibeError::Internal(format!(
                "{}: invalid assignment target",
                target.loc
            ))),
        }
    }

    fn assign_into_entry_frame(
        &mut self,
        name: &str,
        new_value: Value,
        source: Source,
        loc: &Location,
    ) -> Result<(), VibeError> {
        if self.current_frame_mut()?.depth == 0 {
            return Err(VibeError::reference(name, loc.clone()));
        }
        let existing = self
            .frames
            .chain()
            .first()
            .and_then(|f| f.local(name))
            .cloned();
        let Some(existing) = existing else {
            return Err(VibeError::reference(name, loc.clone()));
        };
        if existing.is_const {
            return Err(VibeError::type_error(
                format!("cannot reassign const `{name}`"),
                loc.clone(),
            ));
        }
        let validated = match &existing.ty {
            Some(ty) => self
                .type_registry
                .validate_value(&new_value, ty)
                .map_err(|e| VibeError::type_error(e, loc.clone()))?,
            None => new_value,
        };
        let entry = self
            .frames
            .entry_frame_mut()
            .expect("checked present above");
        entry.push_variable(name.to_string(), validated.clone(), existing.ty.clone(), source);
        let binding = entry.local_mut(name).expect("checked present above");
        binding.value = validated;
        binding.source = source;
        Ok(())
    }

    fn validate_return(
        &self,
        popped: &Frame,
        value: &Value,
        loc: &Location,
    ) -> Result<Value, VibeError> {
        match &popped.return_ty {
            Some(ty) => self
                .type_registry
                .validate_value(value, ty)
                .map_err(|e| VibeError::type_error(e, loc.clone())),
            None => Ok(value.clone()),
        }
    }

    /// `return <value>` (§4.F): unwinds the instruction stack to the
    /// nearest [`Instruction::FrameExit`], discarding any loop/scope
    /// bookkeeping instructions in between. Returning past the entry frame
    /// (no `FrameExit` left to find) ends the program.
    fn do_return(&mut self, value: Value, loc: &Location) -> Result<(), VibeError> {
        let mut cont = None;
        while let Some(instr) = self.instructions.pop() {
            if let Instruction::FrameExit { cont: c } = instr {
                cont = Some(c);
                break;
            }
        }
        match cont {
            Some(cont) => {
                let popped = self
                    .frames
                    .pop()
                    .ok_or_else(|| VibeError::Internal("frame stack underflow".into()))?;
                let validated = self.validate_return(&popped, &value, loc)?;
                self.last_result = Some(validated.clone());
                self.apply_cont(cont, validated, Source::Code, &popped.location)
            }
            None => {
                self.last_result = Some(value.clone());
                self.final_result = Some(value);
                self.instructions.clear();
                self.status = Status::Completed;
                Ok(())
            }
        }
    }

    /// Applies the AI response to the pending `ai_call`'s continuation,
    /// logging the exchange into the (now-restored caller's) frame.
    fn resume_with_ai(&mut self, value: Value, response_text: String, kind: &'static str) {
        let Some(pending) = self.pending_ai.take() else {
            self.fail(VibeError::Internal("no pending ai call".into()));
            return;
        };
        if let Ok(frame) = self.current_frame_mut() {
            frame.push_prompt(kind, pending.prompt.clone());
        }
        self.ai_interactions.push(AiInteraction {
            kind,
            prompt: pending.prompt,
            response: response_text,
        });
        self.status = Status::Running;
        if let Err(e) = self.apply_cont(pending.cont, value, Source::Ai, &pending.loc) {
            self.fail(e);
        }
    }

    fn resume_with_user(&mut self, answer: String) {
        let Some(pending) = self.pending_user.take() else {
            self.fail(VibeError::Internal("no pending ask".into()));
            return;
        };
        let value = match &pending.target_type {
            Some(ty) => match self.type_registry.validate_value(&Value::Text(answer.clone()), ty) {
                Ok(v) => v,
                Err(e) => {
                    self.fail(VibeError::type_error(e, pending.loc));
                    return;
                }
            },
            None => Value::Text(answer.clone()),
        };
        if let Ok(frame) = self.current_frame_mut() {
            frame.push_prompt("ask", pending.prompt.clone());
        }
        self.ai_interactions.push(AiInteraction {
            kind: "ask",
            prompt: pending.prompt,
            response: answer,
        });
        self.status = Status::Running;
        if let Err(e) = self.apply_cont(pending.cont, value, Source::Ai, &pending.loc) {
            self.fail(e);
        }
    }

    fn resume_with_tool(&mut self, result: Result<JsonValue, ToolError>) {
        let Some(pending) = self.pending_tool.take() else {
            self.fail(VibeError::Internal("no pending tool call".into()));
            return;
        };
        let rendered = match &result {
            Ok(v) => Ok(v.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Ok(frame) = self.current_frame_mut() {
            frame.push_tool_call(pending.name.clone(), pending.args.clone(), rendered);
        }
        self.status = Status::Running;
        match result {
            Ok(json) => {
                let value = match self.type_registry.host_value_to_value(json, None) {
                    Ok(v) => v,
                    Err(e) => {
                        self.fail(VibeError::type_error(e, pending.loc));
                        return;
                    }
                };
                if let Err(e) = self.apply_cont(pending.cont, value, Source::Tool, &pending.loc) {
                    self.fail(e);
                }
            }
            // Tool failures are never fatal (§4.D "Errors are values"): the
            // call's result simply reads as null, with the failure already
            // folded into the ordered log above.
            Err(_) => {
                if let Err(e) = self.apply_cont(pending.cont, Value::Null, Source::Tool, &pending.loc) {
                    self.fail(e);
                }
            }
        }
    }

    fn resume_with_ts(&mut self, result: Result<JsonValue, HostFailure>) {
        let Some(pending) = self.pending_ts.take() else {
            self.fail(VibeError::Internal("no pending ts block".into()));
            return;
        };
        match result {
            Ok(json) => {
                let value = self.type_registry.host_value_to_value(json, None).unwrap_or(Value::Null);
                self.status = Status::Running;
                if let Err(e) = self.apply_cont(pending.cont, value, Source::Code, &pending.loc) {
                    self.fail(e);
                }
            }
            Err(failure) => self.fail(VibeError::Host {
                source: failure,
                location: pending.loc,
            }),
        }
    }
}

/// A call's argument list, as written at a statement's call site, folded
/// into the single JSON object a tool's schema validates against. Tool
/// calls take either no arguments or one object-literal argument whose
/// fields are the named parameters — see DESIGN.md for why this
/// simplification was made over guessing a positional-to-named mapping.
fn build_tool_call_args(values: &[Value], loc: &Location) -> Result<JsonValue, VibeError> {
    match values {
        [] => Ok(JsonValue::Object(Map::new())),
        [Value::Json(map)] => Ok(JsonValue::Object(map.clone())),
        _ => Err(VibeError::type_error(
            "tool calls take either no arguments or a single object literal of named arguments",
            loc.clone(),
        )),
    }
}

fn tool_parameters_schema(params: &[Param]) -> JsonValue {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for p in params {
        let schema = match &p.ty {
            Some(ty) => crate::ai::json_schema_for(ty),
            None => serde_json::json!({}),
        };
        properties.insert(p.name.clone(), schema);
        required.push(JsonValue::String(p.name.clone()));
    }
    serde_json::json!({
        "type": "object",
        "properties": JsonValue::Object(properties),
        "required": JsonValue::Array(required),
    })
}

/// Registers every top-level `tool` declaration into `registry` before
/// driving begins (§4.C): the registry is the sole source of truth for
/// AI-visible tool schemas, so this must happen before the first `ai_call`
/// that might request one of them.
async fn register_declared_tools(top_level: &[Stmt], registry: &ToolRegistry) {
    for s in top_level {
        if let StmtKind::ToolDeclaration {
            name,
            params,
            return_ty,
            description,
            body,
        } = &s.kind
        {
            let schema = tool_parameters_schema(params);
            registry
                .register_vibe_defined(
                    name.clone(),
                    description.clone(),
                    params.clone(),
                    return_ty.clone(),
                    body.clone(),
                    schema,
                )
                .await;
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs a whole program to completion (§1 "External interfaces"): registers
/// `tool` declarations, then drives the state machine across every
/// suspension until it terminates.
pub async fn run(
    top_level: Vec<Stmt>,
    options: RunOptions,
    ai: &dyn AiProvider,
    host: &dyn HostEvaluator,
    registry: &ToolRegistry,
) -> Result<Value, VibeError> {
    run_with_interactions(top_level, options, ai, host, registry)
        .await
        .0
}

/// Same as [`run`], but also hands back every AI/ask exchange recorded on
/// the entry frame along the way — even when the program ultimately fails —
/// so a driver with `--log-ai`-style output has something to write without
/// needing to drive the state machine itself (§6 "Persisted state").
pub async fn run_with_interactions(
    top_level: Vec<Stmt>,
    options: RunOptions,
    ai: &dyn AiProvider,
    host: &dyn HostEvaluator,
    registry: &ToolRegistry,
) -> (Result<Value, VibeError>, Vec<AiInteraction>) {
    register_declared_tools(&top_level, registry).await;
    let mut state = RuntimeState::new(top_level, options);
    drive(&mut state, ai, host, registry).await;
    let interactions = state.ai_interactions.clone();
    let result = match state.status {
        Status::Completed => Ok(state.final_result.unwrap_or(Value::Null)),
        Status::Failed => Err(state
            .error
            .unwrap_or_else(|| VibeError::Internal("unknown failure".into()))),
        _ => unreachable!("drive only returns once status is terminal"),
    };
    (result, interactions)
}

/// The async driver: alternates between draining runnable instructions and
/// crossing whichever suspension the machine stopped at. Boxed because it
/// recurses indirectly through [`execute_tool_call`] when a Vibe-defined
/// tool body itself suspends on an `ai_call`/`ts_eval`/nested tool call.
fn drive<'a>(
    state: &'a mut RuntimeState,
    ai: &'a dyn AiProvider,
    host: &'a dyn HostEvaluator,
    registry: &'a ToolRegistry,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        loop {
            if state.options.cancel.load(Ordering::SeqCst) {
                state.pending_ai = None;
                state.pending_user = None;
                state.pending_tool = None;
                state.pending_ts = None;
                state.fail(VibeError::Cancelled);
                return;
            }
            state.run_to_suspension();
            match state.status {
                Status::Completed | Status::Failed => return,
                Status::AwaitingAi => run_ai_round(state, ai, host, registry).await,
                Status::AwaitingUser => run_ask(state, ai).await,
                Status::AwaitingTool => run_tool(state, ai, host, registry).await,
                Status::AwaitingTs => run_ts(state, host).await,
                Status::Running => unreachable!("run_to_suspension only returns on a non-running status"),
            }
        }
    })
}

async fn run_ask(state: &mut RuntimeState, ai: &dyn AiProvider) {
    let pending = state
        .pending_user
        .as_ref()
        .expect("invariant: AwaitingUser implies pending_user is set")
        .clone();
    match ai.ask_user(&pending.prompt).await {
        Ok(answer) => state.resume_with_user(answer),
        Err(e) => {
            state.pending_user = None;
            state.fail(VibeError::Ai {
                source: e,
                location: pending.loc,
            });
        }
    }
}

async fn run_ts(state: &mut RuntimeState, host: &dyn HostEvaluator) {
    let pending = state
        .pending_ts
        .as_ref()
        .expect("invariant: AwaitingTs implies pending_ts is set")
        .clone();
    let ts_timeout = state.options.ts_timeout;
    let result = match tokio::time::timeout(
        ts_timeout,
        host.evaluate(&pending.params, &pending.param_values, &pending.body),
    )
    .await
    {
        Ok(r) => r,
        Err(_elapsed) => {
            state.pending_ts = None;
            state.fail(VibeError::Timeout {
                millis: ts_timeout.as_millis() as u64,
                location: pending.loc,
            });
            return;
        }
    };
    state.resume_with_ts(result);
}

async fn run_tool(
    state: &mut RuntimeState,
    ai: &dyn AiProvider,
    host: &dyn HostEvaluator,
    registry: &ToolRegistry,
) {
    let pending = state
        .pending_tool
        .as_ref()
        .expect("invariant: AwaitingTool implies pending_tool is set")
        .clone();
    let tool_timeout = state.options.tool_timeout;
    let result = match tokio::time::timeout(
        tool_timeout,
        execute_tool_call(&pending.name, pending.args.clone(), ai, host, registry, state.options.clone()),
    )
    .await
    {
        Ok(r) => r,
        Err(_elapsed) => {
            state.pending_tool = None;
            state.fail(VibeError::Timeout {
                millis: tool_timeout.as_millis() as u64,
                location: pending.loc,
            });
            return;
        }
    };
    if let Err(ToolError::NotFound(_)) = &result {
        // No such function and no such tool: this is a reference error, not
        // a tool failure — there is nothing to fold into the context log.
        state.pending_tool = None;
        state.fail(VibeError::reference(pending.name, pending.loc));
        return;
    }
    state.resume_with_tool(result);
}

/// Runs one tool call to completion, whichever kind it turns out to be.
/// Native tools run directly; a Vibe-defined tool gets its own isolated
/// [`RuntimeState`] driven to termination right here, so it can itself
/// suspend on an `ai_call`/`ts_eval`/nested tool call without the outer
/// caller's `ai_call` continuing early (§4.C "Tool bodies run as any call").
fn execute_tool_call<'a>(
    name: &'a str,
    args: JsonValue,
    ai: &'a dyn AiProvider,
    host: &'a dyn HostEvaluator,
    registry: &'a ToolRegistry,
    options: RunOptions,
) -> BoxFuture<'a, Result<JsonValue, ToolError>> {
    Box::pin(async move {
        if registry.is_native(name).await {
            return registry.call_native(name, args).await;
        }
        let Some((params, return_ty, body)) = registry.vibe_defined_body(name).await else {
            return Err(ToolError::NotFound(name.to_string()));
        };
        let mut ephemeral =
            RuntimeState::new_tool_body(name.to_string(), params, return_ty, body, args, options)
                .map_err(|e| ToolError::Other(e.to_string()))?;
        drive(&mut ephemeral, ai, host, registry).await;
        match ephemeral.status {
            Status::Completed => Ok(ephemeral.final_result.unwrap_or(Value::Null).to_display_json()),
            Status::Failed => Err(ToolError::Other(
                ephemeral
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "tool body failed".to_string()),
            )),
            _ => Err(ToolError::Other("tool body did not terminate".to_string())),
        }
    })
}

/// Folds tool-call observations back into the prompt text for the next
/// round. [`crate::ai::AiProvider::invoke`] is a single request/response
/// call with no notion of an ongoing conversation, so the tool-calling loop
/// re-sends the original prompt plus every observation gathered so far
/// rather than relying on provider-side conversation state (see DESIGN.md).
fn render_prompt_with_observations(
    prompt: &str,
    observations: &[(String, JsonValue, Result<JsonValue, ToolError>)],
) -> String {
    if observations.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from(prompt);
    out.push_str("\n\nTool results so far:\n");
    for (name, args, result) in observations {
        match result {
            Ok(v) => out.push_str(&format!("- {name}({args}) -> {v}\n")),
            Err(e) => out.push_str(&format!("- {name}({args}) -> [error] {e}\n")),
        }
    }
    out
}

async fn run_ai_round(
    state: &mut RuntimeState,
    ai: &dyn AiProvider,
    host: &dyn HostEvaluator,
    registry: &ToolRegistry,
) {
    let pending = state
        .pending_ai
        .as_ref()
        .expect("invariant: AwaitingAi implies pending_ai is set")
        .clone();

    let mut tool_specs = Vec::new();
    for name in &pending.tool_names {
        if let Some(spec) = registry.spec(name).await {
            tool_specs.push(spec);
        }
    }

    let retry_cfg = state.options.retry.clone();
    let ai_timeout = state.options.ai_timeout;
    let tool_timeout = state.options.tool_timeout;
    let max_tool_rounds = state.options.max_tool_rounds;

    // The whole round — every retried `invoke` and every tool call it
    // triggers, across as many tool-calling rounds as the model asks for —
    // is bounded by the one overall `ai_call` timeout (§5 "Timeouts"); each
    // individual tool dispatch inside it additionally gets its own
    // `tool_timeout`, since a single slow tool shouldn't have to exhaust the
    // whole round's budget before the run fails.
    let round = async {
        let mut observations: Vec<(String, JsonValue, Result<JsonValue, ToolError>)> = Vec::new();
        let mut rounds: u32 = 0;
        loop {
            let request = AiRequest {
                model: pending.model.clone(),
                prompt: render_prompt_with_observations(&pending.prompt, &observations),
                context: pending.context_text.clone(),
                target_type: pending.target_type.clone(),
                tools: tool_specs.clone(),
            };
            let response = match retry::with_retry(&retry_cfg, || ai.invoke(&request)).await {
                Ok(r) => r,
                Err(e) => {
                    return Err(VibeError::Ai {
                        source: e,
                        location: pending.loc.clone(),
                    })
                }
            };
            match response.output {
                AiOutput::Message(text) => break Ok(text),
                AiOutput::ToolCalls(calls) => {
                    rounds += 1;
                    if rounds > max_tool_rounds {
                        return Err(VibeError::Ai {
                            source: AiError::Fatal("tool-call round cap exceeded".into()),
                            location: pending.loc.clone(),
                        });
                    }
                    for call in calls {
                        let outcome = match tokio::time::timeout(
                            tool_timeout,
                            execute_tool_call(
                                &call.name,
                                call.arguments.clone(),
                                ai,
                                host,
                                registry,
                                state.options.clone(),
                            ),
                        )
                        .await
                        {
                            Ok(r) => r,
                            Err(_elapsed) => {
                                return Err(VibeError::Timeout {
                                    millis: tool_timeout.as_millis() as u64,
                                    location: pending.loc.clone(),
                                })
                            }
                        };
                        let rendered = match &outcome {
                            Ok(v) => Ok(v.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        if let Ok(frame) = state.current_frame_mut() {
                            frame.push_tool_call(call.name.clone(), call.arguments.clone(), rendered);
                        }
                        observations.push((call.name, call.arguments, outcome));
                    }
                }
            }
        }
    };

    let final_text = match tokio::time::timeout(ai_timeout, round).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            state.pending_ai = None;
            state.fail(e);
            return;
        }
        Err(_elapsed) => {
            state.pending_ai = None;
            state.fail(VibeError::Timeout {
                millis: ai_timeout.as_millis() as u64,
                location: pending.loc.clone(),
            });
            return;
        }
    };

    let needs_json = pending
        .target_type
        .as_ref()
        .map(|t| t.array_depth > 0 || !matches!(t.base.as_str(), "text"))
        .unwrap_or(false);
    let raw_json: JsonValue = if needs_json {
        serde_json::from_str(&final_text).unwrap_or_else(|_| JsonValue::String(final_text.clone()))
    } else {
        JsonValue::String(final_text.clone())
    };
    let unwrapped = crate::ai::unwrap_structured_output(pending.target_type.as_ref(), raw_json);
    let value = match state.type_registry.host_value_to_value(unwrapped, pending.target_type.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            state.pending_ai = None;
            state.fail(VibeError::type_error(e, pending.loc));
            return;
        }
    };

    let kind = match pending.kind {
        ast::AiCallKind::Do => "do",
        ast::AiCallKind::Vibe => "vibe",
    };
    state.resume_with_ai(value, final_text, kind);
}

/// End-to-end scenarios straight out of spec.md §8, exercised against a
/// hand-built AST (no lexer/parser in scope — see module doc). Kept in the
/// same module as [`RuntimeState`] rather than an external `tests/`
/// directory so they can reach `drive`/`resume_with_*`/`frames` directly,
/// the same way an `AgentRunner`'s own tests sit alongside the
/// runner itself.
#[cfg(test)]
mod scenario_tests {
    use super::ast::{AiCallKind, BinaryOp, Expr};
    use super::*;
    use crate::ai::mock::MockAiProvider;
    use crate::ai::ToolCallRequest;
    use crate::host::HostFailureKind;
    use std::sync::Mutex;

    fn loc() -> Location {
        Location::synthetic()
    }
    fn num(n: f64) -> Expr {
        Expr::new(ExprKind::NumberLiteral(n), loc())
    }
    fn str_lit(s: &str) -> Expr {
        Expr::new(ExprKind::StringLiteral(s.to_string()), loc())
    }
    fn ident(name: &str) -> Expr {
        Expr::new(ExprKind::Identifier(name.to_string()), loc())
    }
    fn bin(op: BinaryOp, l: Expr, r: Expr) -> Expr {
        Expr::new(
            ExprKind::BinaryExpression {
                op,
                left: Box::new(l),
                right: Box::new(r),
            },
            loc(),
        )
    }
    fn array_lit(items: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::ArrayLiteral(items), loc())
    }
    fn object_lit(fields: Vec<(&str, Expr)>) -> Expr {
        Expr::new(
            ExprKind::ObjectLiteral(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
            loc(),
        )
    }
    fn ai_call(
        kind: AiCallKind,
        prompt: Expr,
        model: &str,
        context: ContextKind,
        target_type: Option<TypeAnnotation>,
    ) -> Expr {
        Expr::new(
            ExprKind::VibeExpression {
                kind,
                prompt: Box::new(prompt),
                model: model.to_string(),
                context,
                target_type,
            },
            loc(),
        )
    }
    fn ts_block(params: Vec<&str>, body: &str) -> Expr {
        Expr::new(
            ExprKind::TsBlock {
                params: params.into_iter().map(String::from).collect(),
                body: body.to_string(),
            },
            loc(),
        )
    }
    fn call_expr(name: &str, args: Vec<Expr>) -> Expr {
        Expr::new(
            ExprKind::CallExpression {
                callee: Box::new(ident(name)),
                args,
            },
            loc(),
        )
    }
    fn let_stmt(name: &str, ty: Option<TypeAnnotation>, init: Expr) -> Stmt {
        Stmt::new(
            StmtKind::LetDeclaration {
                name: name.to_string(),
                ty,
                init: Some(init),
            },
            loc(),
        )
    }
    fn const_stmt(name: &str, ty: Option<TypeAnnotation>, init: Expr) -> Stmt {
        Stmt::new(
            StmtKind::ConstDeclaration {
                name: name.to_string(),
                ty,
                init,
            },
            loc(),
        )
    }
    fn expr_stmt(e: Expr) -> Stmt {
        Stmt::new(StmtKind::ExpressionStatement(e), loc())
    }
    fn model_decl(name: &str, fields: Vec<(&str, Expr)>) -> Stmt {
        Stmt::new(
            StmtKind::ModelDeclaration {
                name: name.to_string(),
                fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            },
            loc(),
        )
    }
    fn function_decl(name: &str, params: Vec<Param>, body: Vec<Stmt>) -> Stmt {
        Stmt::new(
            StmtKind::FunctionDeclaration {
                name: name.to_string(),
                params,
                return_ty: None,
                body,
            },
            loc(),
        )
    }
    fn tool_decl(name: &str, params: Vec<Param>, return_ty: Option<TypeAnnotation>, body: ToolBody) -> Stmt {
        Stmt::new(
            StmtKind::ToolDeclaration {
                name: name.to_string(),
                params,
                return_ty,
                description: None,
                body,
            },
            loc(),
        )
    }
    fn param(name: &str, ty: &str) -> Param {
        Param {
            name: name.to_string(),
            ty: Some(TypeAnnotation::scalar(ty)),
        }
    }

    struct ScriptedHost {
        script: Mutex<Vec<Result<JsonValue, HostFailure>>>,
    }
    impl ScriptedHost {
        fn new(script: Vec<Result<JsonValue, HostFailure>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().rev().collect()),
            }
        }
    }
    #[async_trait::async_trait]
    impl HostEvaluator for ScriptedHost {
        async fn evaluate(
            &self,
            _params: &[String],
            _values: &[JsonValue],
            _body: &str,
        ) -> Result<JsonValue, HostFailure> {
            self.script.lock().unwrap().pop().expect("ScriptedHost script exhausted")
        }
    }

    /// S1 — pure arithmetic: `let x: number = 2 + 3 * 4; x`.
    #[tokio::test]
    async fn s1_pure_arithmetic() {
        let top = vec![
            let_stmt(
                "x",
                Some(TypeAnnotation::scalar("number")),
                bin(BinaryOp::Add, num(2.0), bin(BinaryOp::Mul, num(3.0), num(4.0))),
            ),
            expr_stmt(ident("x")),
        ];
        let ai = MockAiProvider::new(vec![]);
        let host = crate::host::UnconfiguredHostEvaluator;
        let registry = ToolRegistry::new();
        let result = run(top, RunOptions::default(), &ai, &host, &registry)
            .await
            .unwrap();
        assert_eq!(result, Value::Number(14.0));
    }

    /// S2 — AI round-trip: `model m = {...}; let r: text = do "hi" m default; r`.
    #[tokio::test]
    async fn s2_ai_round_trip() {
        let top = vec![
            model_decl("m", vec![("provider", str_lit("test"))]),
            let_stmt(
                "r",
                Some(TypeAnnotation::scalar("text")),
                ai_call(
                    AiCallKind::Do,
                    str_lit("hi"),
                    "m",
                    ContextKind::Default,
                    Some(TypeAnnotation::scalar("text")),
                ),
            ),
            expr_stmt(ident("r")),
        ];
        let ai = MockAiProvider::message("HELLO");
        let host = crate::host::UnconfiguredHostEvaluator;
        let registry = ToolRegistry::new();

        register_declared_tools(&top, &registry).await;
        let mut state = RuntimeState::new(top, RunOptions::default());
        drive(&mut state, &ai, &host, &registry).await;

        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.final_result, Some(Value::Text("HELLO".into())));

        let entry = state.frames.chain().first().unwrap();
        let has_prompt = entry
            .entries
            .iter()
            .any(|e| matches!(e, crate::context::OrderedEntry::Prompt { ai_type, text } if *ai_type == "do" && text == "hi"));
        assert!(has_prompt, "expected a do-prompt ordered entry");
        let r_is_from_ai = entry.local("r").map(|b| b.source) == Some(Source::Ai);
        assert!(r_is_from_ai);

        let rendered = state.frames.global_context(&ContextOptions::for_ai());
        assert!(!rendered.contains("- m"), "model m must be filtered from context");
        assert!(rendered.contains("--> do: \"hi\""));
        assert!(rendered.contains("<-- r: \"HELLO\""));
    }

    /// S3 — tool-use round: the AI requests `randomNumber`, observes `42`, answers `"42"`.
    #[tokio::test]
    async fn s3_tool_use_round() {
        let top = vec![
            tool_decl(
                "randomNumber",
                vec![param("min", "number"), param("max", "number")],
                Some(TypeAnnotation::scalar("number")),
                ToolBody::Ts {
                    params: vec!["min".into(), "max".into()],
                    body: "return 42".into(),
                },
            ),
            model_decl(
                "m",
                vec![
                    ("provider", str_lit("test")),
                    ("tools", array_lit(vec![str_lit("randomNumber")])),
                ],
            ),
            let_stmt(
                "r",
                Some(TypeAnnotation::scalar("text")),
                ai_call(
                    AiCallKind::Do,
                    str_lit("roll"),
                    "m",
                    ContextKind::Default,
                    Some(TypeAnnotation::scalar("text")),
                ),
            ),
            expr_stmt(ident("r")),
        ];
        let ai = MockAiProvider::new(vec![
            Ok(AiOutput::ToolCalls(vec![ToolCallRequest {
                id: "1".into(),
                name: "randomNumber".into(),
                arguments: serde_json::json!({"min": 1, "max": 100}),
            }])),
            Ok(AiOutput::Message("42".into())),
        ]);
        let host = ScriptedHost::new(vec![Ok(serde_json::json!(42))]);
        let registry = ToolRegistry::new();

        register_declared_tools(&top, &registry).await;
        let mut state = RuntimeState::new(top, RunOptions::default());
        drive(&mut state, &ai, &host, &registry).await;

        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.final_result, Some(Value::Text("42".into())));

        let entry = state.frames.chain().first().unwrap();
        let tool_call_ok = entry.entries.iter().any(|e| matches!(
            e,
            crate::context::OrderedEntry::ToolCall { name, result: Ok(r), .. }
                if name == "randomNumber" && r == "42"
        ));
        assert!(tool_call_ok, "expected a recorded tool-call entry for randomNumber -> 42");
    }

    /// S4 — sandbox violation is non-fatal: a direct call to the built-in
    /// `readFile` tool with a `..`-escaping path is rejected by
    /// [`crate::tools::sandbox::resolve_path_under`], but per §4.D "Errors
    /// are values" that failure folds into the ordered log as a failed
    /// `ToolCall` rather than ending the run.
    #[tokio::test]
    async fn s4_sandbox_violation_is_non_fatal() {
        let top = vec![
            expr_stmt(call_expr(
                "readFile",
                vec![object_lit(vec![("path", str_lit("../outside.txt"))])],
            )),
            expr_stmt(num(1.0)),
        ];
        let ai = MockAiProvider::new(vec![]);
        let host = crate::host::UnconfiguredHostEvaluator;
        let registry = ToolRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let working_folder = Arc::new(tmp.path().to_path_buf());
        crate::tools::builtin::register_builtins(&registry, working_folder).await;

        let mut state = RuntimeState::new(top, RunOptions::default());
        drive(&mut state, &ai, &host, &registry).await;

        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.final_result, Some(Value::Number(1.0)));

        let entry = state.frames.chain().first().unwrap();
        let violation_logged = entry.entries.iter().any(|e| matches!(
            e,
            crate::context::OrderedEntry::ToolCall { name, result: Err(_), .. }
                if name == "readFile"
        ));
        assert!(
            violation_logged,
            "expected a failed ToolCall entry for the sandbox-escaping readFile call"
        );
    }

    /// S5 — ts_eval validation: `let n: number = ts(x){ return "oops" }` fails,
    /// and the failed `bind_let` leaves no `n` entry in the ordered log.
    #[tokio::test]
    async fn s5_ts_eval_type_mismatch_fails_without_logging() {
        let top = vec![
            let_stmt("x", None, num(5.0)),
            let_stmt(
                "n",
                Some(TypeAnnotation::scalar("number")),
                ts_block(vec!["x"], "return 'oops'"),
            ),
            expr_stmt(ident("n")),
        ];
        let ai = MockAiProvider::new(vec![]);
        let host = ScriptedHost::new(vec![Ok(serde_json::json!("oops"))]);
        let registry = ToolRegistry::new();

        register_declared_tools(&top, &registry).await;
        let mut state = RuntimeState::new(top, RunOptions::default());
        drive(&mut state, &ai, &host, &registry).await;

        assert_eq!(state.status, Status::Failed);
        assert!(matches!(state.error, Some(VibeError::Type { .. })));
        let entry = state.frames.chain().first().unwrap();
        assert!(entry.local("n").is_none());
        assert!(!entry
            .entries
            .iter()
            .any(|e| matches!(e, crate::context::OrderedEntry::Variable { name, .. } if name == "n")));
    }

    /// A host-reported compile/runtime failure surfaces as `VibeError::Host`.
    #[tokio::test]
    async fn ts_eval_host_failure_is_fatal() {
        let top = vec![let_stmt(
            "n",
            Some(TypeAnnotation::scalar("number")),
            ts_block(vec![], "syntax error"),
        )];
        let ai = MockAiProvider::new(vec![]);
        let host = ScriptedHost::new(vec![Err(HostFailure {
            kind: HostFailureKind::Compile,
            message: "unexpected token".into(),
            stack: None,
        })]);
        let registry = ToolRegistry::new();
        register_declared_tools(&top, &registry).await;
        let mut state = RuntimeState::new(top, RunOptions::default());
        drive(&mut state, &ai, &host, &registry).await;
        assert_eq!(state.status, Status::Failed);
        assert!(matches!(state.error, Some(VibeError::Host { .. })));
    }

    /// S6 — nested frames and context: entry declares `const G`, function `f`
    /// declares `l` then suspends on an AI call; `globalContext` sees both
    /// frames' entries in call order, `localContext` only the innermost.
    #[test]
    fn s6_nested_frames_and_context() {
        let top = vec![
            const_stmt("G", None, str_lit("g")),
            model_decl("m", vec![("provider", str_lit("test"))]),
            function_decl(
                "f",
                vec![param("input", "text")],
                vec![
                    let_stmt("l", None, str_lit("L")),
                    expr_stmt(ai_call(
                        AiCallKind::Do,
                        str_lit("p"),
                        "m",
                        ContextKind::Default,
                        Some(TypeAnnotation::scalar("text")),
                    )),
                ],
            ),
            expr_stmt(call_expr("f", vec![str_lit("hello")])),
        ];
        let mut state = RuntimeState::new(top, RunOptions::default());
        state.run_to_suspension();
        assert_eq!(state.status, Status::AwaitingAi);

        let opts = ContextOptions::for_ai();
        let global = state.frames.global_context(&opts);
        let local = state.frames.local_context(&opts);

        assert!(global.starts_with("<entry> (entry)"));
        assert!(global.contains("- G: \"g\""));
        assert!(!global.contains("- m"), "model m must be filtered");
        assert!(global.contains("f (current scope)"));
        assert!(global.contains("- input: \"hello\""));
        assert!(global.contains("- l: \"L\""));

        assert!(!local.contains("- G"));
        assert!(local.contains("- input"));
        assert!(local.contains("- l"));
    }
}
