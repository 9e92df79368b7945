//! Synchronous expression evaluation (§4.F "Stepping", the `exec_expression`
//! reducer). Handles every [`ExprKind`] except the four that can suspend
//! the machine (`VibeExpression`, `AskExpression`, `TsBlock`,
//! `CallExpression`) — those are recognized and dispatched one level up, at
//! the statement/condition boundary (see `RuntimeState::dispatch_value_expr`
//! and the module doc on [`super::instruction`]), since §4.F's instruction
//! vocabulary lists `call`/`ai_call`/`ts_eval` as instructions in their own
//! right, distinct from plain expression evaluation. By the time a tree
//! reaches this module, `RuntimeState::hoist_nested` has already hoisted any
//! occurrence of the four kinds out of every position except the root, so
//! `unsupported` below should only ever fire for a root the caller forgot to
//! hoist (a bug, not a reachable user-facing error) — not for ordinary
//! nested calls like `foo(bar(y))`, which by the time they arrive here have
//! already been rewritten to `foo(__hoist0)`.

use serde_json::{Map, Value as JsonValue};

use super::ast::{BinaryOp, Expr, ExprKind, Location, TemplatePart, UnaryOp};
use super::RuntimeState;
use crate::error::VibeError;
use crate::value::Value;

fn unsupported(kind: &str, loc: &Location) -> VibeError {
    VibeError::Internal(format!(
        "{loc}: `{kind}` may only appear as the direct value-expression of a statement, not \
         nested inside another expression"
    ))
}

/// Looks up `name`'s current value: innermost-out within the current
/// frame's block scopes, falling back to the entry frame's top-level
/// bindings when the current frame isn't the entry frame itself (§4.F
/// "Scopes": "falls back to top-level bindings... does not cross function
/// frames"). Block-scope shadowing is already resolved by [`Frame::local`]
/// since `pop_scope` removes out-of-scope names eagerly.
pub fn lookup(state: &RuntimeState, name: &str, loc: &Location) -> Result<Value, VibeError> {
    let current = state
        .frames
        .current()
        .ok_or_else(|| VibeError::Internal("no current frame".into()))?;
    if let Some(binding) = current.local(name) {
        return Ok(binding.value.clone());
    }
    if current.depth != 0 {
        if let Some(entry) = state.frames.chain().first() {
            if let Some(binding) = entry.local(name) {
                return Ok(binding.value.clone());
            }
        }
    }
    Err(VibeError::reference(name, loc.clone()))
}

pub fn eval_expr(state: &RuntimeState, expr: &Expr) -> Result<Value, VibeError> {
    match &expr.kind {
        ExprKind::Identifier(name) => lookup(state, name, &expr.loc),
        ExprKind::StringLiteral(s) => Ok(Value::Text(s.clone())),
        ExprKind::NumberLiteral(n) => Ok(Value::Number(*n)),
        ExprKind::BooleanLiteral(b) => Ok(Value::Boolean(*b)),
        ExprKind::NullLiteral => Ok(Value::Null),
        ExprKind::TemplateLiteral(parts) => Ok(Value::Text(interpolate(state, parts))),
        ExprKind::ArrayLiteral(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(state, item)?);
            }
            Ok(Value::Array(out))
        }
        ExprKind::ObjectLiteral(fields) => {
            let mut map = Map::new();
            for (key, value_expr) in fields {
                let value = eval_expr(state, value_expr)?;
                map.insert(key.clone(), value.to_display_json());
            }
            Ok(Value::Json(map))
        }
        ExprKind::BinaryExpression { op, left, right } => eval_binary(state, *op, left, right),
        ExprKind::UnaryExpression { op, operand } => eval_unary(state, *op, operand),
        ExprKind::MemberExpression { object, property } => {
            let base = eval_expr(state, object)?;
            member_get(&base, property, &expr.loc)
        }
        ExprKind::IndexExpression { object, index } => {
            let base = eval_expr(state, object)?;
            let idx = eval_expr(state, index)?;
            index_get(&base, &idx, &expr.loc)
        }
        ExprKind::AssignmentExpression { .. } => {
            Err(unsupported("assignment-as-expression", &expr.loc))
        }
        ExprKind::RangeExpression {
            start,
            end,
            inclusive,
        } => {
            let start = expect_number(eval_expr(state, start)?, &expr.loc)?;
            let end = expect_number(eval_expr(state, end)?, &expr.loc)?;
            let (lo, hi) = (start as i64, end as i64);
            let items: Vec<Value> = if *inclusive {
                (lo..=hi).map(|n| Value::Number(n as f64)).collect()
            } else {
                (lo..hi).map(|n| Value::Number(n as f64)).collect()
            };
            Ok(Value::Array(items))
        }
        ExprKind::CallExpression { .. } => Err(unsupported("call", &expr.loc)),
        ExprKind::VibeExpression { .. } => Err(unsupported("do/vibe", &expr.loc)),
        ExprKind::TsBlock { .. } => Err(unsupported("ts(...)", &expr.loc)),
        ExprKind::AskExpression { .. } => Err(unsupported("ask", &expr.loc)),
    }
}

/// `{name}` / `${name}` resolution (§4.F "String interpolation"):
/// unresolved placeholders are left literal.
pub fn interpolate(state: &RuntimeState, parts: &[TemplatePart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            TemplatePart::Text(s) => out.push_str(s),
            TemplatePart::Placeholder(name) => {
                let loc = Location::synthetic();
                match lookup(state, name, &loc) {
                    Ok(value) => out.push_str(&value.to_string()),
                    Err(_) => out.push_str(&format!("{{{name}}}")),
                }
            }
        }
    }
    out
}

fn expect_number(v: Value, loc: &Location) -> Result<f64, VibeError> {
    match v {
        Value::Number(n) => Ok(n),
        other => Err(VibeError::type_error(
            format!("expected number, got {}", other.type_tag()),
            loc.clone(),
        )),
    }
}

fn eval_unary(state: &RuntimeState, op: UnaryOp, operand: &Expr) -> Result<Value, VibeError> {
    let v = eval_expr(state, operand)?;
    match (op, v) {
        (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
        (UnaryOp::Not, Value::Boolean(b)) => Ok(Value::Boolean(!b)),
        (UnaryOp::Neg, other) => Err(VibeError::type_error(
            format!("cannot negate {}", other.type_tag()),
            operand.loc.clone(),
        )),
        (UnaryOp::Not, other) => Err(VibeError::type_error(
            format!("cannot logically negate {}", other.type_tag()),
            operand.loc.clone(),
        )),
    }
}

fn eval_binary(
    state: &RuntimeState,
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
) -> Result<Value, VibeError> {
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let l = expect_bool(eval_expr(state, left)?, &left.loc)?;
        if op == BinaryOp::And && !l {
            return Ok(Value::Boolean(false));
        }
        if op == BinaryOp::Or && l {
            return Ok(Value::Boolean(true));
        }
        let r = expect_bool(eval_expr(state, right)?, &right.loc)?;
        return Ok(Value::Boolean(r));
    }

    let l = eval_expr(state, left)?;
    let r = eval_expr(state, right)?;
    let loc = left.loc.clone();

    match op {
        BinaryOp::Add => match (&l, &r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Text(_) | Value::Prompt(_), _) | (_, Value::Text(_) | Value::Prompt(_)) => {
                Ok(Value::Text(format!("{l}{r}")))
            }
            _ => Err(VibeError::type_error(
                format!("cannot add {} and {}", l.type_tag(), r.type_tag()),
                loc,
            )),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let a = expect_number(l, &loc)?;
            let b = expect_number(r, &loc)?;
            let result = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a % b,
                _ => unreachable!(),
            };
            Ok(Value::Number(result))
        }
        BinaryOp::Eq => Ok(Value::Boolean(l == r)),
        BinaryOp::NotEq => Ok(Value::Boolean(l != r)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| {
                VibeError::type_error(
                    format!("cannot compare {} and {}", l.type_tag(), r.type_tag()),
                    loc.clone(),
                )
            })?;
            use std::cmp::Ordering::*;
            let result = match (op, ordering) {
                (BinaryOp::Lt, Less) => true,
                (BinaryOp::LtEq, Less | Equal) => true,
                (BinaryOp::Gt, Greater) => true,
                (BinaryOp::GtEq, Greater | Equal) => true,
                _ => false,
            };
            Ok(Value::Boolean(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn expect_bool(v: Value, loc: &Location) -> Result<bool, VibeError> {
    match v {
        Value::Boolean(b) => Ok(b),
        other => Err(VibeError::type_error(
            format!("expected boolean, got {}", other.type_tag()),
            loc.clone(),
        )),
    }
}

fn member_get(base: &Value, property: &str, loc: &Location) -> Result<Value, VibeError> {
    match base {
        Value::Json(map) => Ok(map
            .get(property)
            .map(|v| json_to_value(v.clone()))
            .unwrap_or(Value::Null)),
        other => Err(VibeError::type_error(
            format!("cannot read property `{property}` of {}", other.type_tag()),
            loc.clone(),
        )),
    }
}

fn index_get(base: &Value, index: &Value, loc: &Location) -> Result<Value, VibeError> {
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = *n as i64;
            if i < 0 || i as usize >= items.len() {
                return Ok(Value::Null);
            }
            Ok(items[i as usize].clone())
        }
        (Value::Json(map), Value::Text(key)) => Ok(map
            .get(key)
            .map(|v| json_to_value(v.clone()))
            .unwrap_or(Value::Null)),
        (other, _) => Err(VibeError::type_error(
            format!("cannot index into {}", other.type_tag()),
            loc.clone(),
        )),
    }
}

fn json_to_value(v: JsonValue) -> Value {
    match v {
        JsonValue::String(s) => Value::Text(s),
        JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::Bool(b) => Value::Boolean(b),
        JsonValue::Null => Value::Null,
        JsonValue::Object(map) => Value::Json(map),
        JsonValue::Array(items) => Value::Array(items.into_iter().map(json_to_value).collect()),
    }
}
