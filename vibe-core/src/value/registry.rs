//! The type registry: one [`TypeDescriptor`] per base type, recursion over
//! array nesting, and the assignability rules of §3/§4.A.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use super::{ModelRecord, Value};
use crate::interp::ast::TypeAnnotation;

/// Per-base-type behavior: host-value acceptance, text coercion, and the
/// post-validation hooks (`number` finiteness, `json` non-array).
pub trait TypeDescriptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts_null(&self) -> bool {
        true
    }

    /// Does this value already carry (or safely retag to) this base type?
    fn validate(&self, v: &Value) -> bool;

    /// Used when a `text` value is assigned into a non-`text` slot. Numeric
    /// slots deliberately return `None` here, to preserve predictability (§4.A).
    fn coerce_from_text(&self, _s: &str) -> Option<Result<Value, String>> {
        None
    }

    /// `number` finiteness, `json` non-array, etc. Runs after `validate`/`coerce`.
    fn post_validate(&self, _v: &Value) -> Result<(), String> {
        Ok(())
    }
}

struct TextType;
impl TypeDescriptor for TextType {
    fn name(&self) -> &'static str {
        "text"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Text(_) | Value::Prompt(_))
    }
}

struct PromptType;
impl TypeDescriptor for PromptType {
    fn name(&self) -> &'static str {
        "prompt"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Text(_) | Value::Prompt(_))
    }
}

struct NumberType;
impl TypeDescriptor for NumberType {
    fn name(&self) -> &'static str {
        "number"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Number(_))
    }
    fn post_validate(&self, v: &Value) -> Result<(), String> {
        match v {
            Value::Number(n) if !n.is_finite() => {
                Err("number must be finite (NaN/Infinity rejected)".to_string())
            }
            _ => Ok(()),
        }
    }
}

struct BooleanType;
impl TypeDescriptor for BooleanType {
    fn name(&self) -> &'static str {
        "boolean"
    }
    fn accepts_null(&self) -> bool {
        false
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Boolean(_))
    }
}

struct JsonType;
impl TypeDescriptor for JsonType {
    fn name(&self) -> &'static str {
        "json"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Json(_))
    }
    fn coerce_from_text(&self, s: &str) -> Option<Result<Value, String>> {
        Some(
            serde_json::from_str::<JsonValue>(s)
                .map_err(|e| format!("invalid json: {e}"))
                .and_then(|parsed| match parsed {
                    JsonValue::Object(map) => Ok(Value::Json(map)),
                    JsonValue::Array(_) => Err("json value must be an object, not an array".into()),
                    _ => Err("json value must be an object".into()),
                }),
        )
    }
    fn post_validate(&self, v: &Value) -> Result<(), String> {
        match v {
            Value::Json(_) => Ok(()),
            _ => Err("json value must be an object, not an array".to_string()),
        }
    }
}

struct NullType;
impl TypeDescriptor for NullType {
    fn name(&self) -> &'static str {
        "null"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Null)
    }
}

struct ModelType;
impl TypeDescriptor for ModelType {
    fn name(&self) -> &'static str {
        "model"
    }
    fn accepts_null(&self) -> bool {
        false
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Model(_))
    }
}

struct ToolType;
impl TypeDescriptor for ToolType {
    fn name(&self) -> &'static str {
        "tool"
    }
    fn accepts_null(&self) -> bool {
        false
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Tool(_))
    }
}

struct AiResultType;
impl TypeDescriptor for AiResultType {
    fn name(&self) -> &'static str {
        "ai_result"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::AiResult(_))
    }
}

/// Bridges host-produced values: object-like host types satisfy `json`,
/// primitive host types satisfy their direct Vibe counterpart (§4.A). `any`
/// accepts anything — used when a `ts(...)` result has no declared target type.
struct AnyType;
impl TypeDescriptor for AnyType {
    fn name(&self) -> &'static str {
        "any"
    }
    fn validate(&self, _v: &Value) -> bool {
        true
    }
}

/// One descriptor per base type, looked up by name. Built once at interpreter
/// construction, the same way a `ToolRegistry` is built once and
/// extended only by `tool` declarations (this registry is never extended).
pub struct TypeRegistry {
    descriptors: HashMap<&'static str, Box<dyn TypeDescriptor>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TypeRegistry {
    pub fn with_builtins() -> Self {
        let mut descriptors: HashMap<&'static str, Box<dyn TypeDescriptor>> = HashMap::new();
        for d in [
            Box::new(TextType) as Box<dyn TypeDescriptor>,
            Box::new(PromptType),
            Box::new(NumberType),
            Box::new(BooleanType),
            Box::new(JsonType),
            Box::new(NullType),
            Box::new(ModelType),
            Box::new(ToolType),
            Box::new(AiResultType),
            Box::new(AnyType),
        ] {
            descriptors.insert(d.name(), d);
        }
        Self { descriptors }
    }

    pub fn contains(&self, base: &str) -> bool {
        self.descriptors.contains_key(base)
    }

    fn descriptor(&self, base: &str) -> Option<&dyn TypeDescriptor> {
        self.descriptors.get(base).map(|b| b.as_ref())
    }

    /// `assignableFrom(src, tgt)` (§4.A), scalar (array nesting is handled by
    /// [`Self::validate_value`]'s recursion, not here).
    pub fn assignable_from(&self, src: &str, tgt: &str) -> bool {
        if src == tgt {
            return true;
        }
        match (src, tgt) {
            ("null", t) => t != "boolean",
            ("text", "prompt") | ("prompt", "text") => true,
            ("text", "json") => true,
            (_, "any") => true,
            _ => false,
        }
    }

    /// `validateValue(v, annotation) -> Ok(v') | Err(msg)` (§4.A), recursing
    /// through array nesting element-wise.
    pub fn validate_value(
        &self,
        v: &Value,
        annotation: &TypeAnnotation,
    ) -> Result<Value, String> {
        if annotation.array_depth > 0 {
            let Value::Array(items) = v else {
                return Err(format!("expected {annotation}, got {}", v.type_tag()));
            };
            let inner = TypeAnnotation {
                base: annotation.base.clone(),
                array_depth: annotation.array_depth - 1,
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(self.validate_value(item, &inner)?);
            }
            return Ok(Value::Array(out));
        }

        let descriptor = self
            .descriptor(&annotation.base)
            .ok_or_else(|| format!("unknown type: {}", annotation.base))?;

        if matches!(v, Value::Null) {
            return if descriptor.accepts_null() {
                Ok(Value::Null)
            } else {
                Err(format!("cannot assign null to {}", annotation.base))
            };
        }

        if descriptor.validate(v) {
            let retagged = match (v, annotation.base.as_str()) {
                (Value::Text(s), "prompt") => Value::Prompt(s.clone()),
                (Value::Prompt(s), "text") => Value::Text(s.clone()),
                _ => v.clone(),
            };
            descriptor
                .post_validate(&retagged)
                .map_err(|e| e.to_string())?;
            return Ok(retagged);
        }

        if let Value::Text(s) = v {
            if let Some(coerced) = descriptor.coerce_from_text(s) {
                let value = coerced?;
                descriptor
                    .post_validate(&value)
                    .map_err(|e| e.to_string())?;
                return Ok(value);
            }
        }

        Err(format!(
            "expected {annotation}, got {}",
            v.type_tag()
        ))
    }

    /// `inferFromHostValue(v) -> annotation?` — used for untyped declarations
    /// whose initializer produces a host primitive (§4.A).
    pub fn infer_from_host_value(&self, v: &JsonValue) -> Option<TypeAnnotation> {
        match v {
            JsonValue::String(_) => Some(TypeAnnotation::scalar("text")),
            JsonValue::Number(_) => Some(TypeAnnotation::scalar("number")),
            JsonValue::Bool(_) => Some(TypeAnnotation::scalar("boolean")),
            JsonValue::Null => Some(TypeAnnotation::scalar("null")),
            JsonValue::Object(_) => Some(TypeAnnotation::scalar("json")),
            JsonValue::Array(items) => {
                let elem = items.first().and_then(|i| self.infer_from_host_value(i));
                match elem {
                    Some(TypeAnnotation { base, array_depth }) => {
                        Some(TypeAnnotation::array_of(base, array_depth + 1))
                    }
                    None => Some(TypeAnnotation::array_of("json", 1)),
                }
            }
        }
    }

    /// Converts a host-produced JSON value into a [`Value`] for the given
    /// (optional) target annotation; infers when `annotation` is `None`.
    pub fn host_value_to_value(
        &self,
        v: JsonValue,
        annotation: Option<&TypeAnnotation>,
    ) -> Result<Value, String> {
        let value = json_to_value(v);
        match annotation {
            Some(a) => self.validate_value(&value, a),
            None => Ok(value),
        }
    }
}

/// Structural conversion from a host-produced JSON value into the closest
/// [`Value`] shape, before type validation runs.
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

/// Builds a `model` value from a declaration's field list (`provider` is
/// required; everything else is opaque config, per §9).
pub fn build_model_record(fields: &[(String, JsonValue)]) -> ModelRecord {
    let mut config = serde_json::Map::new();
    let mut provider = "unknown".to_string();
    let mut tools = Vec::new();
    for (k, v) in fields {
        if k == "provider" {
            if let JsonValue::String(s) = v {
                provider = s.clone();
            }
        } else if k == "tools" {
            if let JsonValue::Array(items) = v {
                tools = items
                    .iter()
                    .filter_map(|i| i.as_str().map(|s| s.to_string()))
                    .collect();
            }
        } else {
            config.insert(k.clone(), v.clone());
        }
    }
    ModelRecord {
        provider,
        config,
        tools,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignable_identity() {
        let r = TypeRegistry::with_builtins();
        assert!(r.assignable_from("text", "text"));
        assert!(r.assignable_from("json", "json"));
    }

    #[test]
    fn assignable_null_except_boolean() {
        let r = TypeRegistry::with_builtins();
        assert!(r.assignable_from("null", "text"));
        assert!(r.assignable_from("null", "json"));
        assert!(!r.assignable_from("null", "boolean"));
    }

    #[test]
    fn assignable_text_prompt_both_ways() {
        let r = TypeRegistry::with_builtins();
        assert!(r.assignable_from("text", "prompt"));
        assert!(r.assignable_from("prompt", "text"));
    }

    #[test]
    fn assignable_text_to_json_via_coerce() {
        let r = TypeRegistry::with_builtins();
        assert!(r.assignable_from("text", "json"));
    }

    #[test]
    fn number_rejects_nan_and_infinity() {
        let r = TypeRegistry::with_builtins();
        let ann = TypeAnnotation::scalar("number");
        assert!(r.validate_value(&Value::Number(f64::NAN), &ann).is_err());
        assert!(r
            .validate_value(&Value::Number(f64::INFINITY), &ann)
            .is_err());
        assert!(r.validate_value(&Value::Number(3.0), &ann).is_ok());
    }

    #[test]
    fn null_rejected_for_boolean_accepted_elsewhere() {
        let r = TypeRegistry::with_builtins();
        assert!(r
            .validate_value(&Value::Null, &TypeAnnotation::scalar("boolean"))
            .is_err());
        assert!(r
            .validate_value(&Value::Null, &TypeAnnotation::scalar("text"))
            .is_ok());
        assert!(r
            .validate_value(&Value::Null, &TypeAnnotation::scalar("json"))
            .is_ok());
    }

    #[test]
    fn text_to_json_parses_object_rejects_array() {
        let r = TypeRegistry::with_builtins();
        let ann = TypeAnnotation::scalar("json");
        let ok = r.validate_value(&Value::Text("{\"a\":1}".into()), &ann);
        assert!(ok.is_ok());
        let bad = r.validate_value(&Value::Text("[1,2]".into()), &ann);
        assert!(bad.is_err());
    }

    #[test]
    fn array_validation_recurses_element_wise() {
        let r = TypeRegistry::with_builtins();
        let ann = TypeAnnotation::array_of("number", 1);
        let arr = Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert!(r.validate_value(&arr, &ann).is_ok());
        let bad_arr = Value::Array(vec![Value::Number(1.0), Value::Text("x".into())]);
        assert!(r.validate_value(&bad_arr, &ann).is_err());
    }

    #[test]
    fn infer_from_host_value_primitive() {
        let r = TypeRegistry::with_builtins();
        assert_eq!(
            r.infer_from_host_value(&JsonValue::String("x".into())),
            Some(TypeAnnotation::scalar("text"))
        );
        assert_eq!(
            r.infer_from_host_value(&JsonValue::Bool(true)),
            Some(TypeAnnotation::scalar("boolean"))
        );
    }
}
