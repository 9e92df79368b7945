//! The context formatter: the sole place that turns a [`Frame`] chain into
//! the text an AI call (or a human, via `--log-ai`) actually reads. Kept as
//! free functions rather than a trait impl since there is exactly one
//! serializer, the same choice made for stream formatting elsewhere.
//! Line shapes follow §4.B literally: frame headers (`<entry> (entry)`,
//! `name (depth N)`, `name (current scope)`), `- name (type): value`
//! variable lines, `--> aiType: "prompt"` / `<-- name (type): response`
//! paired prompt/variable lines, and two-line `[tool]`/`[result]` tool calls.

use super::{Frame, OrderedEntry, Source};
use crate::interp::ast::TypeAnnotation;
use crate::value::Value;

/// Tunes what [`format_entries`] includes.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Caps how many trailing entries per frame are rendered; `None` renders
    /// everything. Supplements §4.B with a windowing knob for long-running
    /// programs, noted as an implementation addition in SPEC_FULL.md.
    pub window: Option<usize>,
    /// When true, `prompt`-*typed* variables (`Value::Prompt` bindings) are
    /// excluded (§4.B: "prompt-typed variables are excluded from AI
    /// context... they are instructions, not state"). This is distinct from
    /// the `prompt`/`variable` ordered-entry *pair* recording a `do`/`ask`
    /// exchange, which is always rendered — it is exactly the history the
    /// next AI call needs to see.
    pub for_ai: bool,
    /// Optional instruction header prepended before the first frame, for
    /// live AI calls (§4.B: "Optional header with instructions is prepended
    /// for live AI calls").
    pub header: Option<String>,
}

impl ContextOptions {
    pub fn for_ai() -> Self {
        Self {
            window: None,
            for_ai: true,
            header: None,
        }
    }

    pub fn for_humans() -> Self {
        Self {
            window: None,
            for_ai: false,
            header: None,
        }
    }
}

/// Renders a frame chain as deterministic, nested, indented text (§4.B
/// "Formatter"). `model`-typed variables are excluded from every view;
/// `prompt`-typed variables are additionally excluded when `opts.for_ai` is
/// set. Frames and ordering are preserved bit-exactly for identical input.
pub fn format_entries(frames: &[Frame], opts: &ContextOptions) -> String {
    let mut out = String::new();
    if let Some(header) = &opts.header {
        out.push_str(header);
        out.push_str("\n\n");
    }
    for (i, frame) in frames.iter().enumerate() {
        let depth = frame.depth;
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        out.push_str(&frame_header(frame, i == frames.len() - 1));
        out.push('\n');

        let entries = windowed(&frame.entries, opts.window);
        let mut prev_was_ai_prompt = false;
        for entry in entries {
            let paired = prev_was_ai_prompt && matches!(entry, OrderedEntry::Variable { source: Source::Ai, .. });
            if let Some(lines) = render_entry(entry, opts, paired) {
                for line in lines {
                    out.push_str(&indent);
                    out.push_str("  ");
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            prev_was_ai_prompt = matches!(entry, OrderedEntry::Prompt { .. });
        }
    }
    out
}

fn frame_header(frame: &Frame, is_innermost: bool) -> String {
    if frame.depth == 0 {
        "<entry> (entry)".to_string()
    } else if is_innermost {
        format!("{} (current scope)", frame.name)
    } else {
        format!("{} (depth {})", frame.name, frame.depth)
    }
}

fn windowed(entries: &[OrderedEntry], window: Option<usize>) -> &[OrderedEntry] {
    match window {
        Some(n) if entries.len() > n => &entries[entries.len() - n..],
        _ => entries,
    }
}

/// `(type)` is omitted when the binding carries no declared annotation and
/// its value is plain `text` (§4.B) — the common, untyped-string case.
fn type_suffix(ty: &Option<TypeAnnotation>) -> String {
    match ty {
        Some(t) if !(t.array_depth == 0 && t.base == "text") => format!(" ({t})"),
        _ => String::new(),
    }
}

fn render_entry(entry: &OrderedEntry, opts: &ContextOptions, paired: bool) -> Option<Vec<String>> {
    match entry {
        OrderedEntry::Variable { name, value, ty, .. } => {
            if matches!(value, Value::Model(_)) {
                return None;
            }
            if opts.for_ai && matches!(value, Value::Prompt(_)) {
                return None;
            }
            let json = serde_json::to_string(&value.to_display_json()).unwrap_or_default();
            let suffix = type_suffix(ty);
            if paired {
                Some(vec![format!("<-- {name}{suffix}: {json}")])
            } else {
                Some(vec![format!("- {name}{suffix}: {json}")])
            }
        }
        OrderedEntry::Prompt { ai_type, text } => {
            let quoted = serde_json::to_string(text).unwrap_or_default();
            Some(vec![format!("--> {ai_type}: {quoted}")])
        }
        OrderedEntry::ToolCall { name, args, result } => {
            let call = format!("[tool] {name}({args})");
            let outcome = match result {
                Ok(rendered) => format!("[result] {rendered}"),
                Err(message) => format!("[error] {message}"),
            };
            Some(vec![call, outcome])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::ast::Location;

    fn frame_with(entries: Vec<OrderedEntry>) -> Frame {
        let mut f = Frame::new("main", Location::synthetic());
        f.entries = entries;
        f
    }

    fn var(name: &str, value: Value) -> OrderedEntry {
        OrderedEntry::Variable {
            name: name.into(),
            value,
            ty: None,
            source: Source::Code,
        }
    }

    #[test]
    fn entry_frame_header_is_always_entry_label() {
        let f = frame_with(vec![]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.starts_with("<entry> (entry)\n"));
    }

    #[test]
    fn non_entry_innermost_frame_is_current_scope() {
        let mut entry = frame_with(vec![]);
        entry.depth = 0;
        let mut callee = frame_with(vec![]);
        callee.name = "f".into();
        callee.depth = 1;
        let rendered = format_entries(&[entry, callee], &ContextOptions::for_ai());
        assert!(rendered.contains("f (current scope)"));
    }

    #[test]
    fn model_variables_excluded_from_every_view() {
        let f = frame_with(vec![var(
            "m",
            Value::Model(crate::value::ModelRecord {
                provider: "openai".into(),
                config: Default::default(),
                tools: vec![],
            }),
        )]);
        let ai = format_entries(&[f.clone()], &ContextOptions::for_ai());
        let human = format_entries(&[f], &ContextOptions::for_humans());
        assert!(!ai.contains("m:"));
        assert!(!human.contains("m:"));
    }

    #[test]
    fn prompt_typed_variables_excluded_only_from_ai_view() {
        let f = frame_with(vec![var("p", Value::Prompt("hello".into()))]);
        let ai = format_entries(&[f.clone()], &ContextOptions::for_ai());
        let human = format_entries(&[f], &ContextOptions::for_humans());
        assert!(!ai.contains("- p"));
        assert!(human.contains("- p"));
    }

    #[test]
    fn prompt_entries_are_never_filtered_from_ai_context() {
        let f = frame_with(vec![
            OrderedEntry::Prompt {
                ai_type: "do",
                text: "hi".into(),
            },
            OrderedEntry::Variable {
                name: "r".into(),
                value: Value::Text("HELLO".into()),
                ty: None,
                source: Source::Ai,
            },
        ]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.contains("--> do: \"hi\""));
    }

    #[test]
    fn variable_right_after_ai_prompt_renders_paired() {
        let f = frame_with(vec![
            OrderedEntry::Prompt {
                ai_type: "do",
                text: "hi".into(),
            },
            OrderedEntry::Variable {
                name: "r".into(),
                value: Value::Text("HELLO".into()),
                ty: None,
                source: Source::Ai,
            },
        ]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.contains("<-- r: \"HELLO\""));
        assert!(!rendered.contains("- r:"));
    }

    #[test]
    fn variable_not_from_ai_is_not_paired_even_after_a_prompt() {
        let f = frame_with(vec![
            OrderedEntry::Prompt {
                ai_type: "do",
                text: "hi".into(),
            },
            var("other", Value::Number(1.0)),
        ]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.contains("- other: 1"));
    }

    #[test]
    fn tool_call_renders_as_two_lines() {
        let f = frame_with(vec![OrderedEntry::ToolCall {
            name: "readFile".into(),
            args: serde_json::json!({"path": "x.txt"}),
            result: Err("not found".into()),
        }]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.contains("[tool] readFile("));
        assert!(rendered.contains("[error] not found"));
    }

    #[test]
    fn type_suffix_shown_for_declared_non_text_types() {
        let f = frame_with(vec![OrderedEntry::Variable {
            name: "n".into(),
            value: Value::Number(14.0),
            ty: Some(TypeAnnotation::scalar("number")),
            source: Source::Code,
        }]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.contains("- n (number): 14"));
    }

    #[test]
    fn type_suffix_omitted_for_unannotated_text() {
        let f = frame_with(vec![var("x", Value::Text("hi".into()))]);
        let rendered = format_entries(&[f], &ContextOptions::for_ai());
        assert!(rendered.contains("- x: \"hi\""));
    }

    #[test]
    fn window_keeps_only_trailing_entries() {
        let entries = (0..5).map(|i| var(&format!("v{i}"), Value::Number(i as f64))).collect();
        let f = frame_with(entries);
        let opts = ContextOptions {
            window: Some(2),
            for_ai: true,
            header: None,
        };
        let rendered = format_entries(&[f], &opts);
        assert!(!rendered.contains("v0:"));
        assert!(!rendered.contains("v2:"));
        assert!(rendered.contains("v3:"));
        assert!(rendered.contains("v4:"));
    }
}
