//! Debug/interaction event payloads, wrapped by [`crate::envelope`] the same
//! way graph events get wrapped elsewhere. §6 "Debug interface (summary)"
//! names the event set literally: `stopped{reason}`, `output{text,category}`,
//! `terminated`, `breakpoint{verified}`. The remaining variants are the
//! ambient AI-call/tool-dispatch logging a driver needs for `--log-ai`,
//! grounded in `MessageChunk`/`Usage`-style streaming events —
//! one event per request, response, and tool dispatch rather than per token,
//! since the runtime has no token-level streaming boundary to report.

use serde::Serialize;
use serde_json::Value;

/// One event on the debug/interaction channel (type + payload). Matches §6
/// literally for the four debug-interface events; envelope fields
/// (session_id, node_id, event_id) are applied separately by
/// [`crate::envelope`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Execution paused at a suspension point or a breakpoint (§6).
    Stopped { reason: String },
    /// Program-visible output, e.g. a tool's stdout-like observation or a
    /// driver's own status line; `category` distinguishes them (`"stdout"`,
    /// `"stderr"`, `"console"`).
    Output { text: String, category: String },
    /// The program reached `completed` or `failed`; no further events follow.
    Terminated,
    /// A requested breakpoint was (or was not) resolved against the AST.
    Breakpoint { verified: bool },

    /// A model invocation is about to be sent (`--log-ai`). `context` is
    /// omitted here (it is already visible via [`Self::Output`] in
    /// human-readable form); only the prompt and target model are logged.
    AiRequest { model: String, prompt: String },
    /// The model's reply: either final text or the tool calls it asked for.
    AiResponse {
        message: Option<String>,
        tool_call_names: Vec<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// One resolved tool dispatch, result already rendered to text.
    ToolCall {
        name: String,
        args: Value,
        result: Result<String, String>,
    },
}

impl ProtocolEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_serializes_with_snake_case_tag() {
        let v = ProtocolEvent::Stopped { reason: "breakpoint".into() }
            .to_value()
            .unwrap();
        assert_eq!(v["type"], "stopped");
        assert_eq!(v["reason"], "breakpoint");
    }

    #[test]
    fn tool_call_carries_err_variant_as_structured_result() {
        let v = ProtocolEvent::ToolCall {
            name: "readFile".into(),
            args: serde_json::json!({"path": "x"}),
            result: Err("not found".into()),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "tool_call");
        assert!(v.to_string().contains("not found"));
    }
}
