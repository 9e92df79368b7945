//! Single-file find/replace: one old/new string pair, rejecting ambiguous
//! matches the same way a multi-file edit tool rejects a non-unique
//! `old_string` — this is the single-file subset of that behavior.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::tools::sandbox::resolve_path_under;
use crate::tools::{ToolError, ToolSpec, VibeTool};

pub struct EditFileTool {
    working_folder: Arc<PathBuf>,
}

impl EditFileTool {
    pub fn new(working_folder: Arc<PathBuf>) -> Self {
        Self { working_folder }
    }
}

#[async_trait]
impl VibeTool for EditFileTool {
    fn name(&self) -> &str {
        "editFile"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Replace an exact substring in a file. Fails if the substring occurs \
                zero or more than once, unless replaceAll is set."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "oldString": {"type": "string"},
                    "newString": {"type": "string"},
                    "replaceAll": {"type": "boolean", "default": false},
                },
                "required": ["path", "oldString", "newString"],
            }),
        }
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"path\"".into()))?;
        let old_string = args
            .get("oldString")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"oldString\"".into()))?;
        let new_string = args
            .get("newString")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"newString\"".into()))?;
        let replace_all = args
            .get("replaceAll")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let resolved = resolve_path_under(&self.working_folder, path)?;
        let original = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::Io(format!("{path}: {e}")))?;

        let occurrences = original.matches(old_string).count();
        if occurrences == 0 {
            return Err(ToolError::NotFound(format!(
                "oldString not found in {path}"
            )));
        }
        if occurrences > 1 && !replace_all {
            return Err(ToolError::Other(format!(
                "oldString occurs {occurrences} times in {path}; pass replaceAll or a more \
                 specific match"
            )));
        }

        let updated = if replace_all {
            original.replace(old_string, new_string)
        } else {
            original.replacen(old_string, new_string, 1)
        };
        tokio::fs::write(&resolved, &updated).await?;

        Ok(json!({"path": path, "replacements": if replace_all { occurrences } else { 1 }}))
    }
}
