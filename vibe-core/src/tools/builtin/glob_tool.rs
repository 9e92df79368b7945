//! Recursive pattern matching under the sandbox root. Grounded directly in
//! the teacher's `loom/src/tools/file/glob.rs`, which builds its own
//! `GlobTool` on the same two crates: `walkdir` for the recursive walk,
//! `glob::Pattern` for matching.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;
use serde_json::{json, Value as JsonValue};
use walkdir::WalkDir;

use crate::tools::{ToolError, ToolSpec, VibeTool};

pub struct GlobTool {
    working_folder: Arc<PathBuf>,
}

impl GlobTool {
    pub fn new(working_folder: Arc<PathBuf>) -> Self {
        Self { working_folder }
    }
}

#[async_trait]
impl VibeTool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "List files under the working folder whose relative path matches a \
                glob pattern (e.g. \"src/**/*.rs\")."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                },
                "required": ["pattern"],
            }),
        }
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let pattern_str = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"pattern\"".into()))?;
        let pattern = Pattern::new(pattern_str)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid pattern: {e}")))?;

        let root = self
            .working_folder
            .canonicalize()
            .map_err(|e| ToolError::Io(e.to_string()))?;

        let mut matches = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(&root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if pattern.matches_path(relative) {
                matches.push(relative.display().to_string());
            }
        }
        matches.sort();

        Ok(json!({"pattern": pattern_str, "matches": matches}))
    }
}
