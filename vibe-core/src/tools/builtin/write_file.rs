//! Writes a file under the sandbox root, creating parent directories as
//! needed. Grounded in the same file-tool family as [`super::read_file`];
//! the write-side counterpart of the same native-tool set.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::tools::sandbox::resolve_path_under;
use crate::tools::{ToolError, ToolSpec, VibeTool};

pub struct WriteFileTool {
    working_folder: Arc<PathBuf>,
}

impl WriteFileTool {
    pub fn new(working_folder: Arc<PathBuf>) -> Self {
        Self { working_folder }
    }
}

#[async_trait]
impl VibeTool for WriteFileTool {
    fn name(&self) -> &str {
        "writeFile"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Write text content to a file in the program's working folder, \
                creating it (and parent directories) if needed."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the working folder"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            }),
        }
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"path\"".into()))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"content\"".into()))?;

        let resolved = resolve_path_under(&self.working_folder, path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, content).await?;

        Ok(json!({"path": path, "bytesWritten": content.len()}))
    }
}
