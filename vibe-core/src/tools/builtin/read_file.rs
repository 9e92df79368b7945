//! `cat -n`-style numbered output, offset/limit pagination, per-line
//! truncation for very long lines — the shape of the native file-read tool
//! in this tool family.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::tools::sandbox::resolve_path_under;
use crate::tools::{ToolError, ToolSpec, VibeTool};

const MAX_LINE_LENGTH: usize = 2000;
const DEFAULT_READ_LIMIT: usize = 2000;

pub struct ReadFileTool {
    working_folder: Arc<PathBuf>,
}

impl ReadFileTool {
    pub fn new(working_folder: Arc<PathBuf>) -> Self {
        Self { working_folder }
    }
}

#[async_trait]
impl VibeTool for ReadFileTool {
    fn name(&self) -> &str {
        "readFile"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Read a text file from the program's working folder, with optional \
                line offset and limit."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the working folder"},
                    "offset": {"type": "integer", "description": "0-based line to start from", "default": 0},
                    "limit": {"type": "integer", "description": "Maximum lines to return", "default": DEFAULT_READ_LIMIT},
                },
                "required": ["path"],
            }),
        }
    }

    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"path\"".into()))?;
        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_READ_LIMIT as u64) as usize;

        let resolved = resolve_path_under(&self.working_folder, path)?;
        let contents = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::Io(format!("{path}: {e}")))?;

        let lines: Vec<&str> = contents.lines().collect();
        let total = lines.len();
        let window = lines
            .iter()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(i, line)| {
                let n = offset + i + 1;
                if line.len() > MAX_LINE_LENGTH {
                    format!("{:>6}\t{}... [truncated]", n, &line[..MAX_LINE_LENGTH])
                } else {
                    format!("{:>6}\t{}", n, line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(json!({
            "path": path,
            "totalLines": total,
            "offset": offset,
            "content": window,
        }))
    }
}
